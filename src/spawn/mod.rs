//! Privilege-separation process model.
//!
//! The listener accepts TCP connections and hands each one to a freshly
//! spawned protocol-handler via inherited file descriptors. After the
//! handler authenticates, a per-connection dispatcher forks a mail-session
//! under the authenticated user's uid/gid.
//!
//! fd layout in the protocol-handler child:
//!
//! ```text
//! fd 3  TCP socket (from listener)
//! fd 4  write-only: protocol-handler writes the auth signal to the dispatcher
//! fd 5  read-only:  protocol-handler reads mail-session responses
//! fd 6  write-only: protocol-handler writes mail-session commands
//! ```
//!
//! The dispatcher holds the peer ends: the auth pipe read side, the
//! mail-session stdin read side, and the mail-session stdout write side.

pub mod authsignal;
pub mod creds;

use crate::config::ListenerConfig;
use crate::error::{Pop3Error, Result};
use crate::spawn::authsignal::read_auth_signal;
use crate::spawn::creds::lookup_credentials;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Accepts connections on the configured addresses and spawns one
/// protocol-handler subprocess per connection.
#[derive(Clone)]
pub struct SubprocessServer {
    listeners: Vec<ListenerConfig>,
    exec_path: PathBuf,
    config_path: PathBuf,
    domains_root: Option<PathBuf>,
    mail_session_path: Option<PathBuf>,
}

impl SubprocessServer {
    /// `exec_path` is the pop3-rs binary itself (spawned with the
    /// `protocol-handler` subcommand); `config_path` is forwarded to each
    /// handler. `domains_root` and `mail_session_path` enable mail-session
    /// spawning; leaving either unset disables it.
    pub fn new(
        listeners: Vec<ListenerConfig>,
        exec_path: PathBuf,
        config_path: PathBuf,
        domains_root: Option<PathBuf>,
        mail_session_path: Option<PathBuf>,
    ) -> Self {
        Self {
            listeners,
            exec_path,
            config_path,
            domains_root,
            mail_session_path,
        }
    }

    /// Bind all listeners and accept until `shutdown` fires. In-flight
    /// sessions drain on their own; only the accept sockets close here.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut bound = Vec::with_capacity(self.listeners.len());
        for lc in &self.listeners {
            let listener = TcpListener::bind(&lc.address).await.map_err(|e| {
                Pop3Error::Config(format!("listen {}: {}", lc.address, e))
            })?;
            info!(address = %lc.address, mode = lc.mode.as_str(), "listening");
            bound.push((listener, lc.clone()));
        }

        let mut handles = Vec::with_capacity(bound.len());
        for (listener, lc) in bound {
            let server = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                server.accept_loop(listener, lc, shutdown).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("listener stopped");
        Ok(())
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        lc: ListenerConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((conn, addr)) => {
                        if let Err(e) = self.spawn_handler(conn, addr, &lc) {
                            error!(address = %lc.address, error = %e, "failed to spawn protocol-handler");
                        }
                    }
                    Err(e) => {
                        error!(address = %lc.address, error = %e, "accept error");
                    }
                },
                _ = shutdown.changed() => {
                    info!(address = %lc.address, "closing listener");
                    return;
                }
            }
        }
    }

    /// Allocate the three pipe pairs, spawn the protocol-handler with fds
    /// 3–6, and start the dispatcher for this connection. On any failure
    /// every fd allocated so far is closed when it drops; the connection is
    /// dropped without a response.
    fn spawn_handler(&self, conn: TcpStream, addr: SocketAddr, lc: &ListenerConfig) -> Result<()> {
        let client_ip = addr.ip().to_string();

        let socket = conn.into_std()?;
        socket.set_nonblocking(false)?;

        //  auth_r      (dispatcher reads)    ←  auth_w      (child fd 4)
        //  from_sess_r (child fd 5)          ←  from_sess_w (mail-session stdout)
        //  to_sess_r   (mail-session stdin)  ←  to_sess_w   (child fd 6)
        let (auth_r, auth_w) = make_pipe()?;
        let (from_sess_r, from_sess_w) = make_pipe()?;
        let (to_sess_r, to_sess_w) = make_pipe()?;

        let mut cmd = Command::new(&self.exec_path);
        cmd.arg("protocol-handler")
            .arg("--config")
            .arg(&self.config_path);
        cmd.env_clear();
        cmd.env("POP3D_CLIENT_IP", &client_ip);
        cmd.env("POP3D_LISTENER_MODE", lc.mode.as_str());
        for key in ["PATH", "HOME", "USER", "TMPDIR", "TMP", "TEMP"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.stdin(Stdio::null());
        cmd.stderr(Stdio::inherit());

        let sources = [
            socket.as_raw_fd(),
            auth_w.as_raw_fd(),
            from_sess_r.as_raw_fd(),
            to_sess_w.as_raw_fd(),
        ];
        unsafe {
            cmd.pre_exec(move || place_inherited_fds(&sources));
        }

        let child = cmd.spawn()?;

        // The child owns its copies now; release ours.
        drop(socket);
        drop(auth_w);
        drop(from_sess_r);
        drop(to_sess_w);

        debug!(
            pid = child.id(),
            client_ip,
            mode = lc.mode.as_str(),
            "spawned protocol-handler"
        );

        let domains_root = self.domains_root.clone();
        let mail_session_path = self.mail_session_path.clone();
        tokio::task::spawn_blocking(move || {
            dispatch_session(
                child,
                auth_r,
                to_sess_r,
                from_sess_w,
                client_ip,
                domains_root,
                mail_session_path,
            );
        });

        Ok(())
    }
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (r, w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Pop3Error::Pipe(format!("create pipe: {e}")))?;
    Ok(unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) })
}

/// Place the four inherited fds at 3–6 in the child. Runs between fork and
/// exec, so only async-signal-safe calls are allowed.
///
/// Every source is first duplicated above the target range so a source
/// sitting at 3–6 cannot be clobbered before it has been copied. The
/// temporaries carry FD_CLOEXEC and vanish at exec; dup2 clears the flag on
/// the final fds.
fn place_inherited_fds(sources: &[RawFd; 4]) -> std::io::Result<()> {
    let mut staged = [0 as RawFd; 4];
    for (i, &fd) in sources.iter().enumerate() {
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 10) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error());
        }
        staged[i] = dup;
    }
    for (i, &fd) in staged.iter().enumerate() {
        if unsafe { libc::dup2(fd, 3 + i as RawFd) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Per-connection dispatcher: wait for the auth signal, fork the
/// mail-session under the resolved uid/gid, then reap both children. Runs
/// on the blocking pool; everything here may block.
fn dispatch_session(
    mut handler: Child,
    auth_r: OwnedFd,
    to_sess_r: OwnedFd,
    from_sess_w: OwnedFd,
    client_ip: String,
    domains_root: Option<PathBuf>,
    mail_session_path: Option<PathBuf>,
) {
    let mail_session = await_signal_and_spawn(
        auth_r,
        to_sess_r,
        from_sess_w,
        &client_ip,
        domains_root.as_deref(),
        mail_session_path.as_deref(),
    );

    match handler.wait() {
        Ok(status) => debug!(client_ip, %status, "protocol-handler exited"),
        Err(e) => debug!(client_ip, error = %e, "protocol-handler wait failed"),
    }

    if let Some(mut mail_session) = mail_session {
        match mail_session.wait() {
            Ok(status) => debug!(client_ip, %status, "mail-session exited"),
            Err(e) => debug!(client_ip, error = %e, "mail-session wait failed"),
        }
    }
}

/// Read one auth signal and spawn the mail-session. Returning early on any
/// failure drops the remaining pipe ends, which the protocol-handler
/// observes as EOF on its next store operation.
fn await_signal_and_spawn(
    auth_r: OwnedFd,
    to_sess_r: OwnedFd,
    from_sess_w: OwnedFd,
    client_ip: &str,
    domains_root: Option<&Path>,
    mail_session_path: Option<&Path>,
) -> Option<Child> {
    // EOF before a complete signal means the handler exited without
    // authenticating (wrong password, timeout, crash).
    let mut reader = BufReader::new(File::from(auth_r));
    let signal = match read_auth_signal(&mut reader) {
        Ok(signal) => signal,
        Err(e) => {
            debug!(client_ip, reason = %e, "no auth signal received");
            return None;
        }
    };
    debug!(client_ip, username = signal.username, "received auth signal");

    let (Some(domains_root), Some(mail_session_path)) = (domains_root, mail_session_path) else {
        debug!(client_ip, "mail-session not configured, skipping spawn");
        return None;
    };

    let creds = match lookup_credentials(domains_root, &signal.username) {
        Ok(creds) => creds,
        Err(e) => {
            error!(client_ip, username = signal.username, error = %e, "credential lookup failed");
            return None;
        }
    };

    let mut cmd = Command::new(mail_session_path);
    cmd.arg("--type")
        .arg("maildir")
        .arg("--basepath")
        .arg(&creds.base_path);
    cmd.stdin(Stdio::from(File::from(to_sess_r)));
    cmd.stdout(Stdio::from(File::from(from_sess_w)));
    cmd.stderr(Stdio::inherit());
    cmd.uid(creds.uid);
    cmd.gid(creds.gid);

    match cmd.spawn() {
        Ok(child) => {
            debug!(
                client_ip,
                username = signal.username,
                pid = child.id(),
                uid = creds.uid,
                gid = creds.gid,
                "spawned mail-session"
            );
            Some(child)
        }
        Err(e) => {
            error!(client_ip, username = signal.username, error = %e, "failed to start mail-session");
            None
        }
    }
}
