use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pop3_rs::config::{Config, ListenerMode};
use pop3_rs::metrics::NoopCollector;
use pop3_rs::pop3::{run_session, CommandRegistry, ConnectionConfig, Session};
use pop3_rs::security::{DomainAuthenticator, TlsConfig};
use pop3_rs::spawn::SubprocessServer;
use pop3_rs::storage::SessionPipeStore;
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// File descriptor layout in the protocol-handler subprocess, as placed by
/// the listener parent.
const CONN_FD: RawFd = 3;
const AUTH_PIPE_FD: RawFd = 4;
const FROM_SESS_FD: RawFd = 5;
const TO_SESS_FD: RawFd = 6;

#[derive(Parser)]
#[command(name = "pop3-rs", about = "Privilege-separated POP3 server", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the listener: accept connections and spawn protocol-handlers.
    Serve {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run one POP3 session on inherited fds 3-6. Spawned by `serve`; not
    /// intended to be started by hand.
    ProtocolHandler {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => run_serve(config),
        Commands::ProtocolHandler { config } => run_protocol_handler(config),
    }
}

fn init_tracing(level: &str) {
    let level = match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    let config = if path.exists() {
        Config::from_file(path)?
    } else {
        Config::default()
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run_serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    init_tracing(&config.log_level);

    info!("Starting pop3-rs listener");
    info!("  Hostname: {}", config.hostname);
    for lc in &config.listeners {
        info!("  Listener: {} ({})", lc.address, lc.mode.as_str());
    }

    // Subprocesses must find the config regardless of their cwd.
    let config_path = std::fs::canonicalize(&config_path).unwrap_or(config_path);
    let exec_path = std::env::current_exe().context("determining executable path")?;

    let mail_session_path = config.domains.mail_session_path.clone().or_else(|| {
        let sibling = exec_path.parent()?.join("mail-session");
        sibling.exists().then_some(sibling)
    });
    match &mail_session_path {
        Some(path) => info!("  Mail-session binary: {}", path.display()),
        None => info!("  Mail-session spawning disabled"),
    }

    let server = SubprocessServer::new(
        config.listeners.clone(),
        exec_path,
        config_path,
        config.domains.path.clone(),
        mail_session_path,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received signal, shutting down");
            let _ = tx.send(true);
        });
        server.run(rx).await
    })?;

    info!("POP3 server stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

fn run_protocol_handler(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    init_tracing(&config.log_level);

    // Connection metadata supplied by the parent listener process.
    let client_ip = std::env::var("POP3D_CLIENT_IP").unwrap_or_default();
    let mode = std::env::var("POP3D_LISTENER_MODE")
        .ok()
        .and_then(|m| m.parse::<ListenerMode>().ok())
        .unwrap_or(ListenerMode::Pop3);

    debug!(client_ip, mode = mode.as_str(), "protocol-handler started");

    let tls_config = match (&config.tls.cert_file, &config.tls.key_file) {
        (Some(cert), Some(key)) => {
            Some(TlsConfig::from_pem_files(cert, key).context("loading TLS certificate")?)
        }
        _ => None,
    };
    if mode == ListenerMode::Pop3s && tls_config.is_none() {
        bail!("POP3S mode requires TLS configuration");
    }

    let domains_root = config
        .domains
        .path
        .clone()
        .context("domains.path is required for authentication")?;

    // Session pipe fds inherited from the dispatcher parent. The store owns
    // them for the rest of the process lifetime; no other code touches
    // these descriptors.
    let store = {
        let auth_pipe = unsafe { std::fs::File::from_raw_fd(AUTH_PIPE_FD) };
        let from_sess = unsafe { std::fs::File::from_raw_fd(FROM_SESS_FD) };
        let to_sess = unsafe { std::fs::File::from_raw_fd(TO_SESS_FD) };
        SessionPipeStore::new(Box::new(auth_pipe), Box::new(from_sess), Box::new(to_sess))
    };

    let registry = CommandRegistry::new(Arc::new(DomainAuthenticator::new(domains_root)));
    let conn_cfg = ConnectionConfig::from_timeouts(&config.timeouts);

    // Reconstruct the TCP connection from fd 3.
    let socket = unsafe { std::net::TcpStream::from_raw_fd(CONN_FD) };
    socket
        .set_nonblocking(true)
        .context("reconstructing connection")?;

    // One session per process; a single-threaded runtime is all it needs.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async move {
        let stream =
            tokio::net::TcpStream::from_std(socket).context("reconstructing connection")?;
        let collector = NoopCollector;

        match mode {
            ListenerMode::Pop3s => {
                // Implicit TLS before any POP3 bytes.
                let acceptor = tls_config.as_ref().expect("validated above").acceptor();
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .context("implicit TLS handshake")?;
                let sess = Session::new(
                    config.hostname.clone(),
                    mode,
                    true,
                    true,
                    Some(Box::new(store)),
                );
                run_session(tls_stream, sess, &registry, None, &conn_cfg, &collector)
                    .await
                    .map_err(anyhow::Error::from)
            }
            ListenerMode::Pop3 => {
                let acceptor = tls_config.as_ref().map(TlsConfig::acceptor);
                let sess = Session::new(
                    config.hostname.clone(),
                    mode,
                    tls_config.is_some(),
                    false,
                    Some(Box::new(store)),
                );
                run_session(stream, sess, &registry, acceptor, &conn_cfg, &collector)
                    .await
                    .map_err(anyhow::Error::from)
            }
        }
    });

    // A mid-session failure is not a setup failure; log it and exit cleanly.
    if let Err(e) = result {
        debug!(client_ip, error = %e, "session ended with error");
    }
    Ok(())
}
