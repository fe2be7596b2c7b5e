//! Per-connection POP3 command loop.
//!
//! Strictly serial: read one command, produce one response, flush, repeat.
//! The loop owns the two socket timeouts, routes lines to the SASL exchange
//! when one is in progress, performs the STLS upgrade, and applies pending
//! deletions once QUIT has moved the session to UPDATE.

use crate::config::TimeoutsConfig;
use crate::error::{Pop3Error, Result};
use crate::metrics::Collector;
use crate::pop3::commands::{apply_pending_deletions, parse_command, CommandRegistry};
use crate::pop3::response::Response;
use crate::pop3::session::{Session, State};
use crate::pop3::stream::Pop3Stream;
use crate::utils::address::extract_domain;
use std::mem;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Maximum accepted command line, including CRLF. The bound is enforced
/// while the line is being read, so an unterminated line cannot grow the
/// buffer past it. Longer lines get one `-ERR` and the connection is
/// closed.
const MAX_LINE_LENGTH: usize = 8192;

/// Socket timeouts for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum time between commands.
    pub idle_timeout: Duration,
    /// Maximum time to receive a single complete command line.
    pub command_timeout: Duration,
}

impl ConnectionConfig {
    pub fn from_timeouts(timeouts: &TimeoutsConfig) -> Self {
        Self {
            idle_timeout: timeouts.idle_timeout(),
            command_timeout: timeouts.command_timeout(),
        }
    }
}

enum SessionResult {
    Quit,
    UpgradeTls,
}

enum LineRead {
    Line,
    Eof,
    Overflow,
}

/// Read one command line into `line`, checking the length bound chunk by
/// chunk as bytes arrive rather than after the full line is buffered.
async fn read_bounded_line<R>(reader: &mut R, line: &mut String) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(LineRead::Eof);
            }
            // EOF mid-line: hand back what arrived; the next read reports
            // the EOF.
            break;
        }

        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&available[..=pos]);
            reader.consume(pos + 1);
            if buf.len() > MAX_LINE_LENGTH {
                return Ok(LineRead::Overflow);
            }
            break;
        }

        if buf.len() + available.len() > MAX_LINE_LENGTH {
            let n = available.len();
            reader.consume(n);
            return Ok(LineRead::Overflow);
        }
        let n = available.len();
        buf.extend_from_slice(available);
        reader.consume(n);
    }

    line.push_str(&String::from_utf8_lossy(&buf));
    Ok(LineRead::Line)
}

/// Run one POP3 session to completion on the given stream.
///
/// For pop3s listeners the caller performs the implicit TLS accept first and
/// constructs the session with TLS active; `acceptor` is only used for the
/// STLS upgrade path.
pub async fn run_session<S>(
    stream: S,
    mut sess: Session,
    registry: &CommandRegistry,
    acceptor: Option<TlsAcceptor>,
    cfg: &ConnectionConfig,
    collector: &dyn Collector,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    collector.connection_opened();
    let result = session_loop(stream, &mut sess, registry, acceptor, cfg, collector).await;
    sess.cleanup();
    collector.connection_closed();
    result
}

async fn session_loop<S>(
    stream: S,
    sess: &mut Session,
    registry: &CommandRegistry,
    acceptor: Option<TlsAcceptor>,
    cfg: &ConnectionConfig,
    collector: &dyn Collector,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut stream = Pop3Stream::Plain(stream);

    info!(
        state = %sess.state(),
        tls_state = %sess.tls_state(),
        "starting POP3 session"
    );

    let greeting = format!("+OK {} POP3 server ready\r\n", sess.hostname());
    stream.write_all(greeting.as_bytes()).await?;
    stream.flush().await?;

    let mut idle_deadline = Instant::now() + cfg.idle_timeout;

    loop {
        match process_commands(&mut stream, sess, registry, cfg, collector, &mut idle_deadline)
            .await?
        {
            SessionResult::Quit => {
                if sess.state() == State::Update {
                    apply_pending_deletions(sess);
                }
                return Ok(());
            }
            SessionResult::UpgradeTls => {
                let Some(acceptor) = acceptor.as_ref() else {
                    return Err(Pop3Error::Tls(
                        "no TLS configuration available".to_string(),
                    ));
                };
                let plain = match mem::replace(&mut stream, Pop3Stream::Upgrading) {
                    Pop3Stream::Plain(s) => s,
                    _ => {
                        return Err(Pop3Error::Tls(
                            "STLS on an already-encrypted stream".to_string(),
                        ))
                    }
                };
                match acceptor.accept(plain).await {
                    Ok(tls) => {
                        stream = Pop3Stream::Tls(Box::new(tls));
                        sess.set_tls_active();
                        collector.tls_established();
                        info!(tls_state = %sess.tls_state(), "TLS upgrade successful");
                    }
                    Err(e) => {
                        // No recovery once the upgrade was acknowledged.
                        error!(error = %e, "TLS handshake failed");
                        return Err(Pop3Error::Tls(format!("STLS handshake: {e}")));
                    }
                }
            }
        }
    }
}

async fn process_commands<S>(
    stream: &mut Pop3Stream<S>,
    sess: &mut Session,
    registry: &CommandRegistry,
    cfg: &ConnectionConfig,
    collector: &dyn Collector,
    idle_deadline: &mut Instant,
) -> Result<SessionResult>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // The reader must be dropped to regain the stream for an STLS upgrade;
    // &mut *stream reborrows so the caller keeps ownership.
    let mut reader = BufReader::new(&mut *stream);
    let mut line = String::new();

    loop {
        line.clear();

        let read_deadline = std::cmp::min(Instant::now() + cfg.command_timeout, *idle_deadline);
        let status = match timeout_at(read_deadline, read_bounded_line(&mut reader, &mut line)).await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                debug!(error = %e, "error reading command");
                return Err(e.into());
            }
            Err(_) => {
                // Timeout: close without a response.
                warn!("connection timed out");
                return Ok(SessionResult::Quit);
            }
        };

        match status {
            LineRead::Line => {}
            LineRead::Eof => {
                debug!("client closed connection");
                return Ok(SessionResult::Quit);
            }
            LineRead::Overflow => {
                warn!("command line too long");
                reader
                    .write_all(b"-ERR Command line too long\r\n")
                    .await?;
                reader.flush().await?;
                return Ok(SessionResult::Quit);
            }
        }
        *idle_deadline = Instant::now() + cfg.idle_timeout;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // During a SASL exchange the entire line is the SASL response.
        if sess.sasl_in_progress() {
            let response = registry.auth().process_sasl_line(sess, trimmed);
            reader.write_all(&response.to_bytes()).await?;
            reader.flush().await?;
            if !response.is_continuation() {
                let domain = extract_domain(sess.username().unwrap_or(""));
                collector.auth_attempt(domain, response.is_ok());
                collector.command_processed("AUTH");
            }
            continue;
        }

        let Some((verb, args)) = parse_command(trimmed) else {
            continue;
        };
        let Some(cmd) = registry.get(&verb) else {
            debug!(verb, "unknown command");
            reader.write_all(&Response::err("Unknown command").to_bytes()).await?;
            reader.flush().await?;
            continue;
        };

        debug!(verb, args = args.len(), "executing command");
        collector.command_processed(&verb);

        let response = cmd.execute(sess, &args);
        reader.write_all(&response.to_bytes()).await?;
        reader.flush().await?;

        if verb == "PASS" || (verb == "AUTH" && !response.is_continuation()) {
            let domain = extract_domain(sess.username().unwrap_or(""));
            collector.auth_attempt(domain, response.is_ok());
        }

        match verb.as_str() {
            "STLS" if response.is_ok() => return Ok(SessionResult::UpgradeTls),
            "QUIT" => {
                info!("QUIT received, closing connection");
                return Ok(SessionResult::Quit);
            }
            _ => {}
        }
    }
}
