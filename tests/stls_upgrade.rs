//! STLS upgrade path, end to end.
//!
//! A client on a duplex stream talks plaintext POP3, issues STLS, performs
//! a real rustls handshake against the handler's acceptor, and continues
//! the same session over TLS. Capabilities must differ before and after the
//! upgrade, and the secured channel must carry a full login.

use pop3_rs::config::ListenerMode;
use pop3_rs::metrics::NoopCollector;
use pop3_rs::pop3::{run_session, CommandRegistry, ConnectionConfig, Session};
use pop3_rs::security::{
    auth::hash_password, tls::generate_self_signed_cert, DomainAuthenticator, TlsConfig,
};
use pop3_rs::storage::MaildirStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;

const HOSTNAME: &str = "test.local";

async fn next_line<S>(reader: &mut BufReader<S>) -> String
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.unwrap();
    assert!(n > 0, "unexpected EOF from server");
    line.trim_end_matches(['\r', '\n']).to_string()
}

async fn send<S>(reader: &mut BufReader<S>, line: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reader
        .get_mut()
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .unwrap();
}

/// Read a multi-line payload up to the terminator.
async fn read_until_dot<S>(reader: &mut BufReader<S>) -> Vec<String>
where
    S: AsyncRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let line = next_line(reader).await;
        if line == "." {
            return lines;
        }
        lines.push(line);
    }
}

/// Client-side TLS config trusting exactly the server's self-signed cert.
fn client_tls_config(cert_path: &Path) -> rustls::ClientConfig {
    let pem = std::fs::read(cert_path).unwrap();
    let ders = rustls_pemfile::certs(&mut pem.as_slice()).unwrap();
    let mut roots = rustls::RootCertStore::empty();
    for der in ders {
        roots.add(&rustls::Certificate(der)).unwrap();
    }
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[tokio::test]
async fn test_stls_upgrade_changes_capabilities_in_one_session() {
    let root = TempDir::new().unwrap();

    // One user in one domain, one message in the maildrop.
    let domain_dir = root.path().join("domains").join(HOSTNAME);
    std::fs::create_dir_all(&domain_dir).unwrap();
    let hash = hash_password("testpass").unwrap();
    std::fs::write(domain_dir.join("passwd"), format!("alice:{hash}:1000\n")).unwrap();

    let mail_root = root.path().join("mail");
    let seed = MaildirStore::new(&mail_root);
    seed.deliver(
        "alice@test.local",
        b"From: sender@example.net\r\nSubject: sealed\r\n\r\nonly after the upgrade\r\n",
    )
    .unwrap();

    // Server certificate for the STLS acceptor.
    let cert_path = root.path().join("cert.pem");
    let key_path = root.path().join("key.pem");
    generate_self_signed_cert(
        HOSTNAME,
        cert_path.to_str().unwrap(),
        key_path.to_str().unwrap(),
    )
    .unwrap();
    let tls = TlsConfig::from_pem_files(&cert_path, &key_path).unwrap();

    let registry = CommandRegistry::new(Arc::new(DomainAuthenticator::new(
        root.path().join("domains"),
    )));
    let sess = Session::new(
        "mail.test.local",
        ListenerMode::Pop3,
        true,
        false,
        Some(Box::new(MaildirStore::new(&mail_root))),
    );
    let timeouts = ConnectionConfig {
        idle_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
    };
    let acceptor = tls.acceptor();

    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        run_session(
            server_stream,
            sess,
            &registry,
            Some(acceptor),
            &timeouts,
            &NoopCollector,
        )
        .await
    });

    let mut plain = BufReader::new(client_stream);
    assert_eq!(
        next_line(&mut plain).await,
        "+OK mail.test.local POP3 server ready"
    );

    // Before the upgrade: STLS advertised, authentication is not.
    send(&mut plain, "CAPA").await;
    assert_eq!(next_line(&mut plain).await, "+OK Capability list follows");
    let caps = read_until_dot(&mut plain).await;
    assert!(caps.contains(&"STLS".to_string()));
    assert!(!caps.contains(&"USER".to_string()));
    assert!(!caps.contains(&"SASL PLAIN".to_string()));

    send(&mut plain, "USER alice@test.local").await;
    assert_eq!(
        next_line(&mut plain).await,
        "-ERR TLS required for authentication"
    );

    send(&mut plain, "STLS").await;
    assert_eq!(next_line(&mut plain).await, "+OK Begin TLS negotiation");

    // Real handshake over the same connection. Nothing is buffered at this
    // point: the server sends no TLS bytes until the client hello.
    let connector = TlsConnector::from(Arc::new(client_tls_config(&cert_path)));
    let server_name = rustls::ServerName::try_from(HOSTNAME).unwrap();
    let tls_stream = connector
        .connect(server_name, plain.into_inner())
        .await
        .unwrap();
    let mut secured = BufReader::new(tls_stream);

    // Same session, TLS now active: USER and SASL appear, STLS is gone.
    send(&mut secured, "CAPA").await;
    assert_eq!(next_line(&mut secured).await, "+OK Capability list follows");
    let caps = read_until_dot(&mut secured).await;
    assert!(caps.contains(&"USER".to_string()));
    assert!(caps.contains(&"SASL PLAIN".to_string()));
    assert!(!caps.contains(&"STLS".to_string()));

    // The upgraded channel carries a full login and transaction.
    send(&mut secured, "USER alice@test.local").await;
    assert_eq!(
        next_line(&mut secured).await,
        "+OK User alice@test.local accepted"
    );
    send(&mut secured, "PASS testpass").await;
    assert_eq!(
        next_line(&mut secured).await,
        "+OK Logged in as alice@test.local"
    );

    send(&mut secured, "STAT").await;
    assert!(next_line(&mut secured).await.starts_with("+OK 1 "));

    send(&mut secured, "RETR 1").await;
    assert!(next_line(&mut secured).await.starts_with("+OK"));
    let message = read_until_dot(&mut secured).await;
    assert!(message.contains(&"only after the upgrade".to_string()));

    send(&mut secured, "QUIT").await;
    assert_eq!(next_line(&mut secured).await, "+OK Logging out");

    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stls_rejected_twice() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("domains")).unwrap();

    let cert_path = root.path().join("cert.pem");
    let key_path = root.path().join("key.pem");
    generate_self_signed_cert(
        HOSTNAME,
        cert_path.to_str().unwrap(),
        key_path.to_str().unwrap(),
    )
    .unwrap();
    let tls = TlsConfig::from_pem_files(&cert_path, &key_path).unwrap();

    let registry = CommandRegistry::new(Arc::new(DomainAuthenticator::new(
        root.path().join("domains"),
    )));
    let sess = Session::new("mail.test.local", ListenerMode::Pop3, true, false, None);
    let timeouts = ConnectionConfig {
        idle_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
    };
    let acceptor = tls.acceptor();

    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        run_session(
            server_stream,
            sess,
            &registry,
            Some(acceptor),
            &timeouts,
            &NoopCollector,
        )
        .await
    });

    let mut plain = BufReader::new(client_stream);
    next_line(&mut plain).await;

    send(&mut plain, "STLS").await;
    assert_eq!(next_line(&mut plain).await, "+OK Begin TLS negotiation");

    let connector = TlsConnector::from(Arc::new(client_tls_config(&cert_path)));
    let server_name = rustls::ServerName::try_from(HOSTNAME).unwrap();
    let tls_stream = connector
        .connect(server_name, plain.into_inner())
        .await
        .unwrap();
    let mut secured = BufReader::new(tls_stream);

    // A second STLS on the encrypted channel is refused.
    send(&mut secured, "STLS").await;
    assert_eq!(next_line(&mut secured).await, "-ERR Already using TLS");

    send(&mut secured, "QUIT").await;
    assert_eq!(next_line(&mut secured).await, "+OK Goodbye");

    server.await.unwrap().unwrap();
}
