//! End-to-end POP3 session tests over in-memory streams.
//!
//! The client side of a `tokio::io::duplex` pair drives a real session loop
//! wired to a maildir store on disk and passwd-file authentication.

use pop3_rs::config::ListenerMode;
use pop3_rs::metrics::NoopCollector;
use pop3_rs::pop3::{run_session, CommandRegistry, ConnectionConfig, Session};
use pop3_rs::security::{auth::hash_password, DomainAuthenticator};
use pop3_rs::storage::{MaildirStore, MessageStore};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tempfile::TempDir;

const MSG1: &[u8] = b"From: sender@example.net\r\nSubject: first\r\n\r\nhello world\r\n";
const MSG2: &[u8] = b"From: other@example.net\r\nSubject: second\r\n\r\nsecond body, a bit longer\r\n";
const PASSWORD: &str = "testpass";

struct TestEnv {
    root: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let domain_dir = root.path().join("domains").join("test.local");
        fs::create_dir_all(&domain_dir).unwrap();
        let hash = hash_password(PASSWORD).unwrap();
        fs::write(domain_dir.join("passwd"), format!("alice:{hash}:1000:1000\n")).unwrap();
        Self { root }
    }

    fn domains_root(&self) -> std::path::PathBuf {
        self.root.path().join("domains")
    }

    fn mail_root(&self) -> std::path::PathBuf {
        self.root.path().join("mail")
    }

    fn seed_messages(&self) -> MaildirStore {
        let store = MaildirStore::new(self.mail_root());
        store.deliver("alice@test.local", MSG1).unwrap();
        store.deliver("alice@test.local", MSG2).unwrap();
        store
    }

    fn registry(&self) -> CommandRegistry {
        CommandRegistry::new(Arc::new(DomainAuthenticator::new(self.domains_root())))
    }

    /// Spawn a session loop in pop3s trim (TLS considered active; the
    /// duplex stream stands in for the TLS-wrapped socket).
    fn spawn_tls_session(&self, timeouts: ConnectionConfig) -> (Client, JoinHandle<()>) {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let registry = self.registry();
        let store = MaildirStore::new(self.mail_root());
        let sess = Session::new(
            "mail.test.local",
            ListenerMode::Pop3s,
            true,
            true,
            Some(Box::new(store)),
        );
        let handle = tokio::spawn(async move {
            let _ = run_session(
                server_stream,
                sess,
                &registry,
                None,
                &timeouts,
                &NoopCollector,
            )
            .await;
        });
        (Client::new(client_stream), handle)
    }

    fn spawn_plain_session(&self) -> (Client, JoinHandle<()>) {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let registry = self.registry();
        let store = MaildirStore::new(self.mail_root());
        // pop3 listener with a TLS config available but no upgrade done yet.
        let sess = Session::new(
            "mail.test.local",
            ListenerMode::Pop3,
            true,
            false,
            Some(Box::new(store)),
        );
        let handle = tokio::spawn(async move {
            let _ = run_session(
                server_stream,
                sess,
                &registry,
                None,
                &default_timeouts(),
                &NoopCollector,
            )
            .await;
        });
        (Client::new(client_stream), handle)
    }
}

fn default_timeouts() -> ConnectionConfig {
    ConnectionConfig {
        idle_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
    }
}

struct Client {
    reader: BufReader<DuplexStream>,
}

impl Client {
    fn new(stream: DuplexStream) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    async fn send(&mut self, line: &str) {
        self.reader
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        assert!(n > 0, "unexpected EOF from server");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Read payload lines up to the terminator, undoing byte-stuffing.
    async fn read_multi_line(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            if line == "." {
                return lines;
            }
            let line = line.strip_prefix('.').map(str::to_string).unwrap_or(line);
            lines.push(line);
        }
    }

    async fn expect_eof(&mut self) {
        let mut buf = [0u8; 1];
        let n = self.reader.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "expected server to close the connection");
    }
}

fn messages_on_disk(mail_root: &Path) -> usize {
    let mut store = MaildirStore::new(mail_root);
    store.list("alice@test.local").map(|m| m.len()).unwrap_or(0)
}

#[tokio::test]
async fn test_full_pop3s_session() {
    let env = TestEnv::new();
    env.seed_messages();
    let total = MSG1.len() + MSG2.len();

    let (mut client, handle) = env.spawn_tls_session(default_timeouts());

    assert_eq!(
        client.read_line().await,
        "+OK mail.test.local POP3 server ready"
    );

    client.send("USER alice@test.local").await;
    assert_eq!(client.read_line().await, "+OK User alice@test.local accepted");

    client.send("PASS testpass").await;
    assert_eq!(
        client.read_line().await,
        "+OK Logged in as alice@test.local"
    );

    client.send("STAT").await;
    assert_eq!(client.read_line().await, format!("+OK 2 {total}"));

    client.send("LIST").await;
    assert_eq!(
        client.read_line().await,
        format!("+OK 2 messages ({total} octets)")
    );
    let listing = client.read_multi_line().await;
    assert_eq!(listing.len(), 2);
    let size2: u64 = listing[1]
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();

    client.send("RETR 1").await;
    let status = client.read_line().await;
    assert!(status.starts_with("+OK"), "RETR failed: {status}");
    let message = client.read_multi_line().await;
    assert!(
        message.iter().any(|l| l.starts_with("From: ")),
        "From: header missing in {message:?}"
    );

    client.send("DELE 1").await;
    assert_eq!(client.read_line().await, "+OK message 1 deleted");

    client.send("STAT").await;
    assert_eq!(client.read_line().await, format!("+OK 1 {size2}"));

    client.send("QUIT").await;
    assert_eq!(client.read_line().await, "+OK Logging out");
    client.expect_eof().await;
    handle.await.unwrap();

    // Message 1 was committed for deletion; exactly one survives on disk.
    assert_eq!(messages_on_disk(&env.mail_root()), 1);
}

#[tokio::test]
async fn test_dele_quit_removes_message_from_disk() {
    let env = TestEnv::new();
    env.seed_messages();
    assert_eq!(messages_on_disk(&env.mail_root()), 2);

    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;

    client.send("USER alice@test.local").await;
    client.read_line().await;
    client.send("PASS testpass").await;
    client.read_line().await;

    client.send("DELE 1").await;
    assert_eq!(client.read_line().await, "+OK message 1 deleted");
    client.send("QUIT").await;
    assert_eq!(client.read_line().await, "+OK Logging out");
    client.expect_eof().await;
    handle.await.unwrap();

    assert_eq!(messages_on_disk(&env.mail_root()), 1);
}

#[tokio::test]
async fn test_dele_rset_quit_preserves_messages() {
    let env = TestEnv::new();
    env.seed_messages();

    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;

    client.send("USER alice@test.local").await;
    client.read_line().await;
    client.send("PASS testpass").await;
    client.read_line().await;

    client.send("DELE 1").await;
    client.read_line().await;
    client.send("RSET").await;
    assert_eq!(client.read_line().await, "+OK maildrop has 2 messages");
    client.send("QUIT").await;
    assert_eq!(client.read_line().await, "+OK Logging out");
    client.expect_eof().await;
    handle.await.unwrap();

    assert_eq!(messages_on_disk(&env.mail_root()), 2);
}

#[tokio::test]
async fn test_stat_reflects_marks_and_rset() {
    let env = TestEnv::new();
    env.seed_messages();
    let total = MSG1.len() + MSG2.len();

    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;
    client.send("USER alice@test.local").await;
    client.read_line().await;
    client.send("PASS testpass").await;
    client.read_line().await;

    // Record per-message sizes from LIST, then check STAT after DELE 1.
    client.send("LIST").await;
    client.read_line().await;
    let listing = client.read_multi_line().await;
    let size2: u64 = listing[1].split_whitespace().nth(1).unwrap().parse().unwrap();

    client.send("DELE 1").await;
    client.read_line().await;
    client.send("STAT").await;
    assert_eq!(client.read_line().await, format!("+OK 1 {size2}"));

    client.send("RSET").await;
    client.read_line().await;
    client.send("STAT").await;
    assert_eq!(client.read_line().await, format!("+OK 2 {total}"));

    client.send("QUIT").await;
    client.read_line().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_capabilities_and_auth_gating_before_tls() {
    let env = TestEnv::new();
    let (mut client, handle) = env.spawn_plain_session();
    client.read_line().await;

    client.send("CAPA").await;
    assert_eq!(client.read_line().await, "+OK Capability list follows");
    let caps = client.read_multi_line().await;
    assert!(caps.contains(&"STLS".to_string()));
    assert!(caps.contains(&"TOP".to_string()));
    assert!(caps.contains(&"UIDL".to_string()));
    assert!(caps.contains(&"RESP-CODES".to_string()));
    assert!(!caps.contains(&"USER".to_string()));
    assert!(!caps.iter().any(|c| c.starts_with("SASL")));

    client.send("USER alice@test.local").await;
    assert_eq!(
        client.read_line().await,
        "-ERR TLS required for authentication"
    );

    client.send("QUIT").await;
    assert_eq!(client.read_line().await, "+OK Goodbye");
    handle.await.unwrap();
}

#[tokio::test]
async fn test_capabilities_with_tls_active() {
    let env = TestEnv::new();
    env.seed_messages();
    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;

    client.send("CAPA").await;
    client.read_line().await;
    let caps = client.read_multi_line().await;
    assert!(caps.contains(&"USER".to_string()));
    assert!(caps.contains(&"SASL PLAIN".to_string()));
    assert!(!caps.contains(&"STLS".to_string()));

    client.send("QUIT").await;
    client.read_line().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_sasl_plain_multi_step() {
    let env = TestEnv::new();
    env.seed_messages();
    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;

    client.send("AUTH PLAIN").await;
    assert_eq!(client.read_line().await, "+ ");

    let encoded = {
        use base64::{engine::general_purpose::STANDARD, Engine};
        STANDARD.encode(format!("\0alice@test.local\0{PASSWORD}"))
    };
    client.send(&encoded).await;
    assert_eq!(
        client.read_line().await,
        "+OK Logged in as alice@test.local"
    );

    client.send("STAT").await;
    assert!(client.read_line().await.starts_with("+OK 2 "));

    client.send("QUIT").await;
    client.read_line().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_sasl_cancellation_stays_in_authorization() {
    let env = TestEnv::new();
    env.seed_messages();
    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;

    client.send("AUTH PLAIN").await;
    assert_eq!(client.read_line().await, "+ ");

    client.send("*").await;
    assert_eq!(client.read_line().await, "-ERR Authentication cancelled");

    // Still in AUTHORIZATION: transaction commands rejected, and a fresh
    // USER/PASS login succeeds.
    client.send("STAT").await;
    assert_eq!(
        client.read_line().await,
        "-ERR Command not valid in this state"
    );

    client.send("USER alice@test.local").await;
    client.read_line().await;
    client.send("PASS testpass").await;
    assert_eq!(
        client.read_line().await,
        "+OK Logged in as alice@test.local"
    );

    client.send("QUIT").await;
    client.read_line().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_is_generic_and_session_continues() {
    let env = TestEnv::new();
    env.seed_messages();
    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;

    client.send("USER alice@test.local").await;
    client.read_line().await;
    client.send("PASS wrongpass").await;
    assert_eq!(client.read_line().await, "-ERR Authentication failed");

    client.send("USER unknown@test.local").await;
    client.read_line().await;
    client.send("PASS testpass").await;
    assert_eq!(client.read_line().await, "-ERR Authentication failed");

    client.send("NOOP").await;
    assert_eq!(client.read_line().await, "+OK");

    client.send("QUIT").await;
    assert_eq!(client.read_line().await, "+OK Goodbye");
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unknown_command_and_blank_lines() {
    let env = TestEnv::new();
    let (mut client, handle) = env.spawn_plain_session();
    client.read_line().await;

    client.send("").await;
    client.send("FROBNICATE now").await;
    assert_eq!(client.read_line().await, "-ERR Unknown command");

    client.send("QUIT").await;
    assert_eq!(client.read_line().await, "+OK Goodbye");
    handle.await.unwrap();
}

#[tokio::test]
async fn test_idle_timeout_closes_without_response() {
    let env = TestEnv::new();
    let timeouts = ConnectionConfig {
        idle_timeout: Duration::from_millis(100),
        command_timeout: Duration::from_secs(5),
    };
    let (mut client, handle) = env.spawn_tls_session(timeouts);
    client.read_line().await;

    // Send nothing; the server must drop the connection silently.
    client.expect_eof().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_overlong_command_line_closes_connection() {
    let env = TestEnv::new();
    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;

    let long_line = "A".repeat(9000);
    client.send(&long_line).await;
    assert_eq!(client.read_line().await, "-ERR Command line too long");
    client.expect_eof().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_top_returns_headers_and_body_lines() {
    let env = TestEnv::new();
    env.seed_messages();
    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;
    client.send("USER alice@test.local").await;
    client.read_line().await;
    client.send("PASS testpass").await;
    client.read_line().await;

    client.send("TOP 1 0").await;
    let status = client.read_line().await;
    assert!(status.starts_with("+OK"), "TOP failed: {status}");
    let lines = client.read_multi_line().await;
    assert!(lines.iter().any(|l| l.starts_with("Subject: ")));
    assert_eq!(lines.last().unwrap(), "");

    client.send("TOP 1 -1").await;
    assert_eq!(client.read_line().await, "-ERR Invalid line count");

    client.send("QUIT").await;
    client.read_line().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_uidl_listing() {
    let env = TestEnv::new();
    env.seed_messages();
    let (mut client, handle) = env.spawn_tls_session(default_timeouts());
    client.read_line().await;
    client.send("USER alice@test.local").await;
    client.read_line().await;
    client.send("PASS testpass").await;
    client.read_line().await;

    client.send("UIDL").await;
    assert_eq!(client.read_line().await, "+OK");
    let uids = client.read_multi_line().await;
    assert_eq!(uids.len(), 2);
    for (i, line) in uids.iter().enumerate() {
        let mut fields = line.split_whitespace();
        assert_eq!(fields.next().unwrap(), (i + 1).to_string());
        assert!(fields.next().is_some());
    }

    client.send("QUIT").await;
    client.read_line().await;
    handle.await.unwrap();
}
