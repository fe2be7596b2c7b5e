//! POP3 command dispatch.
//!
//! Commands implement [`Command`] and are collected into an explicit
//! [`CommandRegistry`] when the stack is wired; there is no global mutable
//! registration. Each command enforces its own state and argument
//! requirements and returns a [`Response`]; the connection handler owns the
//! I/O.

use crate::error::Pop3Error;
use crate::pop3::response::Response;
use crate::pop3::sasl::{self, SaslExchange};
use crate::pop3::session::{Session, State};
use crate::security::{AuthProvider, DomainAuth};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, info};

const INVALID_STATE: &str = "Command not valid in this state";
const TLS_REQUIRED: &str = "TLS required for authentication";
const AUTH_FAILED: &str = "Authentication failed";

/// A POP3 command.
pub trait Command: Send + Sync {
    /// Verb, uppercase.
    fn name(&self) -> &'static str;

    /// Execute against the session. The returned response carries no CRLF
    /// framing; the handler serializes it.
    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response;
}

/// The command table, built once at wiring time and read-only afterwards.
pub struct CommandRegistry {
    commands: HashMap<&'static str, Arc<dyn Command>>,
    auth: Arc<AuthCommand>,
}

impl CommandRegistry {
    pub fn new(auth_provider: Arc<dyn AuthProvider>) -> Self {
        let auth = Arc::new(AuthCommand {
            auth: auth_provider.clone(),
        });

        let mut commands: HashMap<&'static str, Arc<dyn Command>> = HashMap::new();
        let table: Vec<Arc<dyn Command>> = vec![
            Arc::new(CapaCommand),
            Arc::new(StlsCommand),
            Arc::new(UserCommand),
            Arc::new(PassCommand {
                auth: auth_provider,
            }),
            auth.clone(),
            Arc::new(QuitCommand),
            Arc::new(StatCommand),
            Arc::new(ListCommand),
            Arc::new(RetrCommand),
            Arc::new(TopCommand),
            Arc::new(DeleCommand),
            Arc::new(RsetCommand),
            Arc::new(NoopCommand),
            Arc::new(UidlCommand),
        ];
        for cmd in table {
            commands.insert(cmd.name(), cmd);
        }

        Self { commands, auth }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Command> {
        self.commands
            .get(name.to_ascii_uppercase().as_str())
            .map(|c| c.as_ref())
    }

    /// The AUTH command, for routing SASL response lines.
    pub fn auth(&self) -> &AuthCommand {
        &self.auth
    }
}

/// Parse one command line into an uppercased verb and its arguments.
/// Returns `None` for blank lines, which are ignored without a response.
pub fn parse_command(line: &str) -> Option<(String, Vec<&str>)> {
    let mut fields = line.split_whitespace();
    let verb = fields.next()?.to_ascii_uppercase();
    Some((verb, fields.collect()))
}

struct CapaCommand;

impl Command for CapaCommand {
    fn name(&self) -> &'static str {
        "CAPA"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if !args.is_empty() {
            return Response::err("CAPA command takes no arguments");
        }
        Response::ok_with_lines("Capability list follows", sess.capabilities())
    }
}

struct StlsCommand;

impl Command for StlsCommand {
    fn name(&self) -> &'static str {
        "STLS"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if !args.is_empty() {
            return Response::err("STLS command takes no arguments");
        }
        if sess.state() != State::Authorization {
            return Response::err(INVALID_STATE);
        }
        if !sess.can_stls() {
            if sess.is_tls_active() {
                return Response::err("Already using TLS");
            }
            return Response::err("TLS not available");
        }
        // The handler performs the actual upgrade after this response.
        Response::ok("Begin TLS negotiation")
    }
}

struct UserCommand;

impl Command for UserCommand {
    fn name(&self) -> &'static str {
        "USER"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Authorization {
            return Response::err(INVALID_STATE);
        }
        if !sess.is_tls_active() {
            return Response::err(TLS_REQUIRED);
        }
        let &[username] = args else {
            return Response::err("USER command requires username argument");
        };
        if username.is_empty() {
            return Response::err("Username cannot be empty");
        }

        // Accepted without an existence check so the response cannot be used
        // as a user-enumeration oracle.
        sess.set_username(username);
        Response::ok(format!("User {username} accepted"))
    }
}

struct PassCommand {
    auth: Arc<dyn AuthProvider>,
}

impl Command for PassCommand {
    fn name(&self) -> &'static str {
        "PASS"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Authorization {
            return Response::err(INVALID_STATE);
        }
        if !sess.is_tls_active() {
            return Response::err(TLS_REQUIRED);
        }
        let Some(username) = sess.username().map(str::to_string) else {
            return Response::err("No username specified");
        };
        let &[password] = args else {
            return Response::err("PASS command requires password argument");
        };

        match self.auth.authenticate_with_domain(&username, password) {
            Ok(domain_auth) => complete_login(sess, domain_auth, &username),
            Err(e) => {
                info!(username, error = %e, "authentication failed");
                Response::err(AUTH_FAILED)
            }
        }
    }
}

/// The AUTH command (RFC 5034), SASL PLAIN only.
pub struct AuthCommand {
    auth: Arc<dyn AuthProvider>,
}

impl Command for AuthCommand {
    fn name(&self) -> &'static str {
        "AUTH"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Authorization {
            return Response::err(INVALID_STATE);
        }
        if !sess.is_tls_active() {
            return Response::err(TLS_REQUIRED);
        }
        if args.is_empty() {
            return Response::err("AUTH command requires mechanism argument");
        }

        let mechanism = args[0].to_ascii_uppercase();
        if !sasl::SUPPORTED_MECHANISMS.contains(&mechanism.as_str()) {
            return Response::err(format!("Unsupported mechanism: {mechanism}"));
        }

        sess.set_sasl(SaslExchange { mechanism });

        match args.get(1) {
            // "=" denotes an empty initial response (RFC 5034).
            Some(&"=") => self.process_sasl_step(sess, &[]),
            Some(initial) => match sasl::decode_response(initial) {
                Ok(data) => self.process_sasl_step(sess, &data),
                Err(_) => {
                    sess.clear_sasl();
                    Response::err("Invalid base64 encoding")
                }
            },
            // No initial response: empty challenge requests the credentials.
            None => Response::continuation(""),
        }
    }
}

impl AuthCommand {
    /// Process one line received while a SASL exchange is in progress.
    pub fn process_sasl_line(&self, sess: &mut Session, line: &str) -> Response {
        if line == "*" {
            sess.clear_sasl();
            return Response::err("Authentication cancelled");
        }
        match sasl::decode_response(line) {
            Ok(data) => self.process_sasl_step(sess, &data),
            Err(_) => {
                sess.clear_sasl();
                Response::err("Invalid base64 encoding")
            }
        }
    }

    fn process_sasl_step(&self, sess: &mut Session, data: &[u8]) -> Response {
        if !sess.sasl_in_progress() {
            return Response::err("No SASL exchange in progress");
        }
        sess.clear_sasl();

        let credentials = match sasl::parse_plain(data) {
            Ok(credentials) => credentials,
            Err(e) => {
                info!(error = %e, "SASL PLAIN response rejected");
                return Response::err(AUTH_FAILED);
            }
        };

        match self
            .auth
            .authenticate_with_domain(&credentials.authcid, &credentials.password)
        {
            Ok(domain_auth) => {
                sess.set_username(&credentials.authcid);
                complete_login(sess, domain_auth, &credentials.authcid)
            }
            Err(e) => {
                info!(username = credentials.authcid, error = %e, "SASL authentication failed");
                Response::err(AUTH_FAILED)
            }
        }
    }
}

/// Bind the authenticated session and load the mailbox.
fn complete_login(sess: &mut Session, domain_auth: DomainAuth, username: &str) -> Response {
    let mailbox = domain_auth.session.mailbox().to_string();
    sess.set_authenticated(domain_auth.session);
    if let Some(extension) = domain_auth.extension.as_deref() {
        sess.redirect_to_folder(extension);
    }

    if let Err(e) = sess.initialize_mailbox() {
        error!(username, mailbox, error = %e, "failed to initialize mailbox");
        return Response::err("Failed to access mailbox");
    }

    info!(username, mailbox, "authentication successful");
    Response::ok(format!("Logged in as {username}"))
}

struct QuitCommand;

impl Command for QuitCommand {
    fn name(&self) -> &'static str {
        "QUIT"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if !args.is_empty() {
            return Response::err("QUIT command takes no arguments");
        }
        match sess.state() {
            State::Transaction => {
                // Pending deletions are applied by the handler once this
                // response is on the wire.
                sess.enter_update();
                Response::ok("Logging out")
            }
            _ => Response::ok("Goodbye"),
        }
    }
}

struct StatCommand;

impl Command for StatCommand {
    fn name(&self) -> &'static str {
        "STAT"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Transaction {
            return Response::err(INVALID_STATE);
        }
        if !args.is_empty() {
            return Response::err("STAT command takes no arguments");
        }
        Response::ok(format!("{} {}", sess.message_count(), sess.total_size()))
    }
}

struct ListCommand;

impl Command for ListCommand {
    fn name(&self) -> &'static str {
        "LIST"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Transaction {
            return Response::err(INVALID_STATE);
        }

        match args {
            [] => {
                let lines = sess
                    .visible_messages()
                    .iter()
                    .map(|(n, m)| format!("{n} {}", m.size))
                    .collect();
                Response::ok_with_lines(
                    format!(
                        "{} messages ({} octets)",
                        sess.message_count(),
                        sess.total_size()
                    ),
                    lines,
                )
            }
            [arg] => {
                let Some(msg_num) = parse_message_number(arg) else {
                    return Response::err("Invalid message number");
                };
                match sess.get_message(msg_num) {
                    Ok(msg) => Response::ok(format!("{msg_num} {}", msg.size)),
                    Err(_) => Response::err("No such message"),
                }
            }
            _ => Response::err("LIST command takes at most one argument"),
        }
    }
}

struct RetrCommand;

impl Command for RetrCommand {
    fn name(&self) -> &'static str {
        "RETR"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Transaction {
            return Response::err(INVALID_STATE);
        }
        let &[arg] = args else {
            return Response::err("RETR command requires message number");
        };
        let Some(msg_num) = parse_message_number(arg) else {
            return Response::err("Invalid message number");
        };

        let (uid, size) = match sess.get_message(msg_num) {
            Ok(msg) => (msg.uid.clone(), msg.size),
            Err(Pop3Error::NoSuchMessage) | Err(Pop3Error::MessageDeleted) => {
                return Response::err("No such message")
            }
            Err(_) => return Response::err("Failed to retrieve message"),
        };

        let content = match read_from_store(sess, &uid, None) {
            Ok(content) => content,
            Err(response) => return response,
        };

        Response::ok_with_lines(
            format!("{size} octets"),
            split_message_lines(&String::from_utf8_lossy(&content)),
        )
    }
}

struct TopCommand;

impl Command for TopCommand {
    fn name(&self) -> &'static str {
        "TOP"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Transaction {
            return Response::err(INVALID_STATE);
        }
        let &[num_arg, lines_arg] = args else {
            return Response::err("TOP command requires message number and line count");
        };
        let Some(msg_num) = parse_message_number(num_arg) else {
            return Response::err("Invalid message number");
        };
        let Ok(body_lines) = lines_arg.parse::<i64>() else {
            return Response::err("Invalid line count");
        };
        if body_lines < 0 {
            return Response::err("Invalid line count");
        }

        let uid = match sess.get_message(msg_num) {
            Ok(msg) => msg.uid.clone(),
            Err(Pop3Error::NoSuchMessage) | Err(Pop3Error::MessageDeleted) => {
                return Response::err("No such message")
            }
            Err(_) => return Response::err("Failed to retrieve message"),
        };

        let content = match read_from_store(sess, &uid, Some(body_lines as usize)) {
            Ok(content) => content,
            Err(response) => return response,
        };

        Response::ok_with_lines(
            "",
            split_message_lines(&String::from_utf8_lossy(&content)),
        )
    }
}

struct DeleCommand;

impl Command for DeleCommand {
    fn name(&self) -> &'static str {
        "DELE"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Transaction {
            return Response::err(INVALID_STATE);
        }
        let &[arg] = args else {
            return Response::err("DELE command requires message number");
        };
        let Some(msg_num) = parse_message_number(arg) else {
            return Response::err("Invalid message number");
        };

        match sess.mark_deleted(msg_num) {
            Ok(()) => Response::ok(format!("message {msg_num} deleted")),
            Err(Pop3Error::NoSuchMessage) => Response::err("No such message"),
            Err(Pop3Error::MessageDeleted) => Response::err("Message already deleted"),
            Err(_) => Response::err("Failed to delete message"),
        }
    }
}

struct RsetCommand;

impl Command for RsetCommand {
    fn name(&self) -> &'static str {
        "RSET"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Transaction {
            return Response::err(INVALID_STATE);
        }
        if !args.is_empty() {
            return Response::err("RSET command takes no arguments");
        }
        sess.reset_deletions();
        Response::ok(format!("maildrop has {} messages", sess.message_count()))
    }
}

struct NoopCommand;

impl Command for NoopCommand {
    fn name(&self) -> &'static str {
        "NOOP"
    }

    fn execute(&self, _sess: &mut Session, args: &[&str]) -> Response {
        if !args.is_empty() {
            return Response::err("NOOP command takes no arguments");
        }
        Response::ok("")
    }
}

struct UidlCommand;

impl Command for UidlCommand {
    fn name(&self) -> &'static str {
        "UIDL"
    }

    fn execute(&self, sess: &mut Session, args: &[&str]) -> Response {
        if sess.state() != State::Transaction {
            return Response::err(INVALID_STATE);
        }

        match args {
            [] => {
                let lines = sess
                    .visible_messages()
                    .iter()
                    .map(|(n, m)| format!("{n} {}", m.uid))
                    .collect();
                Response::ok_with_lines("", lines)
            }
            [arg] => {
                let Some(msg_num) = parse_message_number(arg) else {
                    return Response::err("Invalid message number");
                };
                match sess.get_message(msg_num) {
                    Ok(msg) => Response::ok(format!("{msg_num} {}", msg.uid)),
                    Err(_) => Response::err("No such message"),
                }
            }
            _ => Response::err("UIDL command takes at most one argument"),
        }
    }
}

fn parse_message_number(arg: &str) -> Option<usize> {
    arg.parse::<usize>().ok()
}

/// Read a message (or its top section) from the session store, mapping
/// failures to the protocol-visible responses.
fn read_from_store(
    sess: &mut Session,
    uid: &str,
    body_lines: Option<usize>,
) -> std::result::Result<Vec<u8>, Response> {
    let Some(mailbox) = sess.mailbox().map(str::to_string) else {
        return Err(Response::err("Message store not available"));
    };
    let Some(store) = sess.store_mut() else {
        return Err(Response::err("Message store not available"));
    };

    let reader = match body_lines {
        Some(n) => store.retrieve_headers(&mailbox, uid, n),
        None => store.retrieve(&mailbox, uid),
    };
    let mut reader = match reader {
        Ok(reader) => reader,
        Err(e) => {
            error!(uid, error = %e, "failed to retrieve message content");
            return Err(Response::err("Failed to retrieve message"));
        }
    };

    let mut content = Vec::new();
    if let Err(e) = reader.read_to_end(&mut content) {
        error!(uid, error = %e, "failed to read message content");
        return Err(Response::err("Failed to read message"));
    }
    Ok(content)
}

/// Split message content into response lines, normalising CRLF and bare CR
/// line endings. A trailing newline does not produce an empty final line.
pub fn split_message_lines(content: &str) -> Vec<String> {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = normalized.split('\n').map(str::to_string).collect();
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

/// Apply pending deletions after QUIT moved the session to UPDATE: one
/// delete per marked message, then a single expunge.
pub fn apply_pending_deletions(sess: &mut Session) {
    let uids = sess.deleted_uids();
    let Some(mailbox) = sess.mailbox().map(str::to_string) else {
        return;
    };
    let Some(store) = sess.store_mut() else {
        return;
    };

    for uid in &uids {
        if let Err(e) = store.delete(&mailbox, uid) {
            error!(uid, error = %e, "failed to delete message");
        }
    }
    if !uids.is_empty() {
        match store.expunge(&mailbox) {
            Ok(()) => info!(count = uids.len(), "expunged messages"),
            Err(e) => error!(error = %e, "failed to expunge mailbox"),
        }
    }
    debug!(%mailbox, "update phase complete");
}
