//! pop3-rs: privilege-separated POP3 server
//!
//! A POP3 mail-retrieval server (RFC 1939) with CAPA/TOP/UIDL (RFC 2449),
//! STLS (RFC 2595), implicit TLS on the pop3s port (RFC 8314), and SASL
//! PLAIN (RFC 5034).
//!
//! # Architecture
//!
//! Three cooperating processes handle each connection:
//!
//! - The **listener** accepts TCP connections, allocates three pipe pairs,
//!   and spawns a protocol-handler with fds 3–6 (socket, auth pipe, session
//!   pipe in/out). A per-connection dispatcher task waits on the auth pipe.
//! - The **protocol-handler** runs one POP3 session to completion. It never
//!   touches mailbox data directly: all store operations tunnel through the
//!   session pipe.
//! - The **mail-session** is forked by the dispatcher under the
//!   authenticated user's uid/gid once the auth signal arrives, and serves
//!   the store side of the session-pipe protocol.
//!
//! # Modules
//!
//! - [`pop3`]: session state machine, command dispatch, connection handler
//! - [`spawn`]: listener, dispatcher, auth signal, credential lookup
//! - [`storage`]: message store trait, maildir and session-pipe backends
//! - [`security`]: passwd/argon2 authentication and TLS configuration
//! - [`config`]: TOML configuration
//! - [`error`]: error types and handling

pub mod config;
pub mod error;
pub mod metrics;
pub mod pop3;
pub mod security;
pub mod spawn;
pub mod storage;
pub mod utils;

pub use config::{Config, ListenerMode};
pub use error::{Pop3Error, Result};
