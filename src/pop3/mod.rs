//! POP3 protocol implementation (RFC 1939, 2449, 2595, 5034, 8314).

pub mod commands;
pub mod handler;
pub mod response;
pub mod sasl;
pub mod session;
pub mod stream;

pub use commands::{parse_command, Command, CommandRegistry};
pub use handler::{run_session, ConnectionConfig};
pub use response::Response;
pub use session::{Session, State, TlsState};
pub use stream::Pop3Stream;
