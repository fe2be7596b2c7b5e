use thiserror::Error;

#[derive(Error, Debug)]
pub enum Pop3Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no such message")]
    NoSuchMessage,

    #[error("message already deleted")]
    MessageDeleted,

    #[error("mailbox not initialized")]
    MailboxNotInitialized,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("session pipe error: {0}")]
    Pipe(String),
}

pub type Result<T> = std::result::Result<T, Pop3Error>;
