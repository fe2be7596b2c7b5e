pub mod auth;
pub mod domain;
pub mod tls;

pub use auth::{AuthProvider, AuthSession, DomainAuth, DomainAuthenticator};
pub use domain::DomainConfig;
pub use tls::TlsConfig;
