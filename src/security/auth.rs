//! POP3 authentication.
//!
//! Credentials live in per-domain passwd files with argon2 password hashes,
//! one `local:hash:uid[:gid]` line per user. Password verification happens
//! here, inside the protocol-handler; the dispatcher only ever reads the uid
//! field (see `spawn::creds`).

use crate::error::{Pop3Error, Result};
use crate::security::domain::DomainConfig;
use crate::utils::{parse_address, split_subaddress};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Credential-bound session state owned by the POP3 session after a
/// successful authentication. Key material is zeroed when the session is
/// destroyed.
pub struct AuthSession {
    mailbox: String,
    key_material: Vec<u8>,
}

impl AuthSession {
    pub fn new(mailbox: String, key_material: Vec<u8>) -> Self {
        Self {
            mailbox,
            key_material,
        }
    }

    /// Fully-qualified mailbox identifier (`local@domain`).
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn key_material(&self) -> &[u8] {
        &self.key_material
    }

    /// Zero and discard the key material.
    pub fn clear(&mut self) {
        for byte in self.key_material.iter_mut() {
            *byte = 0;
        }
        self.key_material.clear();
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Result of domain-aware authentication: the session plus the subaddress
/// extension parsed out of the local part, if any.
pub struct DomainAuth {
    pub session: AuthSession,
    pub extension: Option<String>,
}

/// Authentication boundary consumed by the command layer.
///
/// Implementations must collapse every failure cause into
/// [`Pop3Error::AuthenticationFailed`]; details belong in server-side logs
/// only.
pub trait AuthProvider: Send + Sync {
    fn authenticate_with_domain(&self, username: &str, password: &str) -> Result<DomainAuth>;

    fn authenticate(&self, username: &str, password: &str) -> Result<AuthSession> {
        Ok(self.authenticate_with_domain(username, password)?.session)
    }
}

/// One parsed passwd file line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub password_hash: String,
    pub uid: u32,
    pub gid: Option<u32>,
}

/// Find `local` in a passwd file. Returns `Ok(None)` when no line matches;
/// I/O errors (including permission problems) surface as errors.
pub fn lookup_passwd(path: &Path, local: &str) -> Result<Option<PasswdEntry>> {
    let content = std::fs::read_to_string(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let (Some(name), Some(hash), Some(uid_str)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if name != local {
            continue;
        }
        let uid: u32 = uid_str
            .parse()
            .map_err(|_| Pop3Error::Config(format!("invalid uid {uid_str:?} for {name}")))?;
        let gid = match fields.next() {
            Some(gid_str) => Some(gid_str.parse().map_err(|_| {
                Pop3Error::Config(format!("invalid gid {gid_str:?} for {name}"))
            })?),
            None => None,
        };
        return Ok(Some(PasswdEntry {
            name: name.to_string(),
            password_hash: hash.to_string(),
            uid,
            gid,
        }));
    }
    Ok(None)
}

/// Hash a password for storage in a passwd file.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Pop3Error::Config(format!("failed to hash password: {e}")))?;
    Ok(hash.to_string())
}

/// Authenticator backed by the per-domain passwd files under a domains
/// directory.
pub struct DomainAuthenticator {
    domains_root: PathBuf,
}

impl DomainAuthenticator {
    pub fn new<P: Into<PathBuf>>(domains_root: P) -> Self {
        Self {
            domains_root: domains_root.into(),
        }
    }

    fn verify(&self, username: &str, password: &str) -> Result<DomainAuth> {
        let (local, domain) = parse_address(username)?;
        let (base, extension) = split_subaddress(local);

        let domain_dir = self.domains_root.join(domain);
        if !domain_dir.is_dir() {
            return Err(Pop3Error::Storage(format!("unknown domain {domain:?}")));
        }

        let config = DomainConfig::load(&domain_dir.join("config.toml"))?;
        let passwd_path = config.credential_backend_path(&domain_dir);

        let entry = lookup_passwd(&passwd_path, base)?
            .ok_or_else(|| Pop3Error::Storage(format!("unknown user {base:?}")))?;

        let parsed = PasswordHash::new(&entry.password_hash)
            .map_err(|_| Pop3Error::AuthenticationFailed)?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| Pop3Error::AuthenticationFailed)?;

        // Ephemeral key material, when the domain carries a key backend.
        let key_material = std::fs::read(domain_dir.join("keys").join(base)).unwrap_or_default();

        Ok(DomainAuth {
            session: AuthSession::new(format!("{base}@{domain}"), key_material),
            extension: extension.map(str::to_string),
        })
    }
}

impl AuthProvider for DomainAuthenticator {
    fn authenticate_with_domain(&self, username: &str, password: &str) -> Result<DomainAuth> {
        // Collapse all causes into the generic failure; the cause goes to
        // the server log only.
        self.verify(username, password).map_err(|e| {
            debug!(username, error = %e, "authentication rejected");
            Pop3Error::AuthenticationFailed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn domain_with_user(password: &str) -> (TempDir, DomainAuthenticator) {
        let root = TempDir::new().unwrap();
        let domain_dir = root.path().join("test.local");
        fs::create_dir_all(&domain_dir).unwrap();
        let hash = hash_password(password).unwrap();
        fs::write(
            domain_dir.join("passwd"),
            format!("# users\nalice:{hash}:1000:1000\nbob:{hash}:1001\n"),
        )
        .unwrap();
        let auth = DomainAuthenticator::new(root.path());
        (root, auth)
    }

    #[test]
    fn test_authenticate_success() {
        let (_root, auth) = domain_with_user("secret");
        let result = auth
            .authenticate_with_domain("alice@test.local", "secret")
            .unwrap();
        assert_eq!(result.session.mailbox(), "alice@test.local");
        assert!(result.extension.is_none());
    }

    #[test]
    fn test_authenticate_wrong_password() {
        let (_root, auth) = domain_with_user("secret");
        assert!(matches!(
            auth.authenticate("alice@test.local", "wrong"),
            Err(Pop3Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_unknown_user_and_domain_are_generic() {
        let (_root, auth) = domain_with_user("secret");
        assert!(matches!(
            auth.authenticate("carol@test.local", "secret"),
            Err(Pop3Error::AuthenticationFailed)
        ));
        assert!(matches!(
            auth.authenticate("alice@other.example", "secret"),
            Err(Pop3Error::AuthenticationFailed)
        ));
        assert!(matches!(
            auth.authenticate("no-at-sign", "secret"),
            Err(Pop3Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_subaddress_extension() {
        let (_root, auth) = domain_with_user("secret");
        let result = auth
            .authenticate_with_domain("alice+work@test.local", "secret")
            .unwrap();
        assert_eq!(result.session.mailbox(), "alice@test.local");
        assert_eq!(result.extension.as_deref(), Some("work"));
    }

    #[test]
    fn test_key_material_loaded_and_zeroed() {
        let (root, auth) = domain_with_user("secret");
        let keys_dir = root.path().join("test.local").join("keys");
        fs::create_dir_all(&keys_dir).unwrap();
        fs::write(keys_dir.join("alice"), b"key-bytes").unwrap();

        let mut session = auth.authenticate("alice@test.local", "secret").unwrap();
        assert_eq!(session.key_material(), b"key-bytes");

        session.clear();
        assert!(session.key_material().is_empty());
    }

    #[test]
    fn test_lookup_passwd() {
        let (root, _auth) = domain_with_user("secret");
        let passwd = root.path().join("test.local").join("passwd");

        let entry = lookup_passwd(&passwd, "alice").unwrap().unwrap();
        assert_eq!(entry.uid, 1000);
        assert_eq!(entry.gid, Some(1000));

        let entry = lookup_passwd(&passwd, "bob").unwrap().unwrap();
        assert_eq!(entry.uid, 1001);
        assert_eq!(entry.gid, None);

        assert!(lookup_passwd(&passwd, "carol").unwrap().is_none());
    }
}
