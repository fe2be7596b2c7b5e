use crate::error::{Pop3Error, Result};
use crate::security::auth::lookup_passwd;
use crate::security::domain::DomainConfig;
use std::path::{Path, PathBuf};

/// Credentials the dispatcher applies when forking a mail-session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub base_path: PathBuf,
}

/// Resolve uid, gid, and the mail-session base path for a fully-qualified
/// username (`local@domain`) from the per-domain configuration.
///
/// The passwd file and the store base path are resolved against the domain
/// directory when relative; an absolute base path is used verbatim, never
/// joined under the domain directory.
pub fn lookup_credentials(domains_root: &Path, username: &str) -> Result<Credentials> {
    let Some((local, domain)) = username.split_once('@') else {
        return Err(Pop3Error::InvalidAddress(format!(
            "{username}: missing @domain"
        )));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(Pop3Error::InvalidAddress(format!(
            "{username}: empty local part or domain"
        )));
    }

    let domain_dir = domains_root.join(domain);
    if !domain_dir.is_dir() {
        return Err(Pop3Error::Storage(format!("unknown domain {domain:?}")));
    }

    let config = DomainConfig::load(&domain_dir.join("config.toml")).unwrap_or_default();

    let passwd_path = config.credential_backend_path(&domain_dir);
    let entry = lookup_passwd(&passwd_path, local)?.ok_or_else(|| {
        Pop3Error::Storage(format!(
            "unknown user {local:?} in {}",
            passwd_path.display()
        ))
    })?;

    Ok(Credentials {
        uid: entry.uid,
        gid: entry.gid.unwrap_or(config.gid),
        base_path: config.store_base_path(&domain_dir),
    })
}
