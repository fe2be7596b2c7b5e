use crate::error::{Pop3Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Per-domain configuration, read from `<domains_root>/<domain>/config.toml`.
///
/// Every field is optional; a missing file behaves like an empty one. The
/// effective defaults are: gid 0, credential backend `passwd`, store base
/// path `users`, both resolved against the domain directory when relative.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainConfig {
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub auth: DomainAuthConfig,
    #[serde(default)]
    pub store: DomainStoreConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainAuthConfig {
    #[serde(default)]
    pub credential_backend: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainStoreConfig {
    #[serde(default)]
    pub base_path: Option<String>,
}

impl DomainConfig {
    /// Load the config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&content)
            .map_err(|e| Pop3Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Path of the passwd file, resolved against the domain directory when
    /// relative.
    pub fn credential_backend_path(&self, domain_dir: &Path) -> PathBuf {
        let backend = self.auth.credential_backend.as_deref().unwrap_or("passwd");
        resolve(domain_dir, backend)
    }

    /// Base path for the message store, resolved against the domain
    /// directory when relative. An absolute path is used verbatim.
    pub fn store_base_path(&self, domain_dir: &Path) -> PathBuf {
        let base = self.store.base_path.as_deref().unwrap_or("users");
        resolve(domain_dir, base)
    }
}

fn resolve(domain_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        domain_dir.join(p)
    }
}
