//! TLS for pop3s listeners and the STLS upgrade.
//!
//! One rustls server configuration backs both entry points: implicit TLS
//! wraps the socket before the greeting, STLS upgrades it mid-session. The
//! certificate chain and PKCS#8 key are loaded from PEM files at startup;
//! a bad pair is a configuration error, not a per-connection one.

use crate::error::{Pop3Error, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Server-side TLS configuration.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Build from a PEM certificate chain and a PKCS#8 private key file.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let chain = load_cert_chain(cert_path)?;
        let key = load_private_key(key_path)?;

        let server_config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Pop3Error::Tls(format!("certificate/key mismatch: {e}")))?;

        info!(cert = %cert_path.display(), "TLS configured");
        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    /// Acceptor for wrapping a stream, implicitly (pop3s) or after STLS.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

fn open_pem(path: &Path, what: &str) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| Pop3Error::Tls(format!("open {what} {}: {e}", path.display())))?;
    Ok(BufReader::new(file))
}

fn load_cert_chain(path: &Path) -> Result<Vec<Certificate>> {
    let ders = rustls_pemfile::certs(&mut open_pem(path, "certificate")?)
        .map_err(|e| Pop3Error::Tls(format!("parse certificate {}: {e}", path.display())))?;
    if ders.is_empty() {
        return Err(Pop3Error::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(ders.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open_pem(path, "private key")?)
        .map_err(|e| Pop3Error::Tls(format!("parse private key {}: {e}", path.display())))?;
    match keys.len() {
        1 => Ok(PrivateKey(keys.remove(0))),
        0 => Err(Pop3Error::Tls(format!(
            "no PKCS#8 private key in {}",
            path.display()
        ))),
        n => Err(Pop3Error::Tls(format!(
            "expected one private key in {}, found {n}",
            path.display()
        ))),
    }
}

/// Write a self-signed certificate and key pair for a hostname.
/// Development and tests only.
pub fn generate_self_signed_cert(hostname: &str, cert_path: &str, key_path: &str) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName, SanType};

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![SanType::DnsName(hostname.to_string())];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| Pop3Error::Tls(format!("generate certificate for {hostname}: {e}")))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| Pop3Error::Tls(format!("serialize certificate: {e}")))?;

    std::fs::write(cert_path, cert_pem)
        .map_err(|e| Pop3Error::Tls(format!("write {cert_path}: {e}")))?;
    std::fs::write(key_path, cert.serialize_private_key_pem())
        .map_err(|e| Pop3Error::Tls(format!("write {key_path}: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cert_pair(dir: &TempDir) -> (String, String) {
        let cert = dir.path().join("cert.pem").to_str().unwrap().to_string();
        let key = dir.path().join("key.pem").to_str().unwrap().to_string();
        generate_self_signed_cert("pop3.test.local", &cert, &key).unwrap();
        (cert, key)
    }

    #[test]
    fn test_config_from_generated_pair() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = cert_pair(&dir);

        let pem = std::fs::read_to_string(&cert).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));

        let tls = TlsConfig::from_pem_files(&cert, &key).unwrap();
        let _ = tls.acceptor();
    }

    #[test]
    fn test_missing_files_rejected() {
        let err = TlsConfig::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .unwrap_err();
        assert!(matches!(err, Pop3Error::Tls(_)));
    }

    #[test]
    fn test_swapped_cert_and_key_rejected() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = cert_pair(&dir);

        // The key file carries no certificate and vice versa.
        assert!(TlsConfig::from_pem_files(&key, &cert).is_err());
        assert!(load_private_key(Path::new(&cert)).is_err());
    }
}
