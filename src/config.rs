use crate::error::{Pop3Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Operational mode of a single listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Plaintext POP3 (port 110) with optional STLS upgrade.
    Pop3,
    /// Implicit TLS (port 995).
    Pop3s,
}

impl ListenerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerMode::Pop3 => "pop3",
            ListenerMode::Pop3s => "pop3s",
        }
    }
}

impl std::str::FromStr for ListenerMode {
    type Err = Pop3Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pop3" => Ok(ListenerMode::Pop3),
            "pop3s" => Ok(ListenerMode::Pop3s),
            other => Err(Pop3Error::Config(format!("unknown listener mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub domains: DomainsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub address: String,
    pub mode: ListenerMode,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsSettings {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    /// Maximum time between commands before the connection is dropped.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Maximum time to receive one complete command line.
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DomainsConfig {
    /// Directory containing one subdirectory per hosted domain.
    pub path: Option<PathBuf>,
    /// Path to the mail-session binary. Unset disables mail-session spawning.
    pub mail_session_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig {
        address: "0.0.0.0:110".to_string(),
        mode: ListenerMode::Pop3,
    }]
}

fn default_idle_secs() -> u64 {
    1800
}

fn default_command_secs() -> u64 {
    60
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
            command_secs: default_command_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Pop3Error::Config(format!("read {}: {}", path.as_ref().display(), e))
        })?;

        toml::from_str(&content).map_err(|e| Pop3Error::Config(e.to_string()))
    }

    pub fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            log_level: default_log_level(),
            listeners: default_listeners(),
            tls: TlsSettings::default(),
            timeouts: TimeoutsConfig::default(),
            domains: DomainsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(Pop3Error::Config("hostname is required".to_string()));
        }
        if self.listeners.is_empty() {
            return Err(Pop3Error::Config(
                "at least one listener is required".to_string(),
            ));
        }
        for (i, l) in self.listeners.iter().enumerate() {
            if l.address.is_empty() {
                return Err(Pop3Error::Config(format!(
                    "listener {i}: address is required"
                )));
            }
            if l.mode == ListenerMode::Pop3s && !self.tls_configured() {
                return Err(Pop3Error::Config(format!(
                    "listener {}: pop3s mode requires tls.cert_file and tls.key_file",
                    l.address
                )));
            }
        }
        if self.timeouts.idle_secs == 0 || self.timeouts.command_secs == 0 {
            return Err(Pop3Error::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn tls_configured(&self) -> bool {
        self.tls.cert_file.is_some() && self.tls.key_file.is_some()
    }
}
