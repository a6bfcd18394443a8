use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TLS needs both a certificate and a key")]
    IncompleteTls,
    #[error("snapshot interval must be positive")]
    ZeroSnapshotInterval,
    #[error("max slug attempts must be positive")]
    ZeroSlugAttempts,
}

/// Process configuration, resolved once from flags and environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "bazaar-server", about = "Marketplace catalog API", long_about = None)]
pub struct Config {
    #[arg(long, env = "BAZAAR_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directory for snapshots. Without it the store is memory only.
    #[arg(long, env = "BAZAAR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "BAZAAR_SNAPSHOT_INTERVAL_SECS", default_value_t = 300)]
    pub snapshot_interval_secs: u64,

    /// `tracing` filter directives, e.g. `info,bazaar_catalog=debug`.
    #[arg(long, env = "BAZAAR_LOG", default_value = "info")]
    pub log: String,

    #[arg(long, env = "BAZAAR_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "BAZAAR_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, env = "BAZAAR_MAX_SLUG_ATTEMPTS", default_value_t = bazaar_catalog::slug::DEFAULT_MAX_ATTEMPTS)]
    pub max_slug_attempts: u32,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::IncompleteTls);
        }
        if self.snapshot_interval_secs == 0 {
            return Err(ConfigError::ZeroSnapshotInterval);
        }
        if self.max_slug_attempts == 0 {
            return Err(ConfigError::ZeroSlugAttempts);
        }
        Ok(())
    }

    pub fn tls(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}
