//! Environment-driven configuration.
//!
//! A missing or unparseable value is a `config` error: fatal at startup,
//! never recovered from.

use secrecy::SecretString;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of persistent state: host key, TLS material, recordings.
    pub data_dir: PathBuf,
    pub db_url: SecretString,
    pub ssh_listen_port: u16,
    pub rdp_listen_port: u16,
    /// Transcode worker count (W).
    pub transcode_workers: usize,
    /// Transcode pending-queue cap (P).
    pub transcode_queue_max: i64,
    /// External `.replay -> .mp4` transcoder binary.
    pub transcoder_bin: PathBuf,
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("DATA_DIR"))?;
        let db_url = std::env::var("DB_URL")
            .map(SecretString::from)
            .map_err(|_| ConfigError::Missing("DB_URL"))?;

        Ok(Self {
            data_dir,
            db_url,
            ssh_listen_port: parse_env("SSH_LISTEN_PORT", 22)?,
            rdp_listen_port: parse_env("RDP_LISTEN_PORT", 3389)?,
            transcode_workers: parse_env("TRANSCODE_WORKERS", 2)?,
            transcode_queue_max: parse_env("TRANSCODE_QUEUE_MAX", 10)?,
            transcoder_bin: std::env::var("TRANSCODER_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("replay-transcode")),
        })
    }

    pub fn host_key_path(&self) -> PathBuf {
        self.data_dir.join("host_key")
    }

    pub fn tls_dir(&self) -> PathBuf {
        self.data_dir.join("tls")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings")
    }

    pub fn rdp_recordings_dir(&self) -> PathBuf {
        self.recordings_dir().join("rdp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_display() {
        let err = ConfigError::Missing("DATA_DIR");
        assert_eq!(err.to_string(), "missing required environment variable DATA_DIR");
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/glacis"),
            db_url: SecretString::from("postgres://localhost/glacis".to_string()),
            ssh_listen_port: 22,
            rdp_listen_port: 3389,
            transcode_workers: 2,
            transcode_queue_max: 10,
            transcoder_bin: PathBuf::from("replay-transcode"),
        };
        assert_eq!(config.host_key_path(), PathBuf::from("/var/lib/glacis/host_key"));
        assert_eq!(config.tls_dir(), PathBuf::from("/var/lib/glacis/tls"));
        assert_eq!(
            config.rdp_recordings_dir(),
            PathBuf::from("/var/lib/glacis/recordings/rdp")
        );
    }
}
