//! Root crate: configuration loading and engine wiring.
//!
//! Configuration is a single `tbe.toml` loaded with the `toml` crate into
//! a plain `serde`-derived struct, rather than a full section-config format
//! coupled to an HTTP API schema — this engine has no REST surface of its
//! own, so that coupling buys nothing here (see `DESIGN.md`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tbe_jobs::EngineConfig;

/// `tbe.toml` on-disk shape. Durations are expressed in seconds in the file
/// and converted to `std::time::Duration` for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite catalog database.
    pub catalog_path: PathBuf,
    /// Tape device path, e.g. `/dev/nst0`. Ignored when a job's drive uses
    /// `SimulatedTapeDevice` (selected by `simulated_tape_dir`).
    pub device_path: String,
    /// When set, drives are simulated inside this directory instead of
    /// talking to a real `/dev/nst*` device, via `SimulatedTapeDevice` —
    /// used for development and the integration tests.
    pub simulated_tape_dir: Option<PathBuf>,
    pub block_size: usize,
    pub buffer_size_mb: usize,
    pub checksum_workers: usize,
    pub tape_ready_timeout_secs: u64,
    pub tape_change_poll_interval_secs: u64,
    /// The set of compression algorithms a job is allowed to request.
    pub allowed_compression: Vec<String>,
    /// `job.encryption_key_id` → passphrase, kept out of the catalog
    /// itself (the catalog only ever stores a fingerprint, in a tape's
    /// `encryption_key_fingerprint`).
    pub encryption_keys: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            catalog_path: PathBuf::from("tbe.sqlite"),
            device_path: "/dev/nst0".to_string(),
            simulated_tape_dir: None,
            block_size: defaults.block_size,
            buffer_size_mb: defaults.buffer_size_mb,
            checksum_workers: defaults.checksum_workers,
            tape_ready_timeout_secs: defaults.tape_ready_timeout.as_secs(),
            tape_change_poll_interval_secs: defaults.tape_change_poll_interval.as_secs(),
            allowed_compression: vec![
                "none".to_string(),
                "lto".to_string(),
                "gzip".to_string(),
                "zstd".to_string(),
            ],
            encryption_keys: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            block_size: self.block_size,
            buffer_size_mb: self.buffer_size_mb,
            checksum_workers: self.checksum_workers,
            tape_ready_timeout: Duration::from_secs(self.tape_ready_timeout_secs),
            tape_change_poll_interval: Duration::from_secs(self.tape_change_poll_interval_secs),
            encryption_keys: self
                .encryption_keys
                .iter()
                .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.block_size, config.block_size);
        assert_eq!(parsed.allowed_compression, config.allowed_compression);
    }

    #[test]
    fn missing_config_file_is_a_context_wrapped_error() {
        let err = Config::load(Path::new("/nonexistent/tbe.toml")).unwrap_err();
        assert!(err.to_string().contains("tbe.toml"));
    }
}
