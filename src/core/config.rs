use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::constants::*;
use super::errors::{Error, Result};

/// Recognized configuration options for a [`crate::Database`].
///
/// Unknown keys in a TOML config file fail startup rather than being
/// silently ignored (`#[serde(deny_unknown_fields)]`); omitted keys take
/// the documented defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub wal_dir: PathBuf,
    pub sync_writes: bool,
    pub checkpoint_ops: u64,
    pub checkpoint_interval_s: u64,
    pub max_concurrent_transactions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            wal_dir: PathBuf::from(DEFAULT_WAL_DIR),
            sync_writes: DEFAULT_SYNC_WRITES,
            checkpoint_ops: DEFAULT_CHECKPOINT_OPS,
            checkpoint_interval_s: DEFAULT_CHECKPOINT_INTERVAL_S,
            max_concurrent_transactions: DEFAULT_MAX_CONCURRENT_TRANSACTIONS,
        }
    }
}

impl Config {
    /// Loads a config from a TOML file, rejecting unknown keys.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(Error::Io)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::ConfigError {
            reason: e.to_string(),
        })
    }

    /// A config rooted at `dir` for `data_dir` and `dir/wal` for `wal_dir`,
    /// the shape most tests and embedders want rather than the relative
    /// `./data` / `./wal` defaults.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            data_dir: dir.join("data"),
            wal_dir: dir.join("wal"),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_transactions == 0 {
            return Err(Error::ConfigError {
                reason: "max_concurrent_transactions must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.wal_dir, PathBuf::from("./wal"));
        assert!(cfg.sync_writes);
        assert_eq!(cfg.checkpoint_ops, 1000);
        assert_eq!(cfg.checkpoint_interval_s, 300);
        assert_eq!(cfg.max_concurrent_transactions, 100);
    }

    #[test]
    fn unknown_key_fails_startup() {
        let err = Config::from_toml_str("data_dir = \"x\"\nbogus_option = 1\n").unwrap_err();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn omitted_keys_take_defaults() {
        let cfg = Config::from_toml_str("data_dir = \"/tmp/x\"\n").unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.checkpoint_ops, DEFAULT_CHECKPOINT_OPS);
    }
}
