//! Tuning knobs for the access-path search.
//!
//! Settings can be built in code (`Default` plus a few presets) or parsed from
//! a TOML document such as:
//!
//! ```toml
//! use_statistics = true
//! table_lock_threshold = 5000
//! max_memory_per_table = 1048576
//! max_join_orders = 2000
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Optimizer configuration for one compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Consult index statistics when they exist.
    pub use_statistics: bool,
    /// Rows touched above which a scan escalates to a table lock.
    pub table_lock_threshold: u32,
    /// Upper bound in bytes for memory a single table's join strategy may use.
    pub max_memory_per_table: u64,
    /// Stop the permutation search after this many complete join orders.
    pub max_join_orders: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            use_statistics: true,
            table_lock_threshold: 5000,
            max_memory_per_table: 1024 * 1024,
            max_join_orders: None,
        }
    }
}

impl OptimizerConfig {
    /// Heuristic-only costing, useful to compare plans with and without statistics.
    pub fn without_statistics() -> Self {
        Self {
            use_statistics: false,
            ..Self::default()
        }
    }

    /// Bounded search for large FROM lists.
    pub fn bounded(max_join_orders: u64) -> Self {
        Self {
            max_join_orders: Some(max_join_orders),
            ..Self::default()
        }
    }

    /// Parses a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        raw.into_config()
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        raw.into_config()
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_lock_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "table_lock_threshold",
                reason: "must be positive",
            });
        }
        if self.max_memory_per_table == 0 {
            return Err(ConfigError::Invalid {
                key: "max_memory_per_table",
                reason: "must be positive",
            });
        }
        if self.max_join_orders == Some(0) {
            return Err(ConfigError::Invalid {
                key: "max_join_orders",
                reason: "must allow at least one join order",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    use_statistics: Option<bool>,
    table_lock_threshold: Option<u32>,
    max_memory_per_table: Option<u64>,
    max_join_orders: Option<u64>,
}

impl RawConfig {
    fn into_config(self) -> Result<OptimizerConfig, ConfigError> {
        let defaults = OptimizerConfig::default();
        let config = OptimizerConfig {
            use_statistics: self.use_statistics.unwrap_or(defaults.use_statistics),
            table_lock_threshold: self
                .table_lock_threshold
                .unwrap_or(defaults.table_lock_threshold),
            max_memory_per_table: self
                .max_memory_per_table
                .unwrap_or(defaults.max_memory_per_table),
            max_join_orders: self.max_join_orders.or(defaults.max_join_orders),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read optimizer config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse optimizer config{}: {source}", display_path(.path))]
    Parse {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    #[error("failed to serialize optimizer config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("optimizer setting '{key}' {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" {}", path.display()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = OptimizerConfig::from_toml_str("table_lock_threshold = 10\n")
            .expect("config parses");
        assert_eq!(config.table_lock_threshold, 10);
        assert!(config.use_statistics);
        assert_eq!(config.max_memory_per_table, 1024 * 1024);
        assert_eq!(config.max_join_orders, None);
    }

    #[test]
    fn rejects_zero_threshold() {
        let err = OptimizerConfig::from_toml_str("table_lock_threshold = 0\n")
            .expect_err("zero threshold rejected");
        match err {
            ConfigError::Invalid { key, .. } => assert_eq!(key, "table_lock_threshold"),
            other => panic!("expected invalid setting, found {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = OptimizerConfig::from_toml_str("bogus = 1\n").expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse { path: None, .. }));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "use_statistics = false").expect("write");
        writeln!(file, "max_join_orders = 12").expect("write");
        let config = OptimizerConfig::load(file.path()).expect("config loads");
        assert!(!config.use_statistics);
        assert_eq!(config.max_join_orders, Some(12));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = OptimizerConfig::bounded(42);
        let text = config.to_toml_string().expect("serializes");
        let parsed = OptimizerConfig::from_toml_str(&text).expect("parses");
        assert_eq!(parsed, config);
    }
}
