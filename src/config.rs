use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::matching::SelectionScope;

/// Rows per partition when nothing else is configured.
pub const DEFAULT_PARTITION_SIZE: usize = 10_000;

/// The output buffer is flushed once it holds more rows than this.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 5_000;

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://work.db` or `sqlite::memory:`
    pub url: String,
    pub acquire_timeout_ms: u64,
    pub create_if_missing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".into(),
            acquire_timeout_ms: 30_000,
            create_if_missing: true,
        }
    }
}

impl DatabaseConfig {
    pub fn from_path(path: &str) -> Self {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };
        Self {
            url,
            ..Self::default()
        }
    }
}

/// Tuning knobs of one engine run. None of these change which exact matches
/// are found; partition sizes do change what the per-partition selection
/// policy sees.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EngineConfig {
    pub left_partition_size: usize,
    pub right_partition_size: usize,
    pub flush_threshold: usize,
    /// Score the left records of a batch on the rayon pool.
    pub parallel_scoring: bool,
    /// Overrides the selection scope of the specification when set.
    pub selection_scope: Option<SelectionScope>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            left_partition_size: DEFAULT_PARTITION_SIZE,
            right_partition_size: DEFAULT_PARTITION_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            parallel_scoring: false,
            selection_scope: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.left_partition_size == 0 {
            return Err(ConfigError::invalid(
                "engine.left_partition_size",
                "must be > 0",
            ));
        }
        if self.right_partition_size == 0 {
            return Err(ConfigError::invalid(
                "engine.right_partition_size",
                "must be > 0",
            ));
        }
        if self.flush_threshold == 0 {
            return Err(ConfigError::invalid("engine.flush_threshold", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "database.url",
            });
        }
        if !self.database.url.starts_with("sqlite:") {
            return Err(ConfigError::invalid(
                "database.url",
                format!("unsupported scheme in {}", self.database.url),
            ));
        }
        self.engine.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.engine.left_partition_size, 10_000);
        assert_eq!(cfg.engine.flush_threshold, 5_000);
    }

    #[test]
    fn zero_partition_size_rejected() {
        let mut cfg = AppConfig::default();
        cfg.engine.right_partition_size = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                field: "engine.right_partition_size",
                ..
            })
        ));
    }

    #[test]
    fn path_becomes_sqlite_url() {
        assert_eq!(DatabaseConfig::from_path("work.db").url, "sqlite://work.db");
        assert_eq!(
            DatabaseConfig::from_path("sqlite::memory:").url,
            "sqlite::memory:"
        );
    }

    #[test]
    fn non_sqlite_url_rejected() {
        let cfg = AppConfig {
            database: DatabaseConfig {
                url: "mysql://root@localhost/db".into(),
                ..DatabaseConfig::default()
            },
            engine: EngineConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }
}
