//! Configuration management

use std::time::Duration;

use crate::error::{EtlError, Result};
use crate::parser::DEFAULT_DELIMITER;
use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};

// ============================================================================
// Defaults
// ============================================================================

/// Default SQLite database file.
pub const DEFAULT_DATABASE_PATH: &str = "rapporti.db";

/// Default number of valid records staged per bulk load.
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Default timeout for read-only aggregate queries, in seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Default timeout for bulk writes, in seconds.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 120;

/// Default timeout for heavy set-based statements, in seconds.
pub const DEFAULT_HEAVY_TIMEOUT_SECS: u64 = 180;

/// Lock-wait bounds per transaction class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub read_only: Duration,
    pub bulk_write: Duration,
    pub heavy: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            read_only: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            bulk_write: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            heavy: Duration::from_secs(DEFAULT_HEAVY_TIMEOUT_SECS),
        }
    }
}

/// Ingestion configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub database_path: String,
    pub chunk_size: usize,
    pub delimiter: u8,
    pub timeouts: TimeoutConfig,
    pub retry: RetryPolicy,
    /// The legacy row-by-row path is not provided; `false` refuses to run.
    pub use_staging_pipeline: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            delimiter: DEFAULT_DELIMITER,
            timeouts: TimeoutConfig::default(),
            retry: RetryPolicy::default(),
            use_staging_pipeline: true,
        }
    }
}

impl IngestConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (the environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        let delimiter = match lookup("ETL_FIELD_DELIMITER") {
            Some(d) if d.len() == 1 && d.is_ascii() => d.as_bytes()[0],
            Some(d) => {
                return Err(EtlError::Config(format!(
                    "ETL_FIELD_DELIMITER must be a single ASCII character, got '{}'",
                    d
                )))
            }
            None => DEFAULT_DELIMITER,
        };

        let config = IngestConfig {
            database_path: lookup("DATABASE_PATH")
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            chunk_size: parsed("ETL_CHUNK_SIZE")
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            delimiter,
            timeouts: TimeoutConfig {
                read_only: Duration::from_secs(
                    parsed("ETL_READ_TIMEOUT_SECS").unwrap_or(DEFAULT_READ_TIMEOUT_SECS),
                ),
                bulk_write: Duration::from_secs(
                    parsed("ETL_WRITE_TIMEOUT_SECS").unwrap_or(DEFAULT_WRITE_TIMEOUT_SECS),
                ),
                heavy: Duration::from_secs(
                    parsed("ETL_HEAVY_TIMEOUT_SECS").unwrap_or(DEFAULT_HEAVY_TIMEOUT_SECS),
                ),
            },
            retry: RetryPolicy {
                max_attempts: parsed("ETL_RETRY_ATTEMPTS")
                    .map(|v| v as u32)
                    .unwrap_or(DEFAULT_MAX_ATTEMPTS),
                base_delay: parsed("ETL_RETRY_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_BASE_DELAY),
            },
            use_staging_pipeline: lookup("ETL_USE_STAGING")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(true),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EtlError::Config("chunk_size must be greater than 0".to_string()));
        }

        if self.retry.max_attempts == 0 {
            return Err(EtlError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }

        if !self.delimiter.is_ascii() || self.delimiter == b'\n' || self.delimiter == b'"' {
            return Err(EtlError::Config(format!(
                "invalid field delimiter byte {}",
                self.delimiter
            )));
        }

        let t = &self.timeouts;
        if t.read_only.is_zero() || t.bulk_write.is_zero() || t.heavy.is_zero() {
            return Err(EtlError::Config(
                "transaction timeouts must be greater than 0".to_string(),
            ));
        }

        if self.database_path.is_empty() {
            return Err(EtlError::Config("database path cannot be empty".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = IngestConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.chunk_size, 50_000);
        assert_eq!(config.timeouts.read_only, Duration::from_secs(60));
        assert_eq!(config.timeouts.bulk_write, Duration::from_secs(120));
        assert_eq!(config.timeouts.heavy, Duration::from_secs(180));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
        assert!(config.use_staging_pipeline);
    }

    #[test]
    fn test_overrides() {
        let config = IngestConfig::from_lookup(lookup(&[
            ("ETL_CHUNK_SIZE", "1000"),
            ("ETL_FIELD_DELIMITER", ";"),
            ("ETL_RETRY_ATTEMPTS", "5"),
            ("ETL_RETRY_BASE_MS", "20"),
            ("ETL_USE_STAGING", "false"),
            ("DATABASE_PATH", "/tmp/x.db"),
        ]))
        .unwrap();

        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.delimiter, b';');
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(20));
        assert!(!config.use_staging_pipeline);
        assert_eq!(config.database_path, "/tmp/x.db");
    }

    #[test]
    fn test_unparsable_numbers_fall_back() {
        let config =
            IngestConfig::from_lookup(lookup(&[("ETL_CHUNK_SIZE", "lots")])).unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            IngestConfig::from_lookup(lookup(&[("ETL_CHUNK_SIZE", "0")])),
            Err(EtlError::Config(_))
        ));
        assert!(matches!(
            IngestConfig::from_lookup(lookup(&[("ETL_FIELD_DELIMITER", "||")])),
            Err(EtlError::Config(_))
        ));
        assert!(matches!(
            IngestConfig::from_lookup(lookup(&[("ETL_WRITE_TIMEOUT_SECS", "0")])),
            Err(EtlError::Config(_))
        ));
    }
}
