use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Which phases of a replication run are executed.
///
/// Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    /// Schema copy, snapshot export and load, then incremental consumption.
    Full,
    /// Schema copy, snapshot export and load.
    SnapshotOnly,
    /// Incremental consumption only, the warehouse table is expected to exist.
    IncrementalOnly,
    /// Schema copy, load of an externally exported snapshot, then incremental consumption.
    Cloud,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::Full => "full",
            ReplicationMode::SnapshotOnly => "snapshot-only",
            ReplicationMode::IncrementalOnly => "incremental-only",
            ReplicationMode::Cloud => "cloud",
        }
    }
}

impl Default for ReplicationMode {
    fn default() -> Self {
        Self::Full
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ReplicationMode::Full),
            "snapshot-only" => Ok(ReplicationMode::SnapshotOnly),
            "incremental-only" => Ok(ReplicationMode::IncrementalOnly),
            "cloud" => Ok(ReplicationMode::Cloud),
            other => Err(format!(
                "unknown mode `{other}`, expected one of: full, snapshot-only, incremental-only, cloud"
            )),
        }
    }
}

const fn default_snapshot_concurrency() -> u16 {
    ReplicationConfig::DEFAULT_SNAPSHOT_CONCURRENCY
}

const fn default_operation_timeout_ms() -> u64 {
    ReplicationConfig::DEFAULT_OPERATION_TIMEOUT_MS
}

const fn default_poll_interval_ms() -> u64 {
    ReplicationConfig::DEFAULT_POLL_INTERVAL_MS
}

/// Settings controlling a replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReplicationConfig {
    #[serde(default)]
    pub mode: ReplicationMode,
    /// Source tables written as `database.table`.
    pub tables: Vec<String>,
    /// Maximum number of concurrent snapshot shard readers per table.
    #[serde(default = "default_snapshot_concurrency")]
    pub snapshot_concurrency: u16,
    /// Deadline applied to each call into the source, storage or warehouse.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Delay between two scans of the incremental staging path when no batch is pending.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Retry policy applied to each incremental batch.
    #[serde(default)]
    pub batch_retry: RetryConfig,
}

impl ReplicationConfig {
    pub const DEFAULT_SNAPSHOT_CONCURRENCY: u16 = 8;

    pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10 * 60 * 1000;

    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tables.is_empty() {
            return Err(ValidationError::NoTablesConfigured);
        }

        for table in &self.tables {
            match table.split_once('.') {
                Some((database, name))
                    if !database.is_empty() && !name.is_empty() && !name.contains('.') => {}
                _ => return Err(ValidationError::InvalidTableName(table.clone())),
            }
        }

        if self.snapshot_concurrency == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "replication.snapshot_concurrency".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.operation_timeout_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "replication.operation_timeout_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        self.batch_retry.validate()
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;

    pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

    pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch_retry.max_attempts".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch_retry.backoff_factor".to_string(),
                constraint: "must be at least 1.0".to_string(),
            });
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch_retry.initial_delay_ms".to_string(),
                constraint: "must not exceed `max_delay_ms`".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: Self::DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: Self::DEFAULT_MAX_DELAY_MS,
            backoff_factor: Self::DEFAULT_BACKOFF_FACTOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tables: &[&str]) -> ReplicationConfig {
        serde_json::from_value(serde_json::json!({ "tables": tables })).unwrap()
    }

    #[test]
    fn mode_parses_cli_names() {
        assert_eq!(
            "snapshot-only".parse::<ReplicationMode>().unwrap(),
            ReplicationMode::SnapshotOnly
        );
        assert_eq!(
            "incremental-only".parse::<ReplicationMode>().unwrap(),
            ReplicationMode::IncrementalOnly
        );
        assert!("snapshot".parse::<ReplicationMode>().is_err());
    }

    #[test]
    fn mode_display_matches_serde_name() {
        let serialized = serde_json::to_string(&ReplicationMode::IncrementalOnly).unwrap();
        assert_eq!(serialized, "\"incremental-only\"");
        assert_eq!(ReplicationMode::IncrementalOnly.to_string(), "incremental-only");
    }

    #[test]
    fn defaults_are_applied() {
        let config = config(&["db1.orders"]);
        assert_eq!(config.mode, ReplicationMode::Full);
        assert_eq!(config.snapshot_concurrency, 8);
        assert_eq!(config.batch_retry, RetryConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn table_names_must_be_qualified() {
        assert_eq!(
            config(&["orders"]).validate(),
            Err(ValidationError::InvalidTableName("orders".to_string()))
        );
        assert_eq!(
            config(&["db1."]).validate(),
            Err(ValidationError::InvalidTableName("db1.".to_string()))
        );
        assert_eq!(
            config(&[]).validate(),
            Err(ValidationError::NoTablesConfigured)
        );
    }

    #[test]
    fn retry_factor_below_one_is_rejected() {
        let retry = RetryConfig {
            backoff_factor: 0.5,
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());
    }
}
