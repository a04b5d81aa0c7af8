use serde::Deserialize;

use crate::Config;
use crate::shared::{
    ChangefeedConfig, ReplicationConfig, ReplicationMode, StorageConfig, TiDbConnectionConfig,
    ValidationError, WarehouseConfig,
};

/// Complete configuration of the replicator binary.
///
/// Does not implement `Serialize` so secrets cannot leak into serialized forms.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorConfig {
    pub source: TiDbConnectionConfig,
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    pub replication: ReplicationConfig,
    /// When set, the changefeed feeding the incremental path is managed by the replicator.
    #[serde(default)]
    pub changefeed: Option<ChangefeedConfig>,
}

impl ReplicatorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.storage.validate()?;
        self.warehouse.validate()?;
        self.replication.validate()?;

        if let Some(changefeed) = &self.changefeed {
            changefeed.validate()?;
        }

        if matches!(self.warehouse, WarehouseConfig::StorageOnly) {
            self.validate_storage_only()?;
        }

        Ok(())
    }

    /// Without a warehouse there is nothing to load or merge into, so the run must export a
    /// snapshot, and full mode must hand the incremental path over to a managed changefeed.
    fn validate_storage_only(&self) -> Result<(), ValidationError> {
        match self.replication.mode {
            ReplicationMode::SnapshotOnly => Ok(()),
            ReplicationMode::Full if self.changefeed.is_some() => Ok(()),
            ReplicationMode::Full => Err(ValidationError::InvalidFieldValue {
                field: "changefeed".to_string(),
                constraint: "must be set for a full run with the `storage_only` warehouse"
                    .to_string(),
            }),
            mode => Err(ValidationError::InvalidFieldValue {
                field: "replication.mode".to_string(),
                constraint: format!(
                    "`{mode}` exports no snapshot, use `full` or `snapshot-only` instead"
                ),
            }),
        }
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["replication.tables"];
}
