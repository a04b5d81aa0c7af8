use std::sync::Arc;

use dwsync_config::shared::{ReplicationConfig, ReplicationMode, RetryConfig};

use crate::connector::memory::{MemoryConnector, MemoryWarehouse};
use crate::replication::TableReplication;
use crate::source::MemorySource;
use crate::storage::{StagingStore, StorageCredentials};
use crate::types::TableName;

/// Replication settings with short delays, suitable for tests.
pub fn test_replication_config(mode: ReplicationMode, tables: &[&TableName]) -> ReplicationConfig {
    ReplicationConfig {
        mode,
        tables: tables.iter().map(ToString::to_string).collect(),
        snapshot_concurrency: 2,
        operation_timeout_ms: 10_000,
        poll_interval_ms: 10,
        batch_retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
        },
    }
}

/// Replication of `table` from `source` into `warehouse`, staging through `staging`.
pub fn memory_replication(
    table: &TableName,
    source: &Arc<MemorySource>,
    warehouse: &MemoryWarehouse,
    staging: &StagingStore,
    config: &ReplicationConfig,
) -> TableReplication<MemorySource, MemoryConnector> {
    let connector = MemoryConnector::new(
        warehouse.clone(),
        table.name.clone(),
        "base",
        staging.root().clone(),
        StorageCredentials::None,
    );

    TableReplication::new(
        table.clone(),
        source.clone(),
        &connector,
        staging,
        &StorageCredentials::None,
        config,
        None,
    )
    .unwrap()
}
