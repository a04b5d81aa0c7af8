//! Metric names emitted by the replication engine.

/// Label for the replicated table.
pub const TABLE_LABEL: &str = "table";

/// Label for the connector family.
pub const CONNECTOR_LABEL: &str = "connector";

/// Label for the replication phase.
pub const PHASE_LABEL: &str = "phase";

// Snapshot metrics

/// Counter of rows written to snapshot shard files.
pub const DWSYNC_SNAPSHOT_ROWS_EXPORTED_TOTAL: &str = "dwsync_snapshot_rows_exported_total";

/// Counter of snapshot shard files written.
pub const DWSYNC_SNAPSHOT_SHARDS_EXPORTED_TOTAL: &str = "dwsync_snapshot_shards_exported_total";

/// Histogram of the duration of a whole snapshot export, in seconds.
pub const DWSYNC_SNAPSHOT_EXPORT_DURATION_SECONDS: &str =
    "dwsync_snapshot_export_duration_seconds";

// Load metrics

/// Counter of rows loaded into the warehouse.
pub const DWSYNC_ROWS_LOADED_TOTAL: &str = "dwsync_rows_loaded_total";

/// Counter of DDL statements executed on the warehouse.
pub const DWSYNC_DDL_STATEMENTS_TOTAL: &str = "dwsync_ddl_statements_total";

// Incremental metrics

/// Counter of change batches merged into the warehouse.
pub const DWSYNC_BATCHES_APPLIED_TOTAL: &str = "dwsync_batches_applied_total";

/// Histogram of the duration of a single batch merge, in seconds.
pub const DWSYNC_BATCH_APPLY_DURATION_SECONDS: &str = "dwsync_batch_apply_duration_seconds";

/// Counter of retried operations.
pub const DWSYNC_RETRIES_TOTAL: &str = "dwsync_retries_total";

/// Gauge of the commit timestamp of the last applied table version.
pub const DWSYNC_APPLIED_TABLE_VERSION: &str = "dwsync_applied_table_version";
