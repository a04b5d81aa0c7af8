use std::sync::Arc;

use dwsync::connector::memory::MemoryWarehouse;
use dwsync::error::ErrorKind;
use dwsync::failpoints::{
    INCREMENTAL__AFTER_MERGE, INCREMENTAL__BEFORE_MERGE, SNAPSHOT_EXPORT__BEFORE_SHARD_WRITE,
};
use dwsync::increment::Checkpoint;
use dwsync::snapshot::SnapshotExporter;
use dwsync::source::MemorySource;
use dwsync::storage::StagingStore;
use dwsync::test_utils::failpoints::FailpointGuard;
use dwsync::test_utils::replication::{memory_replication, test_replication_config};
use dwsync::test_utils::staging::{
    ChangeBatch, increment_store, memory_staging, snapshot_store, write_schema,
};
use dwsync::test_utils::table::{order_row, orders_columns, orders_definition, orders_table};
use dwsync_config::shared::ReplicationMode;
use dwsync_telemetry::init_test_tracing;

/// Warehouse seeded with one order and a staging root holding one batch updating it.
async fn one_pending_batch(bucket: &str) -> (MemoryWarehouse, StagingStore, String) {
    let warehouse = MemoryWarehouse::new();
    warehouse
        .seed_table("orders", orders_columns(), vec![order_row(1, "1.00")])
        .await;

    let staging = memory_staging(bucket);
    let increment = increment_store(&staging);
    let definition = orders_definition(1, orders_columns());
    write_schema(&increment, &definition).await;
    let file = ChangeBatch::new(&definition)
        .update(10, order_row(1, "2.00"))
        .insert(11, order_row(2, "3.00"))
        .write(&increment, "CDC000001.csv")
        .await;

    (warehouse, staging, file)
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_before_merge_is_retried() {
    init_test_tracing();
    let _guard = FailpointGuard::configure(&[(INCREMENTAL__BEFORE_MERGE, "1*return(timed_retry)")]);

    let (warehouse, staging, file) = one_pending_batch("failpoints-before-merge").await;
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::IncrementalOnly, &[&table]);
    let source = Arc::new(MemorySource::new());
    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);

    assert_eq!(replication.consume_pending().await.unwrap(), 1);
    assert_eq!(replication.checkpoint(), Some(&Checkpoint::new(1, Some(file))));
    assert_eq!(warehouse.table_rows("orders").await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_after_merge_reapplies_the_batch_without_duplicates() {
    init_test_tracing();
    let _guard = FailpointGuard::configure(&[(INCREMENTAL__AFTER_MERGE, "1*return(no_retry)")]);

    let (warehouse, staging, file) = one_pending_batch("failpoints-after-merge").await;
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::IncrementalOnly, &[&table]);
    let source = Arc::new(MemorySource::new());

    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);
    let err = replication.consume_pending().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WithNoRetry);
    assert_eq!(replication.checkpoint(), Some(&Checkpoint::new(1, None)));
    let merged_once = warehouse.table_rows("orders").await.unwrap();

    // The merge is committed but the checkpoint is not, a restart applies the batch again.
    let mut restarted = memory_replication(&table, &source, &warehouse, &staging, &config);
    assert_eq!(restarted.consume_pending().await.unwrap(), 1);
    assert_eq!(restarted.checkpoint(), Some(&Checkpoint::new(1, Some(file))));
    assert_eq!(warehouse.table_rows("orders").await.unwrap(), merged_once);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_shard_write_fails_the_export() {
    init_test_tracing();
    let _guard =
        FailpointGuard::configure(&[(SNAPSHOT_EXPORT__BEFORE_SHARD_WRITE, "return(no_retry)")]);

    let source = Arc::new(MemorySource::new());
    let table = orders_table();
    source.create_table(table.clone(), orders_columns()).await;
    source
        .insert_rows(&table, (1..=8).map(|id| order_row(id, "1.00")).collect())
        .await
        .unwrap();

    let exporter = SnapshotExporter::new(
        source,
        snapshot_store(&memory_staging("failpoints-shard-write")),
        2,
    );
    let err = exporter
        .export(&table, &orders_columns(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::WithNoRetry);
    assert!(exporter.store().list("").await.unwrap().is_empty());
}
