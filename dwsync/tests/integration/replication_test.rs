use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dwsync::codec::{decode_rows, encode_rows};
use dwsync::concurrency::shutdown::create_shutdown_channel;
use dwsync::connector::Connector;
use dwsync::connector::memory::MemoryWarehouse;
use dwsync::error::ErrorKind;
use dwsync::increment::Checkpoint;
use dwsync::replication::{ReplicationPhase, StorageExport};
use dwsync::source::MemorySource;
use dwsync::test_utils::replication::{memory_replication, test_replication_config};
use dwsync::test_utils::staging::{
    ChangeBatch, increment_store, memory_staging, snapshot_store, write_schema,
};
use dwsync::test_utils::table::{
    order_row, orders_columns, orders_columns_with_shipped, orders_definition, orders_table,
    sorted_by_id,
};
use dwsync::types::TableRow;
use dwsync_config::shared::ReplicationMode;
use dwsync_telemetry::init_test_tracing;

fn shipped_row(id: i64, amount: &str, shipped: Option<bool>) -> TableRow {
    TableRow::new(vec![
        Some(id.to_string()),
        Some(amount.to_string()),
        shipped.map(|shipped| if shipped { "1" } else { "0" }.to_string()),
    ])
}

async fn source_with_orders(count: i64) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    source.create_table(orders_table(), orders_columns()).await;
    source
        .insert_rows(
            &orders_table(),
            (1..=count)
                .map(|id| order_row(id, &format!("{id}.00")))
                .collect(),
        )
        .await
        .unwrap();

    source
}

/// Waits until the warehouse `orders` table holds exactly `expected`, in any order.
async fn wait_for_rows(warehouse: &MemoryWarehouse, expected: &[TableRow]) {
    for _ in 0..500 {
        let rows = warehouse.table_rows("orders").await.unwrap_or_default();
        if sorted_by_id(rows) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("warehouse never reached the expected rows");
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_then_schema_change_and_upserts_are_replicated() {
    init_test_tracing();
    let source = source_with_orders(10).await;
    let warehouse = MemoryWarehouse::new();
    let staging = memory_staging("replication-end-to-end");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::Full, &[&table]);
    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);

    replication.copy_schema().await.unwrap();
    let (_, export) = replication.export_snapshot().await.unwrap();
    assert_eq!(
        export.files,
        vec!["db1.orders.000000.csv", "db1.orders.000001.csv"]
    );

    let loaded = replication.load_snapshot().await.unwrap();
    assert_eq!(loaded, 10);
    assert_eq!(
        sorted_by_id(warehouse.table_rows("orders").await.unwrap()),
        sorted_by_id(source.table_rows(&table).await)
    );

    // The changefeed writes a new table version after `ADD COLUMN shipped`, then three upserts
    // referencing the new column.
    let increment = increment_store(&staging);
    let widened = orders_definition(2, orders_columns_with_shipped())
        .with_query("ALTER TABLE `db1`.`orders` ADD COLUMN `shipped` BOOL");
    write_schema(&increment, &widened).await;
    ChangeBatch::new(&widened)
        .update(100, shipped_row(1, "1.00", Some(true)))
        .update(101, shipped_row(2, "2.50", Some(false)))
        .insert(102, shipped_row(11, "11.00", Some(true)))
        .write(&increment, "CDC000001.csv")
        .await;

    assert_eq!(replication.consume_pending().await.unwrap(), 1);

    let columns = warehouse.table_columns("orders").await.unwrap();
    assert_eq!(columns, orders_columns_with_shipped());
    assert_eq!(replication.increment_connector().columns(), columns.as_slice());

    let mut expected = vec![
        shipped_row(1, "1.00", Some(true)),
        shipped_row(2, "2.50", Some(false)),
    ];
    expected.extend((3..=10).map(|id| shipped_row(id, &format!("{id}.00"), None)));
    expected.push(shipped_row(11, "11.00", Some(true)));
    assert_eq!(
        sorted_by_id(warehouse.table_rows("orders").await.unwrap()),
        expected
    );
    assert_eq!(
        replication.checkpoint(),
        Some(&Checkpoint::new(
            2,
            Some("db1/orders/2/CDC000001.csv".to_string())
        ))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_only_run_finishes_after_loading() {
    init_test_tracing();
    let source = source_with_orders(25).await;
    let warehouse = MemoryWarehouse::new();
    let staging = memory_staging("replication-snapshot-only");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::SnapshotOnly, &[&table]);
    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);

    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let phase = replication.run(shutdown_rx).await.unwrap();

    assert_eq!(phase, ReplicationPhase::Finished);
    assert_eq!(warehouse.table_rows("orders").await.unwrap().len(), 25);
    assert!(replication.checkpoint().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn full_run_consumes_changes_until_shutdown() {
    init_test_tracing();
    let source = source_with_orders(4).await;
    let warehouse = MemoryWarehouse::new();
    let staging = memory_staging("replication-full-run");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::Full, &[&table]);
    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);

    let increment = increment_store(&staging);
    let definition = orders_definition(1, orders_columns());
    write_schema(&increment, &definition).await;
    ChangeBatch::new(&definition)
        .insert(50, order_row(5, "5.00"))
        .delete(51, order_row(1, "1.00"))
        .write(&increment, "CDC000001.csv")
        .await;

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handle = tokio::spawn(async move { replication.run(shutdown_rx).await });

    let expected = vec![
        order_row(2, "2.00"),
        order_row(3, "3.00"),
        order_row(4, "4.00"),
        order_row(5, "5.00"),
    ];
    wait_for_rows(&warehouse, &expected).await;

    shutdown_tx.shutdown().unwrap();
    let phase = handle.await.unwrap().unwrap();

    assert_eq!(phase, ReplicationPhase::IncrementalConsuming);
    assert_eq!(
        sorted_by_id(warehouse.table_rows("orders").await.unwrap()),
        expected
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cloud_run_loads_an_external_snapshot() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    source.create_table(orders_table(), orders_columns()).await;
    let warehouse = MemoryWarehouse::new();
    let staging = memory_staging("replication-cloud");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::Cloud, &[&table]);

    // Exported outside of the replicator.
    let shard = encode_rows(&[order_row(7, "7.00"), order_row(8, "8.00")]).unwrap();
    snapshot_store(&staging)
        .put("db1.orders.000000.csv", Bytes::from(shard))
        .await
        .unwrap();

    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handle = tokio::spawn(async move { replication.run(shutdown_rx).await });

    wait_for_rows(&warehouse, &[order_row(7, "7.00"), order_row(8, "8.00")]).await;
    shutdown_tx.shutdown().unwrap();
    let phase = handle.await.unwrap().unwrap();

    assert_eq!(phase, ReplicationPhase::IncrementalConsuming);
    assert_eq!(source.shard_reads().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_only_resumes_after_the_checkpoint() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let warehouse = MemoryWarehouse::new();
    warehouse
        .seed_table(
            "orders",
            orders_columns(),
            vec![order_row(1, "1.00"), order_row(2, "2.00")],
        )
        .await;
    let staging = memory_staging("replication-resume");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::IncrementalOnly, &[&table]);

    let increment = increment_store(&staging);
    let definition = orders_definition(1, orders_columns());
    write_schema(&increment, &definition).await;
    ChangeBatch::new(&definition)
        .update(10, order_row(1, "1.50"))
        .write(&increment, "CDC000001.csv")
        .await;

    let mut first = memory_replication(&table, &source, &warehouse, &staging, &config);
    assert_eq!(first.consume_pending().await.unwrap(), 1);
    assert_eq!(first.consume_pending().await.unwrap(), 0);

    ChangeBatch::new(&definition)
        .insert(11, order_row(3, "3.00"))
        .write(&increment, "CDC000002.csv")
        .await;

    // A restarted replicator only applies the new batch.
    let mut restarted = memory_replication(&table, &source, &warehouse, &staging, &config);
    assert_eq!(restarted.consume_pending().await.unwrap(), 1);

    let merges = warehouse
        .statements()
        .await
        .into_iter()
        .filter(|statement| statement.starts_with("MERGE INTO orders"))
        .count();
    assert_eq!(merges, 2);
    assert_eq!(
        sorted_by_id(warehouse.table_rows("orders").await.unwrap()),
        vec![
            order_row(1, "1.50"),
            order_row(2, "2.00"),
            order_row(3, "3.00")
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_only_versions_are_checkpointed() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let warehouse = MemoryWarehouse::new();
    warehouse
        .seed_table("orders", orders_columns(), vec![order_row(1, "1.00")])
        .await;
    let staging = memory_staging("replication-schema-only");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::IncrementalOnly, &[&table]);

    let increment = increment_store(&staging);
    write_schema(&increment, &orders_definition(1, orders_columns())).await;
    write_schema(&increment, &orders_definition(2, orders_columns_with_shipped())).await;

    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);
    assert_eq!(replication.consume_pending().await.unwrap(), 0);
    assert_eq!(replication.checkpoint(), Some(&Checkpoint::new(2, None)));
    assert_eq!(
        warehouse.table_columns("orders").await.unwrap(),
        orders_columns_with_shipped()
    );

    warehouse.clear_statements().await;
    assert_eq!(replication.consume_pending().await.unwrap(), 0);
    assert!(warehouse.statements().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_merge_failures_are_retried() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let warehouse = MemoryWarehouse::new();
    warehouse
        .seed_table("orders", orders_columns(), vec![order_row(1, "1.00")])
        .await;
    warehouse
        .fail_statements("MERGE INTO orders", 2, ErrorKind::DestinationConnectionFailed)
        .await;
    let staging = memory_staging("replication-retry");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::IncrementalOnly, &[&table]);

    let increment = increment_store(&staging);
    let definition = orders_definition(1, orders_columns());
    write_schema(&increment, &definition).await;
    ChangeBatch::new(&definition)
        .update(10, order_row(1, "9.00"))
        .write(&increment, "CDC000001.csv")
        .await;

    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);
    assert_eq!(replication.consume_pending().await.unwrap(), 1);
    assert_eq!(
        warehouse.table_rows("orders").await.unwrap(),
        vec![order_row(1, "9.00")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_merge_failures_stop_without_advancing_the_checkpoint() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let warehouse = MemoryWarehouse::new();
    warehouse
        .seed_table("orders", orders_columns(), vec![order_row(1, "1.00")])
        .await;
    warehouse
        .fail_statements("MERGE INTO orders", 1, ErrorKind::SchemaError)
        .await;
    let staging = memory_staging("replication-fatal");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::IncrementalOnly, &[&table]);

    let increment = increment_store(&staging);
    let definition = orders_definition(1, orders_columns());
    write_schema(&increment, &definition).await;
    ChangeBatch::new(&definition)
        .update(10, order_row(1, "9.00"))
        .write(&increment, "CDC000001.csv")
        .await;

    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);
    let err = replication.consume_pending().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SchemaError);
    assert_eq!(replication.checkpoint(), Some(&Checkpoint::new(1, None)));
    assert_eq!(
        warehouse.table_rows("orders").await.unwrap(),
        vec![order_row(1, "1.00")]
    );

    // The batch is applied once the warehouse accepts it again.
    assert_eq!(replication.consume_pending().await.unwrap(), 1);
    assert_eq!(
        warehouse.table_rows("orders").await.unwrap(),
        vec![order_row(1, "9.00")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_after_an_aborted_version_does_not_repeat_its_ddl() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let warehouse = MemoryWarehouse::new();
    warehouse
        .seed_table("orders", orders_columns(), vec![order_row(1, "1.00")])
        .await;
    let staging = memory_staging("replication-aborted-version");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::IncrementalOnly, &[&table]);

    let increment = increment_store(&staging);
    let initial = orders_definition(1, orders_columns());
    write_schema(&increment, &initial).await;
    ChangeBatch::new(&initial)
        .update(10, order_row(1, "1.50"))
        .write(&increment, "CDC000001.csv")
        .await;

    let mut first = memory_replication(&table, &source, &warehouse, &staging, &config);
    assert_eq!(first.consume_pending().await.unwrap(), 1);

    let widened = orders_definition(2, orders_columns_with_shipped())
        .with_query("ALTER TABLE `db1`.`orders` ADD COLUMN `shipped` BOOL");
    write_schema(&increment, &widened).await;
    let file = ChangeBatch::new(&widened)
        .update(20, shipped_row(1, "1.50", Some(true)))
        .write(&increment, "CDC000001.csv")
        .await;

    // Every merge attempt of the new version fails, the run gives up after its DDL.
    warehouse
        .fail_statements("MERGE INTO orders", 3, ErrorKind::DestinationConnectionFailed)
        .await;
    first.consume_pending().await.unwrap_err();
    assert_eq!(first.checkpoint(), Some(&Checkpoint::new(2, None)));

    let mut restarted = memory_replication(&table, &source, &warehouse, &staging, &config);
    assert_eq!(restarted.consume_pending().await.unwrap(), 1);

    let add_column = warehouse
        .statements()
        .await
        .into_iter()
        .filter(|statement| statement.contains("ADD COLUMN shipped"))
        .count();
    assert_eq!(add_column, 1);
    assert_eq!(
        warehouse.table_columns("orders").await.unwrap(),
        orders_columns_with_shipped()
    );
    assert_eq!(
        warehouse.table_rows("orders").await.unwrap(),
        vec![shipped_row(1, "1.50", Some(true))]
    );
    assert_eq!(restarted.checkpoint(), Some(&Checkpoint::new(2, Some(file))));
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_load_deadline_applies_to_each_shard() {
    init_test_tracing();
    let source = source_with_orders(10).await;
    let warehouse = MemoryWarehouse::new();
    let staging = memory_staging("replication-load-deadline");
    let table = orders_table();
    let mut config = test_replication_config(ReplicationMode::SnapshotOnly, &[&table]);
    config.operation_timeout_ms = 250;
    let mut replication = memory_replication(&table, &source, &warehouse, &staging, &config);

    replication.copy_schema().await.unwrap();
    let (_, export) = replication.export_snapshot().await.unwrap();
    assert_eq!(export.files.len(), 2);

    // Two loads of 150ms each outlast the deadline together, not one by one.
    warehouse.set_statement_delay(Duration::from_millis(150)).await;
    assert_eq!(replication.load_snapshot().await.unwrap(), 10);

    warehouse.set_statement_delay(Duration::from_millis(400)).await;
    let err = replication.load_snapshot().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn storage_only_export_writes_the_snapshot_and_stops() {
    init_test_tracing();
    let source = source_with_orders(10).await;
    let staging = memory_staging("replication-storage-only");
    let table = orders_table();
    let config = test_replication_config(ReplicationMode::SnapshotOnly, &[&table]);
    let mut export =
        StorageExport::new(table.clone(), source.clone(), &staging, &config, None).unwrap();

    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let phase = export.run(shutdown_rx).await.unwrap();
    assert_eq!(phase, ReplicationPhase::Finished);

    let snapshot = snapshot_store(&staging);
    let files = snapshot.list("").await.unwrap();
    assert_eq!(files, vec!["db1.orders.000000.csv", "db1.orders.000001.csv"]);

    let mut rows = Vec::new();
    for file in &files {
        let data = snapshot.get(file).await.unwrap();
        rows.extend(decode_rows(&data, orders_columns().len()).unwrap());
    }
    let expected: Vec<TableRow> = (1..=10)
        .map(|id| order_row(id, &format!("{id}.00")))
        .collect();
    assert_eq!(sorted_by_id(rows), expected);

    assert!(increment_store(&staging).list("").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn storage_only_export_rejects_modes_without_a_snapshot() {
    init_test_tracing();
    let source = source_with_orders(1).await;
    let staging = memory_staging("replication-storage-only-modes");
    let table = orders_table();

    for mode in [ReplicationMode::IncrementalOnly, ReplicationMode::Cloud] {
        let config = test_replication_config(mode, &[&table]);
        let Err(err) = StorageExport::new(table.clone(), source.clone(), &staging, &config, None)
        else {
            panic!("{mode} storage-only export was accepted");
        };
        assert_eq!(err.kind(), ErrorKind::ConfigError, "{mode}");
    }
}
