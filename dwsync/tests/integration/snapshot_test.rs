use std::collections::HashSet;
use std::sync::Arc;

use dwsync::codec::decode_rows;
use dwsync::snapshot::SnapshotExporter;
use dwsync::source::{MemorySource, Source};
use dwsync::test_utils::staging::{memory_staging, snapshot_store};
use dwsync::test_utils::table::{order_row, orders_columns, orders_table, sorted_by_id};
use dwsync::types::{ColumnType, TableColumn, TableName, TableRow};
use dwsync_telemetry::init_test_tracing;
use rand::Rng;

async fn exported_rows(
    exporter: &SnapshotExporter<MemorySource>,
    files: &[String],
    width: usize,
) -> Vec<TableRow> {
    let mut rows = Vec::new();
    for file in files {
        let data = exporter.store().get(file).await.unwrap();
        rows.extend(decode_rows(&data, width).unwrap());
    }

    rows
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_shards_partition_the_table() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let table = orders_table();
    source.create_table(table.clone(), orders_columns()).await;

    let mut rng = rand::thread_rng();
    let mut ids = HashSet::new();
    while ids.len() < 500 {
        ids.insert(rng.gen_range(-10_000..10_000i64));
    }
    let rows: Vec<TableRow> = ids
        .iter()
        .map(|id| order_row(*id, &format!("{}.00", id.abs())))
        .collect();
    source.insert_rows(&table, rows.clone()).await.unwrap();

    let exporter = SnapshotExporter::new(
        source.clone(),
        snapshot_store(&memory_staging("snapshot-partition")),
        4,
    );
    let export = exporter.export(&table, &orders_columns(), None).await.unwrap();

    assert_eq!(export.files.len(), 4);
    assert_eq!(export.rows, 500);
    assert_eq!(source.shard_reads().await, 4);

    let exported = exported_rows(&exporter, &export.files, 2).await;
    assert_eq!(sorted_by_id(exported), sorted_by_id(rows));
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_without_an_integer_key_are_split_by_hash() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let table = TableName::new("db1", "customers");
    let columns = vec![
        TableColumn::new("email", ColumnType::Varchar { length: Some(255) }, false).primary(),
        TableColumn::new("name", ColumnType::Text, true),
    ];
    source.create_table(table.clone(), columns.clone()).await;

    let rows: Vec<TableRow> = (0..100)
        .map(|i| TableRow::from_iter([Some(format!("user{i}@example.com")), None]))
        .collect();
    source.insert_rows(&table, rows.clone()).await.unwrap();

    let exporter = SnapshotExporter::new(
        source,
        snapshot_store(&memory_staging("snapshot-hash")),
        3,
    );
    let export = exporter.export(&table, &columns, None).await.unwrap();
    assert_eq!(export.rows, 100);

    let mut exported = exported_rows(&exporter, &export.files, 2).await;
    let mut expected = rows;
    exported.sort_by(|a, b| a.values().cmp(b.values()));
    expected.sort_by(|a, b| a.values().cmp(b.values()));
    assert_eq!(exported, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn rows_committed_after_the_snapshot_timestamp_are_not_exported() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let table = orders_table();
    source.create_table(table.clone(), orders_columns()).await;

    let snapshot_ts = source
        .insert_rows(&table, vec![order_row(1, "1.00"), order_row(2, "2.00")])
        .await
        .unwrap();
    source
        .insert_rows(&table, vec![order_row(3, "3.00")])
        .await
        .unwrap();

    let exporter = SnapshotExporter::new(
        source,
        snapshot_store(&memory_staging("snapshot-as-of")),
        2,
    );
    let export = exporter
        .export(&table, &orders_columns(), Some(snapshot_ts))
        .await
        .unwrap();

    let exported = exported_rows(&exporter, &export.files, 2).await;
    assert_eq!(
        sorted_by_id(exported),
        vec![order_row(1, "1.00"), order_row(2, "2.00")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn export_is_the_table_as_of_the_snapshot_timestamp() {
    init_test_tracing();
    let source = Arc::new(MemorySource::new());
    let table = orders_table();
    source.create_table(table.clone(), orders_columns()).await;
    let rows: Vec<TableRow> = (1..=10).map(|id| order_row(id, "1.00")).collect();
    source.insert_rows(&table, rows.clone()).await.unwrap();
    let snapshot_ts = source.current_ts().await.unwrap();

    // Deleted and inserted after the snapshot timestamp, before the export runs.
    source.delete_rows(&table, &["10"]).await.unwrap();
    source
        .insert_rows(&table, vec![order_row(11, "1.00")])
        .await
        .unwrap();

    let exporter = SnapshotExporter::new(
        source.clone(),
        snapshot_store(&memory_staging("snapshot-point-in-time")),
        3,
    );
    let export = exporter
        .export(&table, &orders_columns(), Some(snapshot_ts))
        .await
        .unwrap();

    assert_eq!(export.rows, 10);
    let exported = exported_rows(&exporter, &export.files, 2).await;
    assert_eq!(sorted_by_id(exported), rows);
}
