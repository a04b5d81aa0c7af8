use std::sync::Arc;

use dwsync::connector::Connector;
use dwsync::connector::memory::{MemoryConnector, MemoryWarehouse};
use dwsync::error::ErrorKind;
use dwsync::snapshot::SnapshotExporter;
use dwsync::source::MemorySource;
use dwsync::storage::{
    StagingStore, StorageCredentials, StorageScheme, StorageUri, derive_paths,
    resolve_credentials_with,
};
use dwsync::test_utils::table::{order_row, orders_columns, orders_table, sorted_by_id};
use dwsync_telemetry::init_test_tracing;
use rand::random;

#[test]
fn configured_root_resolves_to_snapshot_and_increment_locations() {
    let root =
        StorageUri::parse("s3://warehouse-staging/dwsync/prod/?region=eu-central-1").unwrap();
    let (snapshot, increment) = derive_paths(&root);

    assert_eq!(
        snapshot.to_string(),
        "s3://warehouse-staging/dwsync/prod/snapshot"
    );
    assert_eq!(
        increment.to_string(),
        "s3://warehouse-staging/dwsync/prod/increment"
    );
    assert_eq!(increment.region(), Some("eu-central-1"));
    assert_eq!(
        increment.url_for("db1/orders/1/CDC000001.csv"),
        "s3://warehouse-staging/dwsync/prod/increment/db1/orders/1/CDC000001.csv"
    );
}

#[test]
fn unresolvable_locations_and_credentials_are_fatal() {
    let err = StorageUri::parse("ftp://host/path").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStorageUri);

    let err = StorageUri::parse("gs:///no-bucket").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStorageUri);

    let s3 = StorageUri::parse("s3://bucket/prefix").unwrap();
    let err = resolve_credentials_with(&s3, None, |_| None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);

    let gcs = StorageUri::parse("gs://bucket/prefix").unwrap();
    let credentials = resolve_credentials_with(&gcs, None, |_| None).unwrap();
    assert_eq!(credentials.kind(), "ambient");
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_round_trips_through_a_local_directory() {
    init_test_tracing();
    let directory = std::env::temp_dir().join(format!("dwsync-staging-{}", random::<u32>()));
    std::fs::create_dir_all(&directory).unwrap();

    let root = StorageUri::parse(&format!("file://{}", directory.display())).unwrap();
    assert_eq!(root.scheme(), StorageScheme::File);
    let (snapshot_uri, _) = derive_paths(&root);

    let source = Arc::new(MemorySource::new());
    let table = orders_table();
    source.create_table(table.clone(), orders_columns()).await;
    let rows = (1..=20)
        .map(|id| order_row(id, &format!("{id}.00")))
        .collect::<Vec<_>>();
    source.insert_rows(&table, rows.clone()).await.unwrap();

    let store = StagingStore::open(snapshot_uri.clone(), &StorageCredentials::None).unwrap();
    let export = SnapshotExporter::new(source.clone(), store, 3)
        .export(&table, &orders_columns(), None)
        .await
        .unwrap();
    assert_eq!(export.rows, 20);
    for file in &export.files {
        assert!(directory.join("snapshot").join(file).exists());
    }

    let warehouse = MemoryWarehouse::new();
    let mut connector = MemoryConnector::new(
        warehouse.clone(),
        "orders",
        "snapshot_external_orders",
        snapshot_uri,
        StorageCredentials::None,
    );
    connector
        .copy_table_schema(source.as_ref(), &table)
        .await
        .unwrap();
    let loaded = connector
        .load_snapshot("orders", &table.snapshot_file_prefix(), |_| {})
        .await
        .unwrap();

    assert_eq!(loaded, 20);
    assert_eq!(
        sorted_by_id(warehouse.table_rows("orders").await.unwrap()),
        rows
    );

    std::fs::remove_dir_all(&directory).unwrap();
}
