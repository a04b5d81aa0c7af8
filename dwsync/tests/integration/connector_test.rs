use dwsync::connector::Connector;
use dwsync::connector::memory::{MemoryConnector, MemoryWarehouse};
use dwsync::error::ErrorKind;
use dwsync::source::MemorySource;
use dwsync::storage::StorageCredentials;
use dwsync::test_utils::staging::{ChangeBatch, increment_store, memory_staging, write_schema};
use dwsync::test_utils::table::{
    assert_columns, order_row, orders_columns, orders_columns_with_shipped, orders_definition,
    orders_table, sorted_by_id,
};
use dwsync::types::{ColumnType, TableRow};
use dwsync_telemetry::init_test_tracing;

fn connector(warehouse: &MemoryWarehouse, bucket: &str) -> MemoryConnector {
    let staging = memory_staging(bucket);
    MemoryConnector::new(
        warehouse.clone(),
        "orders",
        "increment_external_orders",
        increment_store(&staging).root().clone(),
        StorageCredentials::None,
    )
}

async fn seeded(warehouse: &MemoryWarehouse, bucket: &str) -> MemoryConnector {
    let source = MemorySource::new();
    source.create_table(orders_table(), orders_columns()).await;

    let mut connector = connector(warehouse, bucket);
    connector
        .copy_table_schema(&source, &orders_table())
        .await
        .unwrap();

    connector
}

#[tokio::test(flavor = "multi_thread")]
async fn loading_the_same_change_batch_twice_equals_loading_it_once() {
    init_test_tracing();
    let warehouse = MemoryWarehouse::new();
    let mut connector = seeded(&warehouse, "connector-idempotent").await;
    let increment = increment_store(&memory_staging("connector-idempotent"));

    let definition = orders_definition(1, orders_columns());
    write_schema(&increment, &definition).await;
    let file = ChangeBatch::new(&definition)
        .insert(10, order_row(1, "10.00"))
        .insert(11, order_row(2, "20.00"))
        .update(12, order_row(1, "15.00"))
        .delete(13, order_row(2, "20.00"))
        .insert(14, order_row(3, "30.00"))
        .write(&increment, "CDC000001.csv")
        .await;

    connector
        .load_increment(&definition, increment.root(), &file)
        .await
        .unwrap();
    let once = warehouse.table_rows("orders").await.unwrap();

    connector
        .load_increment(&definition, increment.root(), &file)
        .await
        .unwrap();
    let twice = warehouse.table_rows("orders").await.unwrap();

    assert_eq!(sorted_by_id(once.clone()), sorted_by_id(twice));
    assert_eq!(
        sorted_by_id(once),
        vec![order_row(1, "15.00"), order_row(3, "30.00")]
    );
    assert!(!warehouse.has_table("increment_external_orders").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn loading_a_snapshot_without_shards_loads_nothing() {
    init_test_tracing();
    let warehouse = MemoryWarehouse::new();
    let mut connector = seeded(&warehouse, "connector-empty-snapshot").await;

    let mut progress = Vec::new();
    let rows = connector
        .load_snapshot("orders", "db1.orders.", |rows| progress.push(rows))
        .await
        .unwrap();

    assert_eq!(rows, 0);
    assert!(progress.is_empty());
    assert_eq!(warehouse.table_rows("orders").await, Some(vec![]));
}

#[tokio::test(flavor = "multi_thread")]
async fn ddl_before_schema_initialization_is_rejected_without_executing_anything() {
    init_test_tracing();
    let warehouse = MemoryWarehouse::new();
    let mut connector = connector(&warehouse, "connector-precondition");

    let err = connector
        .exec_ddl(&orders_definition(2, orders_columns_with_shipped()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PreconditionError);
    assert!(warehouse.statements().await.is_empty());
    assert!(connector.columns().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn ddl_adds_columns_and_backfills_nulls() {
    init_test_tracing();
    let warehouse = MemoryWarehouse::new();
    let mut connector = seeded(&warehouse, "connector-add-column").await;
    warehouse
        .seed_table("orders", orders_columns(), vec![order_row(1, "1.00")])
        .await;

    connector
        .exec_ddl(
            &orders_definition(2, orders_columns_with_shipped())
                .with_query("ALTER TABLE `db1`.`orders` ADD COLUMN `shipped` BOOL"),
        )
        .await
        .unwrap();

    assert_columns(
        connector.columns(),
        &[
            ("id", ColumnType::Int { unsigned: false }, false),
            (
                "amount",
                ColumnType::Decimal {
                    precision: 10,
                    scale: 2,
                },
                true,
            ),
            ("shipped", ColumnType::Boolean, true),
        ],
    );
    assert_eq!(
        warehouse.table_rows("orders").await.unwrap(),
        vec![TableRow::from_iter([Some("1"), Some("1.00"), None])]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_ddl_midway_keeps_the_previous_columns() {
    init_test_tracing();
    let warehouse = MemoryWarehouse::new();
    let mut connector = seeded(&warehouse, "connector-partial-ddl").await;
    warehouse
        .fail_statements("DROP COLUMN amount", 1, ErrorKind::DestinationQueryFailed)
        .await;

    // Adds `shipped` and drops `amount`.
    let mut columns = orders_columns_with_shipped();
    columns.remove(1);
    let err = connector
        .exec_ddl(&orders_definition(3, columns))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialDdl);
    assert!(
        err.detail()
            .unwrap()
            .contains("ALTER TABLE orders ADD COLUMN shipped")
    );
    assert_eq!(connector.columns(), orders_columns().as_slice());
}

#[tokio::test(flavor = "multi_thread")]
async fn adding_an_existing_column_is_rejected() {
    init_test_tracing();
    let warehouse = MemoryWarehouse::new();
    let mut connector = seeded(&warehouse, "connector-existing-column").await;
    warehouse
        .seed_table("orders", orders_columns_with_shipped(), vec![])
        .await;

    let err = connector
        .exec_ddl(&orders_definition(2, orders_columns_with_shipped()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DdlExecutionFailed);
    assert_eq!(connector.columns(), orders_columns().as_slice());
    assert_eq!(
        warehouse.table_columns("orders").await.unwrap(),
        orders_columns_with_shipped()
    );
}
