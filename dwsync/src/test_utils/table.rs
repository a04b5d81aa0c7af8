use crate::types::{ColumnType, TableColumn, TableDefinition, TableName, TableRow};

pub fn orders_table() -> TableName {
    TableName::new("db1", "orders")
}

/// `db1.orders (id INT PRIMARY KEY, amount DECIMAL(10,2))`.
pub fn orders_columns() -> Vec<TableColumn> {
    vec![
        TableColumn::new("id", ColumnType::Int { unsigned: false }, false).primary(),
        TableColumn::new(
            "amount",
            ColumnType::Decimal {
                precision: 10,
                scale: 2,
            },
            true,
        ),
    ]
}

/// `orders_columns` widened with a nullable `shipped BOOL`.
pub fn orders_columns_with_shipped() -> Vec<TableColumn> {
    let mut columns = orders_columns();
    columns.push(TableColumn::new("shipped", ColumnType::Boolean, true));

    columns
}

pub fn orders_definition(table_version: u64, columns: Vec<TableColumn>) -> TableDefinition {
    TableDefinition::new(orders_table(), table_version, columns)
}

pub fn order_row(id: i64, amount: &str) -> TableRow {
    TableRow::new(vec![Some(id.to_string()), Some(amount.to_string())])
}

/// Rows sorted by their first value read as an integer.
///
/// Warehouse and source row order is not significant, tests compare sorted rows.
pub fn sorted_by_id(mut rows: Vec<TableRow>) -> Vec<TableRow> {
    rows.sort_by_key(|row| {
        row.values()
            .first()
            .cloned()
            .flatten()
            .and_then(|id| id.parse::<i64>().ok())
    });

    rows
}

/// Asserts that `actual` holds the columns `expected` by name, type and nullability.
///
/// # Panics
///
/// Panics on the first difference.
pub fn assert_columns(actual: &[TableColumn], expected: &[(&str, ColumnType, bool)]) {
    let actual: Vec<(&str, ColumnType, bool)> = actual
        .iter()
        .map(|c| (c.name.as_str(), c.column_type, c.nullable))
        .collect();

    assert_eq!(actual, expected, "column mismatch");
}
