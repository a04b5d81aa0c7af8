use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::sync_error;
use crate::types::{ColumnType, TableColumn};

/// Fully qualified source table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub database: String,
    pub name: String,
}

impl TableName {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }

    /// Path segment used for staged files of this table, `<database>/<table>`.
    pub fn storage_path(&self) -> String {
        format!("{}/{}", self.database, self.name)
    }

    /// File name prefix of snapshot shards, `<database>.<table>.`.
    pub fn snapshot_file_prefix(&self) -> String {
        format!("{}.{}.", self.database, self.name)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

impl FromStr for TableName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((database, name))
                if !database.is_empty() && !name.is_empty() && !name.contains('.') =>
            {
                Ok(TableName::new(database, name))
            }
            _ => Err(sync_error!(
                ErrorKind::ConfigError,
                "Table name must be written as `database.table`",
                s
            )),
        }
    }
}

/// Versioned definition of a table as published by the CDC service.
///
/// One definition is written per table version; the first one describes the table when the
/// changefeed started and later ones carry the DDL that produced them in `query`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTableDefinition")]
pub struct TableDefinition {
    pub table: TableName,
    /// Schema version of the whole cluster when the definition was written.
    pub schema_version: u64,
    /// Version of this table's definition; equals the commit timestamp of its DDL.
    pub table_version: u64,
    /// DDL statement that produced this version, empty for the initial definition.
    pub query: String,
    pub columns: Vec<TableColumn>,
}

impl TableDefinition {
    pub fn new(table: TableName, table_version: u64, columns: Vec<TableColumn>) -> Self {
        Self {
            table,
            schema_version: 0,
            table_version,
            query: String::new(),
            columns,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Parses a `schema.json` document.
    pub fn from_json(bytes: &[u8]) -> SyncResult<Arc<Self>> {
        let definition: TableDefinition = serde_json::from_slice(bytes)?;
        Ok(Arc::new(definition))
    }

    /// Primary key columns in ordinal order.
    pub fn primary_key(&self) -> Vec<&TableColumn> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTableDefinition {
    table: String,
    schema: String,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    table_version: u64,
    #[serde(default)]
    query: String,
    #[serde(default, rename = "TableColumns")]
    columns: Vec<RawTableColumn>,
    #[serde(default, rename = "TableColumnsTotal")]
    total_columns: Option<usize>,
}

/// Column entry of a `schema.json`. Numeric and boolean attributes are encoded as strings.
#[derive(Deserialize)]
struct RawTableColumn {
    #[serde(rename = "ColumnName")]
    name: String,
    #[serde(rename = "ColumnType")]
    column_type: String,
    #[serde(rename = "ColumnPrecision", default)]
    precision: Option<String>,
    #[serde(rename = "ColumnScale", default)]
    scale: Option<String>,
    #[serde(rename = "ColumnNullable", default)]
    nullable: Option<String>,
    #[serde(rename = "ColumnIsPk", default)]
    is_pk: Option<String>,
}

impl TryFrom<RawTableDefinition> for TableDefinition {
    type Error = SyncError;

    fn try_from(raw: RawTableDefinition) -> Result<Self, Self::Error> {
        if let Some(total) = raw.total_columns
            && total != raw.columns.len()
        {
            return Err(sync_error!(
                ErrorKind::DeserializationError,
                "Table definition column count mismatch",
                format!(
                    "{}.{} declares {total} columns but lists {}",
                    raw.schema,
                    raw.table,
                    raw.columns.len()
                )
            ));
        }

        let columns = raw
            .columns
            .into_iter()
            .map(TableColumn::try_from)
            .collect::<SyncResult<Vec<_>>>()?;

        Ok(TableDefinition {
            table: TableName::new(raw.schema, raw.table),
            schema_version: raw.version,
            table_version: raw.table_version,
            query: raw.query,
            columns,
        })
    }
}

impl TryFrom<RawTableColumn> for TableColumn {
    type Error = SyncError;

    fn try_from(raw: RawTableColumn) -> Result<Self, Self::Error> {
        let precision = parse_optional_number(raw.precision.as_deref())?;
        let scale = parse_optional_number(raw.scale.as_deref())?;
        let column_type = ColumnType::parse(&raw.column_type, precision, scale)?;
        let primary_key = is_true(raw.is_pk.as_deref());

        Ok(TableColumn {
            name: raw.name,
            column_type,
            nullable: is_true(raw.nullable.as_deref()) && !primary_key,
            primary_key,
        })
    }
}

fn parse_optional_number(value: Option<&str>) -> SyncResult<Option<u32>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => Ok(Some(value.parse()?)),
    }
}

fn is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS_V2: &str = r#"{
        "Table": "orders",
        "Schema": "db1",
        "Version": 1,
        "TableVersion": 446325912416845826,
        "Query": "ALTER TABLE `db1`.`orders` ADD COLUMN `shipped` BOOL",
        "Type": 5,
        "TableColumns": [
            {"ColumnName": "id", "ColumnType": "INT", "ColumnPrecision": "11", "ColumnIsPk": "true"},
            {"ColumnName": "amount", "ColumnType": "DECIMAL", "ColumnPrecision": "10", "ColumnScale": "2", "ColumnNullable": "true"},
            {"ColumnName": "shipped", "ColumnType": "TINYINT", "ColumnPrecision": "1", "ColumnNullable": "true"}
        ],
        "TableColumnsTotal": 3
    }"#;

    #[test]
    fn parses_changefeed_schema_file() {
        let definition = TableDefinition::from_json(ORDERS_V2.as_bytes()).unwrap();

        assert_eq!(definition.table, TableName::new("db1", "orders"));
        assert_eq!(definition.table_version, 446325912416845826);
        assert!(definition.query.contains("ADD COLUMN"));
        assert_eq!(definition.columns.len(), 3);

        let key = definition.primary_key();
        assert_eq!(key.len(), 1);
        assert_eq!(key[0].name, "id");
        assert!(!key[0].nullable);

        let amount = definition.column("amount").unwrap();
        assert_eq!(
            amount.column_type,
            ColumnType::Decimal {
                precision: 10,
                scale: 2
            }
        );
        assert!(amount.nullable);
        assert_eq!(
            definition.column("shipped").unwrap().column_type,
            ColumnType::Boolean
        );
    }

    #[test]
    fn column_count_mismatch_is_rejected() {
        let json = ORDERS_V2.replace("\"TableColumnsTotal\": 3", "\"TableColumnsTotal\": 4");
        let err = TableDefinition::from_json(json.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }

    #[test]
    fn table_name_parsing() {
        let name: TableName = "db1.orders".parse().unwrap();
        assert_eq!(name.to_string(), "db1.orders");
        assert_eq!(name.storage_path(), "db1/orders");
        assert_eq!(name.snapshot_file_prefix(), "db1.orders.");
        assert!("orders".parse::<TableName>().is_err());
        assert!("a.b.c".parse::<TableName>().is_err());
    }
}
