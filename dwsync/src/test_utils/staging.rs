use bytes::Bytes;
use serde_json::json;

use crate::codec::NULL_MARKER;
use crate::increment::SCHEMA_FILE;
use crate::merge::ChangeOp;
use crate::storage::{
    INCREMENT_SUBPATH, SNAPSHOT_SUBPATH, StagingStore, StorageCredentials, StorageUri,
};
use crate::types::{ColumnType, CommitTs, TableDefinition, TableRow};

/// Staging root on a `memory://` bucket.
///
/// Buckets are shared by name within the process, so each test uses its own.
pub fn memory_staging(bucket: &str) -> StagingStore {
    let root = StorageUri::parse(&format!("memory://{bucket}/dwsync")).unwrap();
    StagingStore::open(root, &StorageCredentials::None).unwrap()
}

pub fn snapshot_store(staging: &StagingStore) -> StagingStore {
    staging.at(SNAPSHOT_SUBPATH)
}

pub fn increment_store(staging: &StagingStore) -> StagingStore {
    staging.at(INCREMENT_SUBPATH)
}

/// Renders `definition` the way the CDC service writes `schema.json`.
pub fn schema_json(definition: &TableDefinition) -> String {
    let columns: Vec<serde_json::Value> = definition
        .columns
        .iter()
        .map(|column| {
            let (type_name, precision, scale) = match column.column_type {
                ColumnType::Decimal { precision, scale } => {
                    ("DECIMAL".to_string(), Some(precision), Some(scale))
                }
                ColumnType::Boolean => ("TINYINT".to_string(), Some(1), None),
                other => (other.to_string(), None, None),
            };

            json!({
                "ColumnName": column.name,
                "ColumnType": type_name,
                "ColumnPrecision": precision.map(|p| p.to_string()).unwrap_or_default(),
                "ColumnScale": scale.map(|s| s.to_string()).unwrap_or_default(),
                "ColumnNullable": column.nullable.to_string(),
                "ColumnIsPk": column.primary_key.to_string(),
            })
        })
        .collect();

    json!({
        "Table": definition.table.name,
        "Schema": definition.table.database,
        "Version": 1,
        "TableVersion": definition.table_version,
        "Query": definition.query,
        "TableColumns": columns,
        "TableColumnsTotal": definition.columns.len(),
    })
    .to_string()
}

/// Writes the `schema.json` of `definition` below the incremental root.
pub async fn write_schema(increment: &StagingStore, definition: &TableDefinition) {
    let path = format!(
        "{}/{}/{SCHEMA_FILE}",
        definition.table.storage_path(),
        definition.table_version
    );
    increment
        .put(&path, Bytes::from(schema_json(definition)))
        .await
        .unwrap();
}

/// Builder of a change batch in the CDC service's CSV layout.
#[derive(Debug, Clone)]
pub struct ChangeBatch<'a> {
    definition: &'a TableDefinition,
    records: Vec<(ChangeOp, CommitTs, TableRow)>,
}

impl<'a> ChangeBatch<'a> {
    pub fn new(definition: &'a TableDefinition) -> Self {
        Self {
            definition,
            records: Vec::new(),
        }
    }

    pub fn insert(self, commit_ts: CommitTs, row: TableRow) -> Self {
        self.record(ChangeOp::Insert, commit_ts, row)
    }

    pub fn update(self, commit_ts: CommitTs, row: TableRow) -> Self {
        self.record(ChangeOp::Update, commit_ts, row)
    }

    pub fn delete(self, commit_ts: CommitTs, row: TableRow) -> Self {
        self.record(ChangeOp::Delete, commit_ts, row)
    }

    fn record(mut self, op: ChangeOp, commit_ts: CommitTs, row: TableRow) -> Self {
        self.records.push((op, commit_ts, row));
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        for (op, commit_ts, row) in &self.records {
            let mut record = vec![
                op.as_str().to_string(),
                self.definition.table.name.clone(),
                self.definition.table.database.clone(),
                commit_ts.to_string(),
            ];
            record.extend(
                row.values()
                    .iter()
                    .map(|value| value.clone().unwrap_or_else(|| NULL_MARKER.to_string())),
            );
            writer.write_record(&record).unwrap();
        }

        Bytes::from(writer.into_inner().unwrap())
    }

    /// Writes the batch as `file_name` in the directory of its table version and returns its
    /// path relative to the incremental root.
    pub async fn write(&self, increment: &StagingStore, file_name: &str) -> String {
        let path = format!(
            "{}/{}/{file_name}",
            self.definition.table.storage_path(),
            self.definition.table_version
        );
        increment.put(&path, self.encode()).await.unwrap();

        path
    }
}
