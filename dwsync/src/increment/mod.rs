//! Discovery of change batches written by the CDC service.
//!
//! Below the incremental root every table has one directory per table version,
//! `<db>/<table>/<table_version>/`, holding the `schema.json` of that version and the change
//! batches `CDC<seq>.csv`, possibly inside date sub-directories. Versions sorted numerically,
//! then batch paths sorted lexically, give the change order.

mod checkpoint;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

pub use checkpoint::{Checkpoint, CheckpointStore};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::storage::StagingStore;
use crate::types::{TableDefinition, TableName};

/// Name of the table definition file of a table version.
pub const SCHEMA_FILE: &str = "schema.json";

/// Prefix of change batch file names.
const BATCH_FILE_PREFIX: &str = "CDC";

/// Change batches of one table version.
#[derive(Debug, Clone)]
pub struct VersionBatches {
    pub definition: Arc<TableDefinition>,
    /// Batch paths relative to the incremental root, in change order.
    pub files: Vec<String>,
}

impl VersionBatches {
    pub fn table_version(&self) -> u64 {
        self.definition.table_version
    }
}

#[derive(Debug, Default)]
struct VersionDir {
    has_schema: bool,
    files: Vec<String>,
}

/// Reads the change batches of one table from the incremental location.
#[derive(Debug, Clone)]
pub struct IncrementReader {
    store: StagingStore,
    table: TableName,
}

impl IncrementReader {
    /// `store` is rooted at the incremental location.
    pub fn new(store: StagingStore, table: TableName) -> Self {
        Self { store, table }
    }

    pub fn store(&self) -> &StagingStore {
        &self.store
    }

    fn version_dir(&self, table_version: u64) -> String {
        format!("{}/{table_version}", self.table.storage_path())
    }

    /// Definition of `table_version`, if its schema file exists.
    pub async fn definition(&self, table_version: u64) -> SyncResult<Option<Arc<TableDefinition>>> {
        let path = format!("{}/{SCHEMA_FILE}", self.version_dir(table_version));
        let Some(data) = self.store.get_opt(&path).await? else {
            return Ok(None);
        };

        let definition =
            TableDefinition::from_json(&data).map_err(|err| err.context(format!("parse {path}")))?;
        if definition.table != self.table || definition.table_version != table_version {
            bail!(
                ErrorKind::InvalidData,
                "Table definition does not match its location",
                format!(
                    "{path} describes {} version {}",
                    definition.table, definition.table_version
                )
            );
        }

        Ok(Some(definition))
    }

    /// Table versions holding work after `checkpoint`, in change order.
    ///
    /// A version later than the checkpoint is returned even without batches, its definition
    /// may carry a DDL. The scan stops at the first version whose schema file is not written
    /// yet, later batches cannot be applied before it.
    pub async fn pending(&self, checkpoint: Option<&Checkpoint>) -> SyncResult<Vec<VersionBatches>> {
        let table_dir = self.table.storage_path();
        let mut versions: BTreeMap<u64, VersionDir> = BTreeMap::new();

        for path in self.store.list(&table_dir).await? {
            let Some(rest) = path
                .strip_prefix(table_dir.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
            else {
                continue;
            };
            let Some((version, name)) = rest.split_once('/') else {
                continue;
            };
            let Ok(version) = version.parse::<u64>() else {
                continue;
            };

            let dir = versions.entry(version).or_default();
            let file_name = name.rsplit('/').next().unwrap_or(name);
            if name == SCHEMA_FILE {
                dir.has_schema = true;
            } else if file_name.starts_with(BATCH_FILE_PREFIX) && file_name.ends_with(".csv") {
                dir.files.push(path.clone());
            }
        }

        let mut pending = Vec::new();
        for (version, mut dir) in versions {
            if let Some(checkpoint) = checkpoint {
                if version < checkpoint.table_version {
                    continue;
                }
                dir.files.retain(|file| checkpoint.precedes(version, file));
                if version == checkpoint.table_version && dir.files.is_empty() {
                    continue;
                }
            }

            if !dir.has_schema {
                warn!(table = %self.table, version, "schema file not written yet, waiting");
                break;
            }

            let Some(definition) = self.definition(version).await? else {
                break;
            };

            dir.files.sort();
            debug!(table = %self.table, version, batches = dir.files.len(), "found pending table version");
            pending.push(VersionBatches {
                definition,
                files: dir.files,
            });
        }

        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::storage::{StorageCredentials, StorageUri};

    const SCHEMA: &str = r#"{
        "Table": "orders", "Schema": "db1", "TableVersion": __VERSION__,
        "TableColumns": [{"ColumnName": "id", "ColumnType": "INT", "ColumnIsPk": "true"}]
    }"#;

    fn reader(bucket: &str) -> IncrementReader {
        let root = StorageUri::parse(&format!("memory://{bucket}/dw/increment")).unwrap();
        let store = StagingStore::open(root, &StorageCredentials::None).unwrap();
        IncrementReader::new(store, TableName::new("db1", "orders"))
    }

    async fn put(reader: &IncrementReader, path: &str, data: String) {
        reader.store().put(path, Bytes::from(data)).await.unwrap();
    }

    async fn put_schema(reader: &IncrementReader, version: u64) {
        let schema = SCHEMA.replace("__VERSION__", &version.to_string());
        put(reader, &format!("db1/orders/{version}/schema.json"), schema).await;
    }

    #[tokio::test]
    async fn versions_and_batches_are_in_change_order() {
        let reader = reader("increment-order");
        put_schema(&reader, 100).await;
        put_schema(&reader, 99).await;
        put(&reader, "db1/orders/100/CDC000002.csv", String::new()).await;
        put(&reader, "db1/orders/100/CDC000001.csv", String::new()).await;
        put(&reader, "db1/orders/99/2024-01-02/CDC000001.csv", String::new()).await;
        put(&reader, "db1/orders/99/2024-01-01/CDC000003.csv", String::new()).await;
        put(&reader, "db1/orders/meta/schema_99.json", String::new()).await;
        put(&reader, "db1/orders/100/CDC.index", String::new()).await;

        let pending = reader.pending(None).await.unwrap();
        let order: Vec<(u64, Vec<String>)> = pending
            .iter()
            .map(|v| (v.table_version(), v.files.clone()))
            .collect();

        assert_eq!(
            order,
            vec![
                (
                    99,
                    vec![
                        "db1/orders/99/2024-01-01/CDC000003.csv".to_string(),
                        "db1/orders/99/2024-01-02/CDC000001.csv".to_string()
                    ]
                ),
                (
                    100,
                    vec![
                        "db1/orders/100/CDC000001.csv".to_string(),
                        "db1/orders/100/CDC000002.csv".to_string()
                    ]
                ),
            ]
        );
    }

    #[tokio::test]
    async fn applied_batches_are_skipped() {
        let reader = reader("increment-checkpoint");
        put_schema(&reader, 5).await;
        put(&reader, "db1/orders/5/CDC000001.csv", String::new()).await;
        put(&reader, "db1/orders/5/CDC000002.csv", String::new()).await;

        let checkpoint = Checkpoint::new(5, Some("db1/orders/5/CDC000001.csv".to_string()));
        let pending = reader.pending(Some(&checkpoint)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].files, vec!["db1/orders/5/CDC000002.csv"]);

        let done = Checkpoint::new(5, Some("db1/orders/5/CDC000002.csv".to_string()));
        assert!(reader.pending(Some(&done)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_waits_for_missing_schema_file() {
        let reader = reader("increment-missing-schema");
        put_schema(&reader, 1).await;
        put(&reader, "db1/orders/2/CDC000001.csv", String::new()).await;
        put_schema(&reader, 3).await;

        let pending = reader.pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].table_version(), 1);
    }

    #[tokio::test]
    async fn definition_must_match_its_directory() {
        let reader = reader("increment-mismatch");
        let schema = SCHEMA.replace("__VERSION__", "8");
        put(&reader, "db1/orders/9/schema.json", schema).await;

        let err = reader.definition(9).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
