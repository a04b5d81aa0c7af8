use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncResult;
use crate::storage::StagingStore;
use crate::types::TableName;

/// Directory below the incremental root holding replicator state.
const STATE_DIR: &str = "_dwsync/checkpoints";

/// Position of the last change batch merged into the warehouse.
///
/// `file` is `None` when the table version was reached through its schema file only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub table_version: u64,
    pub file: Option<String>,
}

impl Checkpoint {
    pub fn new(table_version: u64, file: Option<String>) -> Self {
        Self {
            table_version,
            file,
        }
    }

    /// Whether the batch at `file` of `table_version` comes after this position.
    pub fn precedes(&self, table_version: u64, file: &str) -> bool {
        match table_version.cmp(&self.table_version) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.file.as_deref().is_none_or(|applied| file > applied),
        }
    }
}

/// Durable checkpoints of the tables replicated from one incremental root.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    store: StagingStore,
}

impl CheckpointStore {
    /// `store` is rooted at the incremental location.
    pub fn new(store: StagingStore) -> Self {
        Self {
            store: store.at(STATE_DIR),
        }
    }

    fn object_name(table: &TableName) -> String {
        format!("{table}.json")
    }

    pub async fn load(&self, table: &TableName) -> SyncResult<Option<Checkpoint>> {
        match self.store.get_opt(&Self::object_name(table)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, table: &TableName, checkpoint: &Checkpoint) -> SyncResult<()> {
        let data = serde_json::to_vec(checkpoint)?;
        self.store
            .put(&Self::object_name(table), Bytes::from(data))
            .await?;

        debug!(%table, table_version = checkpoint.table_version, file = ?checkpoint.file, "saved checkpoint");

        Ok(())
    }

    pub async fn clear(&self, table: &TableName) -> SyncResult<()> {
        self.store.delete(&Self::object_name(table)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageCredentials, StorageUri};

    #[test]
    fn ordering_follows_version_then_file() {
        let checkpoint = Checkpoint::new(10, Some("db1/orders/10/CDC000002.csv".to_string()));

        assert!(!checkpoint.precedes(9, "db1/orders/9/CDC000009.csv"));
        assert!(!checkpoint.precedes(10, "db1/orders/10/CDC000001.csv"));
        assert!(!checkpoint.precedes(10, "db1/orders/10/CDC000002.csv"));
        assert!(checkpoint.precedes(10, "db1/orders/10/CDC000003.csv"));
        assert!(checkpoint.precedes(11, "db1/orders/11/CDC000001.csv"));

        let schema_only = Checkpoint::new(10, None);
        assert!(schema_only.precedes(10, "db1/orders/10/CDC000001.csv"));
    }

    #[tokio::test]
    async fn checkpoints_survive_reopening() {
        let root = StorageUri::parse("memory://checkpoints/dw/increment").unwrap();
        let table = TableName::new("db1", "orders");
        let checkpoint = Checkpoint::new(7, Some("db1/orders/7/CDC000001.csv".to_string()));

        let store = CheckpointStore::new(StagingStore::open(root.clone(), &StorageCredentials::None).unwrap());
        assert!(store.load(&table).await.unwrap().is_none());
        store.save(&table, &checkpoint).await.unwrap();

        let reopened = CheckpointStore::new(StagingStore::open(root, &StorageCredentials::None).unwrap());
        assert_eq!(reopened.load(&table).await.unwrap(), Some(checkpoint));

        reopened.clear(&table).await.unwrap();
        assert!(reopened.load(&table).await.unwrap().is_none());
    }
}
