use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::error::{ErrorKind, SyncResult};
use crate::merge::{key_indices, key_of};
use crate::source::{
    Shard, ShardPredicate, Source, hash_shards, int_range_shards, integer_key,
};
use crate::types::{SourceTs, TableColumn, TableDefinition, TableName, TableRow};
use crate::{bail, sync_error};

#[derive(Debug)]
struct VersionedRow {
    committed: SourceTs,
    deleted: Option<SourceTs>,
    row: TableRow,
}

impl VersionedRow {
    /// Whether the row exists as of `ts`, or now when `None`.
    fn visible_at(&self, ts: Option<SourceTs>) -> bool {
        match ts {
            Some(ts) => self.committed <= ts && self.deleted.is_none_or(|deleted| deleted > ts),
            None => self.deleted.is_none(),
        }
    }
}

#[derive(Debug)]
struct MemoryTable {
    columns: Vec<TableColumn>,
    rows: Vec<VersionedRow>,
}

#[derive(Debug)]
struct Inner {
    tables: HashMap<TableName, MemoryTable>,
    ts: SourceTs,
    shard_reads: usize,
    query_delay: Duration,
}

/// In-memory source database for tests.
///
/// Every write advances a logical clock, so reads as of an earlier timestamp see the rows
/// committed up to it, deleted ones included when they were deleted later.
#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        let inner = Inner {
            tables: HashMap::new(),
            ts: 1,
            shard_reads: 0,
            query_delay: Duration::ZERO,
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub async fn create_table(&self, table: TableName, columns: Vec<TableColumn>) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            table,
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// Inserts rows, committing them at a new timestamp which is returned.
    pub async fn insert_rows(&self, table: &TableName, rows: Vec<TableRow>) -> SyncResult<SourceTs> {
        let mut inner = self.inner.lock().await;
        inner.ts += 1;
        let ts = inner.ts;

        let Some(memory_table) = inner.tables.get_mut(table) else {
            bail!(ErrorKind::SourceQueryFailed, "Source table not found", table);
        };
        for row in rows {
            if row.len() != memory_table.columns.len() {
                bail!(
                    ErrorKind::InvalidData,
                    "Row does not match the table columns",
                    format!("{} values for {} columns", row.len(), memory_table.columns.len())
                );
            }
            memory_table.rows.push(VersionedRow {
                committed: ts,
                deleted: None,
                row,
            });
        }

        Ok(ts)
    }

    /// Deletes the rows whose key is `key`, committing the delete at a new timestamp which is
    /// returned.
    pub async fn delete_rows(&self, table: &TableName, key: &[&str]) -> SyncResult<SourceTs> {
        let mut inner = self.inner.lock().await;
        inner.ts += 1;
        let ts = inner.ts;

        let Some(memory_table) = inner.tables.get_mut(table) else {
            bail!(ErrorKind::SourceQueryFailed, "Source table not found", table);
        };
        let definition = TableDefinition::new(table.clone(), 0, memory_table.columns.clone());
        let indices = key_indices(&definition)?;
        for versioned in &mut memory_table.rows {
            if versioned.deleted.is_none() && key_of(&versioned.row, &indices)? == key {
                versioned.deleted = Some(ts);
            }
        }

        Ok(ts)
    }

    /// Rows of `table` as of now.
    pub async fn table_rows(&self, table: &TableName) -> Vec<TableRow> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|versioned| versioned.visible_at(None))
                    .map(|versioned| versioned.row.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Makes shard planning and shard reads take at least `delay`.
    pub async fn set_query_delay(&self, delay: Duration) {
        self.inner.lock().await.query_delay = delay;
    }

    async fn simulate_query(&self) {
        let delay = self.inner.lock().await.query_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Number of shard reads served so far.
    pub async fn shard_reads(&self) -> usize {
        self.inner.lock().await.shard_reads
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for MemorySource {
    async fn table_columns(&self, table: &TableName) -> SyncResult<Vec<TableColumn>> {
        let inner = self.inner.lock().await;
        match inner.tables.get(table) {
            Some(memory_table) => Ok(memory_table.columns.clone()),
            None => Err(sync_error!(
                ErrorKind::SchemaIntrospectionError,
                "Source table not found",
                table
            )),
        }
    }

    async fn current_ts(&self) -> SyncResult<SourceTs> {
        Ok(self.inner.lock().await.ts)
    }

    async fn plan_shards(
        &self,
        table: &TableName,
        columns: &[TableColumn],
        count: usize,
        snapshot_ts: Option<SourceTs>,
    ) -> SyncResult<Vec<Shard>> {
        self.simulate_query().await;
        let inner = self.inner.lock().await;
        let Some(memory_table) = inner.tables.get(table) else {
            bail!(ErrorKind::SourceQueryFailed, "Source table not found", table);
        };
        let visible: Vec<&TableRow> = memory_table
            .rows
            .iter()
            .filter(|versioned| versioned.visible_at(snapshot_ts))
            .map(|versioned| &versioned.row)
            .collect();
        if visible.is_empty() {
            return Ok(Vec::new());
        }

        let Some(key) = integer_key(columns) else {
            return hash_shards(columns, count);
        };
        let index = columns
            .iter()
            .position(|c| c.name == key.name)
            .unwrap_or_default();

        let mut bounds: Option<(i128, i128)> = None;
        for row in visible {
            let value = integer_value(row, index)?;
            bounds = Some(match bounds {
                Some((lower, upper)) => (lower.min(value), upper.max(value)),
                None => (value, value),
            });
        }

        Ok(bounds
            .map(|(lower, upper)| int_range_shards(&key.name, lower, upper, count))
            .unwrap_or_default())
    }

    async fn read_shard(
        &self,
        table: &TableName,
        columns: &[TableColumn],
        shard: &Shard,
        snapshot_ts: Option<SourceTs>,
    ) -> SyncResult<Vec<TableRow>> {
        self.simulate_query().await;
        let mut inner = self.inner.lock().await;
        inner.shard_reads += 1;

        let Some(memory_table) = inner.tables.get(table) else {
            bail!(ErrorKind::SourceQueryFailed, "Source table not found", table);
        };

        let mut rows = Vec::new();
        for versioned in &memory_table.rows {
            if !versioned.visible_at(snapshot_ts) {
                continue;
            }
            if matches(columns, &shard.predicate, &versioned.row)? {
                rows.push(versioned.row.clone());
            }
        }

        info!(%table, shard = shard.index, rows = rows.len(), "read memory shard");

        Ok(rows)
    }
}

fn integer_value(row: &TableRow, index: usize) -> SyncResult<i128> {
    match row.values().get(index) {
        Some(Some(value)) => Ok(value.parse()?),
        _ => bail!(
            ErrorKind::InvalidData,
            "Integer key value is missing",
            format!("column #{index}")
        ),
    }
}

fn matches(columns: &[TableColumn], predicate: &ShardPredicate, row: &TableRow) -> SyncResult<bool> {
    match predicate {
        ShardPredicate::Full => Ok(true),
        ShardPredicate::IntRange {
            column,
            lower,
            upper,
        } => {
            let index = columns
                .iter()
                .position(|c| &c.name == column)
                .ok_or_else(|| {
                    sync_error!(ErrorKind::InvalidState, "Shard column not found", column)
                })?;
            let value = integer_value(row, index)?;
            Ok(*lower <= value && value <= *upper)
        }
        ShardPredicate::Hash {
            modulus, remainder, ..
        } => {
            let definition = TableDefinition::new(TableName::new("", ""), 0, columns.to_vec());
            let key = key_of(row, &key_indices(&definition)?)?;
            let hash = crc32fast::hash(key.join(",").as_bytes());
            Ok(hash % modulus == *remainder)
        }
    }
}
