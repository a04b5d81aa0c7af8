//! Access to the source database.
//!
//! A [`Source`] introspects tables, reports the current cluster timestamp and reads the rows of
//! a table in independent shards, optionally as of a past timestamp.

use std::future::Future;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::types::{SourceTs, TableColumn, TableName, TableRow};

#[cfg(any(test, feature = "test-utils"))]
mod memory;
mod tidb;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemorySource;
pub use tidb::TiDbSource;

/// Row filter selecting one shard of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPredicate {
    /// Every row.
    Full,
    /// Rows whose integer key lies in `lower..=upper`.
    IntRange {
        column: String,
        lower: i128,
        upper: i128,
    },
    /// Rows whose key hashes, with CRC32 over the comma separated key values, to `remainder`.
    Hash {
        columns: Vec<String>,
        modulus: u32,
        remainder: u32,
    },
}

/// A disjoint part of a table read by one snapshot worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub predicate: ShardPredicate,
}

impl Shard {
    /// Name of the snapshot file holding this shard, `<db>.<table>.<index>.csv`.
    pub fn file_name(&self, table: &TableName) -> String {
        format!("{}{:06}.csv", table.snapshot_file_prefix(), self.index)
    }
}

/// Source database operations needed by the replication.
pub trait Source: Send + Sync {
    /// Columns of `table` in ordinal order, with primary key membership.
    ///
    /// An unknown table or one that cannot be introspected fails with
    /// [`ErrorKind::SchemaIntrospectionError`].
    fn table_columns(
        &self,
        table: &TableName,
    ) -> impl Future<Output = SyncResult<Vec<TableColumn>>> + Send;

    /// Current timestamp of the cluster's timestamp oracle.
    fn current_ts(&self) -> impl Future<Output = SyncResult<SourceTs>> + Send;

    /// Splits `table` into at most `count` disjoint shards covering every row as of
    /// `snapshot_ts`, or of the latest data when `None`.
    ///
    /// An empty table yields no shards.
    fn plan_shards(
        &self,
        table: &TableName,
        columns: &[TableColumn],
        count: usize,
        snapshot_ts: Option<SourceTs>,
    ) -> impl Future<Output = SyncResult<Vec<Shard>>> + Send;

    /// Reads the rows of one shard as of `snapshot_ts`, or the latest data when `None`.
    fn read_shard(
        &self,
        table: &TableName,
        columns: &[TableColumn],
        shard: &Shard,
        snapshot_ts: Option<SourceTs>,
    ) -> impl Future<Output = SyncResult<Vec<TableRow>>> + Send;
}

/// The single integer primary key column, if the key is exactly one integer column.
pub fn integer_key(columns: &[TableColumn]) -> Option<&TableColumn> {
    let mut keys = columns.iter().filter(|c| c.primary_key);
    match (keys.next(), keys.next()) {
        (Some(key), None) if key.column_type.is_integer() => Some(key),
        _ => None,
    }
}

/// Splits the inclusive range `min..=max` into at most `count` contiguous shards.
pub fn int_range_shards(column: &str, min: i128, max: i128, count: usize) -> Vec<Shard> {
    if min > max {
        return Vec::new();
    }

    let count = count.max(1) as i128;
    let span = max - min + 1;
    let step = (span + count - 1) / count;

    let mut shards = Vec::new();
    let mut lower = min;
    while lower <= max {
        let upper = lower.saturating_add(step - 1).min(max);
        shards.push(Shard {
            index: shards.len(),
            predicate: ShardPredicate::IntRange {
                column: column.to_string(),
                lower,
                upper,
            },
        });
        if upper == max {
            break;
        }
        lower = upper + 1;
    }

    shards
}

/// Splits a table on the CRC32 of its key into `count` shards.
///
/// A table without a key, or a single shard, is read whole.
pub fn hash_shards(columns: &[TableColumn], count: usize) -> SyncResult<Vec<Shard>> {
    let key: Vec<String> = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.clone())
        .collect();

    if key.is_empty() || count <= 1 {
        return Ok(vec![Shard {
            index: 0,
            predicate: ShardPredicate::Full,
        }]);
    }

    let Ok(modulus) = u32::try_from(count) else {
        bail!(
            ErrorKind::ConfigError,
            "Too many snapshot shards requested",
            count
        );
    };

    Ok((0..modulus)
        .map(|remainder| Shard {
            index: remainder as usize,
            predicate: ShardPredicate::Hash {
                columns: key.clone(),
                modulus,
                remainder,
            },
        })
        .collect())
}
