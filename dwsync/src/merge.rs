//! Primary-key merge of change batches.
//!
//! Within a batch only the last change of each key survives: the one with the highest commit
//! timestamp. Changes of one key sharing a commit timestamp come from one transaction, an
//! update split into a delete and an insert, so on ties `U` beats `I` which beats `D`; only
//! then does the later one in file order win. A surviving delete removes the key, any other
//! surviving change replaces the row. The outcome depends only on the target rows, the
//! batch and the primary key, so applying a batch twice leaves the target unchanged.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::types::{CommitTs, TableDefinition, TableRow};

/// Kind of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn parse(value: &str) -> SyncResult<Self> {
        match value {
            "I" => Ok(ChangeOp::Insert),
            "U" => Ok(ChangeOp::Update),
            "D" => Ok(ChangeOp::Delete),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown change operation",
                format!("`{other}`, expected one of I, U, D")
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "I",
            ChangeOp::Update => "U",
            ChangeOp::Delete => "D",
        }
    }

    /// Precedence between changes of one key at the same commit timestamp, higher wins.
    ///
    /// The SQL connectors render the same order with [`OP_PRECEDENCE_CASES`].
    pub fn precedence(&self) -> u8 {
        match self {
            ChangeOp::Delete => 0,
            ChangeOp::Insert => 1,
            ChangeOp::Update => 2,
        }
    }
}

/// `(op, precedence)` pairs of [`ChangeOp::precedence`], for rendering a `CASE` expression.
pub const OP_PRECEDENCE_CASES: [(&str, u8); 3] = [("D", 0), ("I", 1), ("U", 2)];

/// `case <op_column> when 'D' then 0 ... end`, ranking staged changes like
/// [`ChangeOp::precedence`].
pub fn op_precedence_sql(op_column: &str) -> String {
    let cases = OP_PRECEDENCE_CASES
        .iter()
        .map(|(op, precedence)| format!("when '{op}' then {precedence}"))
        .collect::<Vec<_>>()
        .join(" ");

    format!("case {op_column} {cases} end")
}

/// One record of a change batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    pub op: ChangeOp,
    pub commit_ts: CommitTs,
    /// Full row image in table column order. Deletes carry the deleted row.
    pub row: TableRow,
}

/// Effect of a batch on a single primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    Upsert(TableRow),
    Delete(TableRow),
}

impl MergeAction {
    pub fn row(&self) -> &TableRow {
        match self {
            MergeAction::Upsert(row) | MergeAction::Delete(row) => row,
        }
    }
}

/// Positions of the primary key columns of `definition`.
///
/// A table without primary key cannot be merged and is rejected with [`ErrorKind::SchemaError`].
pub fn key_indices(definition: &TableDefinition) -> SyncResult<Vec<usize>> {
    let indices: Vec<usize> = definition
        .columns
        .iter()
        .enumerate()
        .filter(|(_, column)| column.primary_key)
        .map(|(index, _)| index)
        .collect();

    if indices.is_empty() {
        bail!(
            ErrorKind::SchemaError,
            "Table has no primary key to merge changes on",
            definition.table
        );
    }

    Ok(indices)
}

/// Primary key values of `row`. A key value can never be `NULL`.
pub fn key_of(row: &TableRow, indices: &[usize]) -> SyncResult<Vec<String>> {
    let mut key = Vec::with_capacity(indices.len());
    for &index in indices {
        match row.values().get(index) {
            Some(Some(value)) => key.push(value.clone()),
            Some(None) => bail!(
                ErrorKind::InvalidData,
                "Primary key value is NULL",
                format!("column #{index}")
            ),
            None => bail!(
                ErrorKind::InvalidData,
                "Row is shorter than its primary key",
                format!("{} values, key column #{index}", row.len())
            ),
        }
    }

    Ok(key)
}

/// Reduces a batch to one action per primary key, ordered by the position of the surviving
/// change in the batch.
pub fn plan(definition: &TableDefinition, changes: &[ChangeRow]) -> SyncResult<Vec<MergeAction>> {
    let indices = key_indices(definition)?;

    // key -> position of the surviving change
    let mut survivors: HashMap<Vec<String>, usize> = HashMap::with_capacity(changes.len());
    for (position, change) in changes.iter().enumerate() {
        let key = key_of(&change.row, &indices)?;
        match survivors.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(position);
            }
            Entry::Occupied(mut entry) => {
                let survivor = &changes[*entry.get()];
                if (change.commit_ts, change.op.precedence())
                    >= (survivor.commit_ts, survivor.op.precedence())
                {
                    entry.insert(position);
                }
            }
        }
    }

    let mut positions: Vec<usize> = survivors.into_values().collect();
    positions.sort_unstable();

    Ok(positions
        .into_iter()
        .map(|position| {
            let change = &changes[position];
            match change.op {
                ChangeOp::Delete => MergeAction::Delete(change.row.clone()),
                ChangeOp::Insert | ChangeOp::Update => MergeAction::Upsert(change.row.clone()),
            }
        })
        .collect())
}
