//! Core data types shared by the replication components.

mod column;
mod row;
mod table;

pub use column::{ColumnType, TableColumn};
pub use row::TableRow;
pub use table::{TableDefinition, TableName};

/// Timestamp allocated by the source cluster's timestamp oracle.
///
/// Snapshots are read as of one and changefeeds start from one, which is what makes the
/// snapshot to incremental handoff lossless.
pub type SourceTs = u64;

/// Commit timestamp of a row change, as written by the CDC service.
pub type CommitTs = u64;
