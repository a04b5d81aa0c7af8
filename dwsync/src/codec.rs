//! CSV encoding of staged files.
//!
//! Snapshot shards hold the data columns of a table. Change batches written by the CDC service
//! prefix them with [`CHANGE_META_COLUMNS`]. Both use [`NULL_MARKER`] for SQL `NULL`.

use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::bail;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::merge::{ChangeOp, ChangeRow};
use crate::types::{TableDefinition, TableRow};

/// Text standing for SQL `NULL` in staged files.
pub const NULL_MARKER: &str = "\\N";

/// Leading columns of every change batch record in file order: operation, table, database and
/// commit timestamp. Staging tables use these names for them.
pub const CHANGE_META_COLUMNS: [&str; 4] = [
    "_dwsync_op",
    "_dwsync_table",
    "_dwsync_schema",
    "_dwsync_commit_ts",
];

/// Encodes rows as CSV without a header.
pub fn encode_rows<'a, I>(rows: I) -> SyncResult<Vec<u8>>
where
    I: IntoIterator<Item = &'a TableRow>,
{
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    for row in rows {
        writer.write_record(
            row.values()
                .iter()
                .map(|value| value.as_deref().unwrap_or(NULL_MARKER)),
        )?;
    }

    writer.into_inner().map_err(|err| err.into_error().into())
}

/// Decodes header-less CSV rows, each expected to hold `width` values.
pub fn decode_rows(data: &[u8], width: usize) -> SyncResult<Vec<TableRow>> {
    let mut rows = Vec::new();
    for record in records(data) {
        let record = record?;
        check_width(&record, width)?;
        rows.push(record.iter().map(parse_value).collect());
    }

    Ok(rows)
}

/// Decodes a change batch of the table described by `definition`.
///
/// Records of other tables are rejected, as is any record whose width does not match the
/// definition; a batch is always written against a single table version.
pub fn decode_changes(definition: &TableDefinition, data: &[u8]) -> SyncResult<Vec<ChangeRow>> {
    let width = CHANGE_META_COLUMNS.len() + definition.columns.len();

    let mut changes = Vec::new();
    for record in records(data) {
        let record = record?;
        check_width(&record, width)?;

        let op = ChangeOp::parse(&record[0])?;
        if record[1] != definition.table.name || record[2] != definition.table.database {
            bail!(
                ErrorKind::InvalidData,
                "Change record belongs to another table",
                format!(
                    "expected {} but found {}.{}{}",
                    definition.table,
                    &record[2],
                    &record[1],
                    line_suffix(&record)
                )
            );
        }
        let commit_ts = record[3].parse::<u64>().map_err(|err| {
            SyncError::from(err)
                .context(format!("commit_ts `{}`{}", &record[3], line_suffix(&record)))
        })?;

        let row = record
            .iter()
            .skip(CHANGE_META_COLUMNS.len())
            .map(parse_value)
            .collect();

        changes.push(ChangeRow { op, commit_ts, row });
    }

    Ok(changes)
}

fn records(data: &[u8]) -> csv::StringRecordsIntoIter<&[u8]> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data)
        .into_records()
}

fn check_width(record: &StringRecord, width: usize) -> SyncResult<()> {
    if record.len() != width {
        bail!(
            ErrorKind::InvalidData,
            "Staged record has an unexpected number of values",
            format!(
                "expected {width} but found {}{}",
                record.len(),
                line_suffix(record)
            )
        );
    }

    Ok(())
}

fn line_suffix(record: &StringRecord) -> String {
    record
        .position()
        .map(|position| format!(" at line {}", position.line()))
        .unwrap_or_default()
}

fn parse_value(value: &str) -> Option<&str> {
    (value != NULL_MARKER).then_some(value)
}
