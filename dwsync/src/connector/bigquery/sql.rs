use tracing::warn;

use crate::codec::{CHANGE_META_COLUMNS, NULL_MARKER};
use crate::error::{ErrorKind, SyncResult};
use crate::merge::op_precedence_sql;
use crate::schema::SchemaChange;
use crate::sync_error;
use crate::types::{ColumnType, TableColumn, TableDefinition};

/// Largest precision of a `NUMERIC` column.
const NUMERIC_MAX_PRECISION: u8 = 38;
/// Largest scale of a `NUMERIC` column.
const NUMERIC_MAX_SCALE: u8 = 9;

/// Column of the deduplication window added to staged changes.
const ROW_NUMBER_COLUMN: &str = "_dwsync_row_number";

/// Sanitizes a BigQuery identifier for safe backtick quoting.
///
/// Rejects empty identifiers and identifiers containing control characters. Backticks and
/// backslashes are escaped with a backslash per GoogleSQL lexical rules.
pub fn sanitize_identifier(identifier: &str, context: &str) -> SyncResult<String> {
    if identifier.is_empty() {
        return Err(sync_error!(
            ErrorKind::SchemaError,
            "Invalid BigQuery identifier",
            format!("{context} cannot be empty")
        ));
    }

    if identifier.chars().any(char::is_control) {
        return Err(sync_error!(
            ErrorKind::SchemaError,
            "Invalid BigQuery identifier",
            format!("{context} contains control characters")
        ));
    }

    let mut escaped = String::with_capacity(identifier.len());
    for ch in identifier.chars() {
        match ch {
            '`' => escaped.push_str("\\`"),
            '\\' => escaped.push_str("\\\\"),
            _ => escaped.push(ch),
        }
    }

    Ok(escaped)
}

fn quote_column(name: &str) -> SyncResult<String> {
    Ok(format!("`{}`", sanitize_identifier(name, "BigQuery column name")?))
}

/// Quotes a GoogleSQL string literal.
pub fn string_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => quoted.push_str("\\'"),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');

    quoted
}

/// Formats the table name as `` `project.dataset.table` ``.
pub fn full_table_name(project_id: &str, dataset_id: &str, table_id: &str) -> SyncResult<String> {
    let project_id = sanitize_identifier(project_id, "BigQuery project id")?;
    let dataset_id = sanitize_identifier(dataset_id, "BigQuery dataset id")?;
    let table_id = sanitize_identifier(table_id, "BigQuery table id")?;

    Ok(format!("`{project_id}.{dataset_id}.{table_id}`"))
}

/// Maps a source column type to its BigQuery type.
pub fn bigquery_type(column_type: &ColumnType) -> String {
    match *column_type {
        ColumnType::Boolean => "bool".to_string(),
        ColumnType::TinyInt { .. }
        | ColumnType::SmallInt { .. }
        | ColumnType::MediumInt { .. }
        | ColumnType::Int { .. }
        | ColumnType::BigInt { unsigned: false }
        | ColumnType::Year
        | ColumnType::Bit { .. } => "int64".to_string(),
        // Unsigned 64 bit values overflow INT64.
        ColumnType::BigInt { unsigned: true } => "numeric".to_string(),
        ColumnType::Float | ColumnType::Double => "float64".to_string(),
        ColumnType::Decimal { precision, scale } => {
            if precision <= NUMERIC_MAX_PRECISION
                && scale <= NUMERIC_MAX_SCALE
                && precision - scale.min(precision) <= NUMERIC_MAX_PRECISION - NUMERIC_MAX_SCALE
            {
                format!("numeric({precision}, {scale})")
            } else {
                format!("bignumeric({precision}, {scale})")
            }
        }
        ColumnType::Char { .. }
        | ColumnType::Varchar { .. }
        | ColumnType::Text
        | ColumnType::Enum
        | ColumnType::Set => "string".to_string(),
        ColumnType::Binary { .. } | ColumnType::Varbinary { .. } | ColumnType::Blob => {
            "bytes".to_string()
        }
        ColumnType::Date => "date".to_string(),
        ColumnType::Time => "time".to_string(),
        ColumnType::DateTime => "datetime".to_string(),
        ColumnType::Timestamp => "timestamp".to_string(),
        ColumnType::Json => "json".to_string(),
    }
}

fn column_spec(column: &TableColumn) -> SyncResult<String> {
    let mut spec = format!(
        "{} {}",
        quote_column(&column.name)?,
        bigquery_type(&column.column_type)
    );
    if !column.nullable {
        spec.push_str(" not null");
    }

    Ok(spec)
}

fn primary_key_clause(columns: &[TableColumn]) -> SyncResult<String> {
    let key = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| quote_column(&c.name))
        .collect::<SyncResult<Vec<_>>>()?;

    if key.is_empty() {
        return Ok(String::new());
    }

    Ok(format!(", primary key ({}) not enforced", key.join(",")))
}

/// `create or replace table` for the replicated table, keeping its primary key as an
/// unenforced constraint.
pub fn create_table(full_table_name: &str, columns: &[TableColumn]) -> SyncResult<String> {
    let columns_spec = columns
        .iter()
        .map(column_spec)
        .collect::<SyncResult<Vec<_>>>()?
        .join(",");

    Ok(format!(
        "create or replace table {full_table_name} ({columns_spec}{})",
        primary_key_clause(columns)?
    ))
}

/// Staging table holding one change batch: the change metadata followed by the data columns,
/// all nullable.
pub fn create_staging_table(
    full_table_name: &str,
    definition: &TableDefinition,
) -> SyncResult<String> {
    let mut specs = Vec::with_capacity(CHANGE_META_COLUMNS.len() + definition.columns.len());
    for (index, name) in CHANGE_META_COLUMNS.iter().enumerate() {
        let typ = if index == CHANGE_META_COLUMNS.len() - 1 {
            "int64"
        } else {
            "string"
        };
        specs.push(format!("{} {typ}", quote_column(name)?));
    }
    for column in &definition.columns {
        specs.push(format!(
            "{} {}",
            quote_column(&column.name)?,
            bigquery_type(&column.column_type)
        ));
    }

    Ok(format!(
        "create or replace table {full_table_name} ({})",
        specs.join(",")
    ))
}

pub fn drop_table(full_table_name: &str) -> String {
    format!("drop table if exists {full_table_name}")
}

/// Renders the statements applying `changes`.
///
/// BigQuery only adds nullable columns and cannot make a column required again, so such
/// parts of a change are skipped.
pub fn alter_table(full_table_name: &str, changes: &[SchemaChange]) -> SyncResult<Vec<String>> {
    let mut statements = Vec::with_capacity(changes.len());
    for change in changes {
        match change {
            SchemaChange::AddColumn(column) => {
                if !column.nullable {
                    warn!(column = %column.name, "added column is created nullable in bigquery");
                }
                statements.push(format!(
                    "alter table {full_table_name} add column {} {}",
                    quote_column(&column.name)?,
                    bigquery_type(&column.column_type)
                ));
            }
            SchemaChange::AlterColumn { previous, latest } => {
                let name = quote_column(&latest.name)?;
                let previous_type = bigquery_type(&previous.column_type);
                let latest_type = bigquery_type(&latest.column_type);
                if previous_type != latest_type {
                    statements.push(format!(
                        "alter table {full_table_name} alter column {name} set data type {latest_type}"
                    ));
                }
                if !previous.nullable && latest.nullable {
                    statements.push(format!(
                        "alter table {full_table_name} alter column {name} drop not null"
                    ));
                } else if previous.nullable && !latest.nullable {
                    warn!(column = %latest.name, "bigquery cannot make an existing column required");
                }
            }
            SchemaChange::DropColumn(column) => {
                statements.push(format!(
                    "alter table {full_table_name} drop column {}",
                    quote_column(&column.name)?
                ));
            }
        }
    }

    Ok(statements)
}

/// Appends the CSV files at `uris` to the table.
pub fn load_data(full_table_name: &str, uris: &[String]) -> String {
    let uris = uris
        .iter()
        .map(|uri| string_literal(uri))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "load data into {full_table_name} from files (format = 'CSV', uris = [{uris}], null_marker = {}, allow_quoted_newlines = true)",
        string_literal(NULL_MARKER)
    )
}

pub fn count_rows(full_table_name: &str) -> String {
    format!("select count(*) from {full_table_name}")
}

/// Merges a staged batch into the target table.
///
/// Only the latest change per primary key is used; a latest delete removes the row and any
/// other change replaces or inserts it.
pub fn merge(
    target_table_name: &str,
    staging_table_name: &str,
    definition: &TableDefinition,
) -> SyncResult<String> {
    let key = definition
        .primary_key()
        .into_iter()
        .map(|c| quote_column(&c.name))
        .collect::<SyncResult<Vec<_>>>()?;
    if key.is_empty() {
        return Err(sync_error!(
            ErrorKind::SchemaError,
            "Table has no primary key to merge changes on",
            definition.table
        ));
    }

    let columns = definition
        .columns
        .iter()
        .map(|c| quote_column(&c.name))
        .collect::<SyncResult<Vec<_>>>()?;
    let values = definition
        .columns
        .iter()
        .filter(|c| !c.primary_key)
        .map(|c| quote_column(&c.name))
        .collect::<SyncResult<Vec<_>>>()?;

    let op = quote_column(CHANGE_META_COLUMNS[0])?;
    let commit_ts = quote_column(CHANGE_META_COLUMNS[3])?;

    let on = key
        .iter()
        .map(|k| format!("t.{k} = s.{k}"))
        .collect::<Vec<_>>()
        .join(" and ");

    let mut sql = format!(
        "merge {target_table_name} as t using (\
select * except ({ROW_NUMBER_COLUMN}) from (\
select *, row_number() over (partition by {} order by {commit_ts} desc, {} desc) as {ROW_NUMBER_COLUMN} \
from {staging_table_name}) where {ROW_NUMBER_COLUMN} = 1) as s on {on} \
when matched and s.{op} = 'D' then delete ",
        key.join(", "),
        op_precedence_sql(&op)
    );

    if !values.is_empty() {
        let assignments = values
            .iter()
            .map(|c| format!("{c} = s.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!("when matched then update set {assignments} "));
    }

    let inserted = columns
        .iter()
        .map(|c| format!("s.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&format!(
        "when not matched and s.{op} != 'D' then insert ({}) values ({inserted})",
        columns.join(", ")
    ));

    Ok(sql)
}
