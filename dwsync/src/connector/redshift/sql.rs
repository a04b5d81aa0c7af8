use pg_escape::{quote_identifier, quote_literal};
use secrecy::ExposeSecret;
use tracing::warn;

use crate::codec::{CHANGE_META_COLUMNS, NULL_MARKER};
use crate::error::{ErrorKind, SyncResult};
use crate::merge::OP_PRECEDENCE_CASES;
use crate::schema::SchemaChange;
use crate::storage::StorageCredentials;
use crate::types::{ColumnType, TableColumn, TableDefinition};
use crate::{bail, sync_error};

/// Longest `VARCHAR` Redshift accepts, in bytes.
const VARCHAR_MAX_BYTES: u32 = 65_535;
/// Bytes of one character in the worst case of UTF-8.
const UTF8_MAX_CHAR_BYTES: u32 = 4;
/// Largest precision of a `DECIMAL` column.
const DECIMAL_MAX_PRECISION: u8 = 38;

const ROW_NUMBER_COLUMN: &str = "_dwsync_row_number";

/// Authorization clause of a `COPY`.
#[derive(Debug, Clone)]
pub enum CopyAuthorization {
    IamRole(String),
    Credentials(StorageCredentials),
}

impl CopyAuthorization {
    /// Prefers the IAM role; static access keys are the only other option Redshift accepts.
    pub fn resolve(
        iam_role: Option<&str>,
        credentials: &StorageCredentials,
    ) -> SyncResult<CopyAuthorization> {
        if let Some(role) = iam_role.filter(|role| !role.is_empty()) {
            return Ok(CopyAuthorization::IamRole(role.to_string()));
        }

        match credentials {
            StorageCredentials::AccessKey { .. } => {
                Ok(CopyAuthorization::Credentials(credentials.clone()))
            }
            other => bail!(
                ErrorKind::ConfigError,
                "Redshift COPY needs an IAM role or static access keys",
                format!(
                    "no iam_role is configured and the storage credentials are {}",
                    other.kind()
                )
            ),
        }
    }

    fn render(&self) -> String {
        match self {
            CopyAuthorization::IamRole(role) => format!("IAM_ROLE {}", quote_literal(role)),
            CopyAuthorization::Credentials(StorageCredentials::AccessKey {
                access_key_id,
                secret_access_key,
                session_token,
            }) => {
                let mut value = format!(
                    "aws_access_key_id={};aws_secret_access_key={}",
                    access_key_id.expose_secret(),
                    secret_access_key.expose_secret()
                );
                if let Some(token) = session_token {
                    value.push_str(";token=");
                    value.push_str(token.expose_secret());
                }
                format!("CREDENTIALS {}", quote_literal(&value))
            }
            // Rejected by `resolve`.
            CopyAuthorization::Credentials(_) => String::new(),
        }
    }
}

/// Formats the table name as `schema.table`, quoting identifiers where needed.
pub fn full_table_name(schema: &str, table: &str) -> SyncResult<String> {
    if schema.is_empty() || table.is_empty() {
        bail!(
            ErrorKind::SchemaError,
            "Invalid Redshift table name",
            format!("schema `{schema}` and table `{table}` must not be empty")
        );
    }

    Ok(format!("{}.{}", quote_identifier(schema), quote_identifier(table)))
}

fn varchar(length: Option<u32>) -> String {
    let bytes = length
        .map(|chars| chars.saturating_mul(UTF8_MAX_CHAR_BYTES))
        .unwrap_or(VARCHAR_MAX_BYTES)
        .clamp(1, VARCHAR_MAX_BYTES);

    format!("VARCHAR({bytes})")
}

/// Maps a source column type to its Redshift type.
///
/// Binary values are staged base64 encoded, so they land in character columns.
pub fn redshift_type(column_type: &ColumnType) -> String {
    match *column_type {
        ColumnType::Boolean => "BOOLEAN".to_string(),
        ColumnType::TinyInt { .. } | ColumnType::SmallInt { unsigned: false } | ColumnType::Year => {
            "SMALLINT".to_string()
        }
        ColumnType::SmallInt { unsigned: true }
        | ColumnType::MediumInt { .. }
        | ColumnType::Int { unsigned: false } => "INTEGER".to_string(),
        ColumnType::Int { unsigned: true } | ColumnType::BigInt { unsigned: false } | ColumnType::Bit { .. } => {
            "BIGINT".to_string()
        }
        ColumnType::BigInt { unsigned: true } => "DECIMAL(20,0)".to_string(),
        ColumnType::Float => "REAL".to_string(),
        ColumnType::Double => "DOUBLE PRECISION".to_string(),
        ColumnType::Decimal { precision, scale } => {
            let precision = precision.clamp(1, DECIMAL_MAX_PRECISION);
            format!("DECIMAL({precision},{})", scale.min(precision))
        }
        ColumnType::Char { length } | ColumnType::Varchar { length } => varchar(length),
        ColumnType::Text
        | ColumnType::Json
        | ColumnType::Enum
        | ColumnType::Set
        | ColumnType::Binary { .. }
        | ColumnType::Varbinary { .. }
        | ColumnType::Blob => varchar(None),
        ColumnType::Date => "DATE".to_string(),
        ColumnType::Time => "TIME".to_string(),
        ColumnType::DateTime | ColumnType::Timestamp => "TIMESTAMP".to_string(),
    }
}

fn column_spec(column: &TableColumn) -> String {
    let mut spec = format!(
        "{} {}",
        quote_identifier(&column.name),
        redshift_type(&column.column_type)
    );
    if !column.nullable {
        spec.push_str(" NOT NULL");
    }

    spec
}

/// `CREATE TABLE` for the replicated table with its primary key.
pub fn create_table(full_table_name: &str, columns: &[TableColumn]) -> String {
    let mut specs: Vec<String> = columns.iter().map(column_spec).collect();

    let key: Vec<String> = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| quote_identifier(&c.name).to_string())
        .collect();
    if !key.is_empty() {
        specs.push(format!("PRIMARY KEY ({})", key.join(", ")));
    }

    format!("CREATE TABLE {full_table_name} ({})", specs.join(", "))
}

/// Staging table holding one change batch: the change metadata followed by the data columns,
/// all nullable.
pub fn create_staging_table(full_table_name: &str, definition: &TableDefinition) -> String {
    let mut specs = Vec::with_capacity(CHANGE_META_COLUMNS.len() + definition.columns.len());
    for (index, name) in CHANGE_META_COLUMNS.iter().enumerate() {
        let typ = if index == CHANGE_META_COLUMNS.len() - 1 {
            "BIGINT".to_string()
        } else {
            varchar(Some(256))
        };
        specs.push(format!("{} {typ}", quote_identifier(name)));
    }
    for column in &definition.columns {
        specs.push(format!(
            "{} {}",
            quote_identifier(&column.name),
            redshift_type(&column.column_type)
        ));
    }

    format!("CREATE TABLE {full_table_name} ({})", specs.join(", "))
}

pub fn drop_table(full_table_name: &str) -> String {
    format!("DROP TABLE IF EXISTS {full_table_name}")
}

/// Renders the statements applying `changes`.
///
/// Redshift only widens `VARCHAR` columns in place; any other type change is rejected.
/// Nullability of existing columns cannot be changed and is left as is.
pub fn alter_table(full_table_name: &str, changes: &[SchemaChange]) -> SyncResult<Vec<String>> {
    let mut statements = Vec::with_capacity(changes.len());
    for change in changes {
        match change {
            SchemaChange::AddColumn(column) => {
                if !column.nullable {
                    warn!(column = %column.name, "added column is created nullable in redshift");
                }
                statements.push(format!(
                    "ALTER TABLE {full_table_name} ADD COLUMN {} {}",
                    quote_identifier(&column.name),
                    redshift_type(&column.column_type)
                ));
            }
            SchemaChange::AlterColumn { previous, latest } => {
                let previous_type = redshift_type(&previous.column_type);
                let latest_type = redshift_type(&latest.column_type);
                if previous_type != latest_type {
                    if !(previous_type.starts_with("VARCHAR") && latest_type.starts_with("VARCHAR"))
                    {
                        return Err(sync_error!(
                            ErrorKind::SchemaError,
                            "Redshift cannot change the type of a column",
                            format!(
                                "column `{}` from {previous_type} to {latest_type}",
                                latest.name
                            )
                        ));
                    }
                    statements.push(format!(
                        "ALTER TABLE {full_table_name} ALTER COLUMN {} TYPE {latest_type}",
                        quote_identifier(&latest.name)
                    ));
                }
                if previous.nullable != latest.nullable {
                    warn!(column = %latest.name, "redshift cannot change the nullability of a column");
                }
            }
            SchemaChange::DropColumn(column) => {
                statements.push(format!(
                    "ALTER TABLE {full_table_name} DROP COLUMN {}",
                    quote_identifier(&column.name)
                ));
            }
        }
    }

    Ok(statements)
}

/// `COPY` of one staged CSV file. Carries secrets, must not be logged.
pub fn copy_from(full_table_name: &str, uri: &str, authorization: &CopyAuthorization) -> String {
    // Redshift string literals treat the backslash as an escape character.
    let null_marker = NULL_MARKER.replace('\\', "\\\\");
    format!(
        "COPY {full_table_name} FROM {} {} FORMAT AS CSV NULL AS '{null_marker}'",
        quote_literal(uri),
        authorization.render(),
    )
}

/// Statements merging a staged batch into the target table, to run in one transaction.
///
/// Every key present in the batch is deleted first; the latest change per key is then
/// inserted unless it is a delete. Changes at the same commit timestamp are ranked by op.
pub fn merge(
    target_table_name: &str,
    staging_table_name: &str,
    definition: &TableDefinition,
) -> SyncResult<Vec<String>> {
    let key: Vec<String> = definition
        .primary_key()
        .into_iter()
        .map(|c| quote_identifier(&c.name).to_string())
        .collect();
    if key.is_empty() {
        bail!(
            ErrorKind::SchemaError,
            "Table has no primary key to merge changes on",
            definition.table
        );
    }

    let columns = definition
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name).to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let op = quote_identifier(CHANGE_META_COLUMNS[0]);
    let commit_ts = quote_identifier(CHANGE_META_COLUMNS[3]);

    let on = key
        .iter()
        .map(|k| format!("{target_table_name}.{k} = s.{k}"))
        .collect::<Vec<_>>()
        .join(" AND ");

    let precedence = OP_PRECEDENCE_CASES
        .iter()
        .map(|(value, rank)| format!("WHEN '{value}' THEN {rank}"))
        .collect::<Vec<_>>()
        .join(" ");

    let delete = format!("DELETE FROM {target_table_name} USING {staging_table_name} s WHERE {on}");
    let insert = format!(
        "INSERT INTO {target_table_name} ({columns}) SELECT {columns} FROM (\
SELECT *, ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {commit_ts} DESC, CASE {op} {precedence} END DESC) AS {ROW_NUMBER_COLUMN} \
FROM {staging_table_name}) WHERE {ROW_NUMBER_COLUMN} = 1 AND {op} <> 'D'",
        key.join(", ")
    );

    Ok(vec![delete, insert])
}
