use chrono::DateTime;
use dwsync_config::shared::{IntoConnectOptions, TiDbConnectionConfig};
use sqlx::mysql::{MySqlConnection, MySqlPoolOptions, MySqlRow};
use sqlx::{Executor, MySqlPool, Row};
use tracing::{debug, info};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::source::{
    Shard, ShardPredicate, Source, hash_shards, int_range_shards, integer_key,
};
use crate::types::{ColumnType, SourceTs, TableColumn, TableName, TableRow};
use crate::{bail, sync_error};

/// Number of low bits of a TSO holding the logical counter.
const TSO_LOGICAL_BITS: u32 = 18;

/// TiDB source reached over the MySQL protocol.
///
/// Every shard read checks out its own pooled connection, so shards can be read concurrently.
#[derive(Debug, Clone)]
pub struct TiDbSource {
    pool: MySqlPool,
}

impl TiDbSource {
    pub async fn connect(config: &TiDbConnectionConfig) -> SyncResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(config.without_db())
            .await
            .map_err(|err| {
                SyncError::from(err).context(format!("connect to {}:{}", config.host, config.port))
            })?;

        info!(host = %config.host, port = config.port, "connected to source database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl Source for TiDbSource {
    async fn table_columns(&self, table: &TableName) -> SyncResult<Vec<TableColumn>> {
        let query = r#"
            SELECT
                column_name AS column_name,
                column_type AS column_type,
                is_nullable AS is_nullable,
                column_key AS column_key
            FROM information_schema.columns
            WHERE table_schema = ?
            AND table_name = ?
            ORDER BY ordinal_position
        "#;

        let rows = sqlx::query(query)
            .bind(&table.database)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| introspection_error(table, err))?;

        if rows.is_empty() {
            bail!(
                ErrorKind::SchemaIntrospectionError,
                "Source table not found",
                table
            );
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("column_name")
                .map_err(|err| introspection_error(table, err))?;
            let column_type: String = row
                .try_get("column_type")
                .map_err(|err| introspection_error(table, err))?;
            let is_nullable: String = row
                .try_get("is_nullable")
                .map_err(|err| introspection_error(table, err))?;
            let column_key: String = row
                .try_get("column_key")
                .map_err(|err| introspection_error(table, err))?;

            let column_type = ColumnType::parse(&column_type, None, None).map_err(|err| {
                err.context(format!("column `{name}` of {table}"))
            })?;
            let column = TableColumn::new(name, column_type, is_nullable == "YES");
            columns.push(if column_key == "PRI" {
                column.primary()
            } else {
                column
            });
        }

        debug!(%table, columns = columns.len(), "introspected source table");

        Ok(columns)
    }

    async fn current_ts(&self) -> SyncResult<SourceTs> {
        let row = sqlx::query("SHOW MASTER STATUS")
            .fetch_one(&self.pool)
            .await?;
        let ts = decode_position(&row)?;

        match DateTime::from_timestamp_millis((ts >> TSO_LOGICAL_BITS) as i64) {
            Some(physical) => info!(ts, %physical, "read source timestamp"),
            None => info!(ts, "read source timestamp"),
        }

        Ok(ts)
    }

    async fn plan_shards(
        &self,
        table: &TableName,
        columns: &[TableColumn],
        count: usize,
        snapshot_ts: Option<SourceTs>,
    ) -> SyncResult<Vec<Shard>> {
        let mut connection = self.pool.acquire().await?;

        // Bounds must come from the same version of the table the shards are read from.
        set_snapshot(&mut connection, snapshot_ts).await?;
        let planned = plan_on(&mut connection, table, columns, count).await;
        reset_snapshot(&mut connection, snapshot_ts).await?;

        planned.map_err(|err| err.context(format!("plan shards of {table}")))
    }

    async fn read_shard(
        &self,
        table: &TableName,
        columns: &[TableColumn],
        shard: &Shard,
        snapshot_ts: Option<SourceTs>,
    ) -> SyncResult<Vec<TableRow>> {
        let mut connection = self.pool.acquire().await?;

        set_snapshot(&mut connection, snapshot_ts).await?;
        let query = select_shard_query(table, columns, shard);
        let result = sqlx::query(&query).fetch_all(&mut *connection).await;
        reset_snapshot(&mut connection, snapshot_ts).await?;

        let rows = result.map_err(|err| {
            SyncError::from(err).context(format!("read shard {} of {table}", shard.index))
        })?;

        rows.iter()
            .map(|row| decode_row(row, columns.len()))
            .collect()
    }
}

async fn set_snapshot(
    connection: &mut MySqlConnection,
    snapshot_ts: Option<SourceTs>,
) -> SyncResult<()> {
    if let Some(ts) = snapshot_ts {
        let statement = format!("SET @@tidb_snapshot = '{ts}'");
        (&mut *connection).execute(statement.as_str()).await?;
    }

    Ok(())
}

/// Pooled connections must not keep reading historical data.
async fn reset_snapshot(
    connection: &mut MySqlConnection,
    snapshot_ts: Option<SourceTs>,
) -> SyncResult<()> {
    if snapshot_ts.is_some() {
        (&mut *connection)
            .execute("SET @@tidb_snapshot = ''")
            .await?;
    }

    Ok(())
}

/// Integer key ranges from the key bounds, or hash shards when the key is not a single integer.
async fn plan_on(
    connection: &mut MySqlConnection,
    table: &TableName,
    columns: &[TableColumn],
    count: usize,
) -> SyncResult<Vec<Shard>> {
    if let Some(key) = integer_key(columns) {
        let name = quote_identifier(&key.name);
        let query = format!(
            "SELECT CAST(MIN({name}) AS CHAR) AS lower_bound, CAST(MAX({name}) AS CHAR) AS upper_bound FROM {}",
            quote_table(table)
        );
        let row = sqlx::query(&query).fetch_one(&mut *connection).await?;
        let lower: Option<String> = row.try_get("lower_bound")?;
        let upper: Option<String> = row.try_get("upper_bound")?;

        return match (lower, upper) {
            (Some(lower), Some(upper)) => Ok(int_range_shards(
                &key.name,
                parse_bound(&lower)?,
                parse_bound(&upper)?,
                count,
            )),
            _ => Ok(Vec::new()),
        };
    }

    let query = format!("SELECT 1 FROM {} LIMIT 1", quote_table(table));
    if sqlx::query(&query)
        .fetch_optional(&mut *connection)
        .await?
        .is_none()
    {
        return Ok(Vec::new());
    }

    hash_shards(columns, count)
}

fn introspection_error(table: &TableName, err: sqlx::Error) -> SyncError {
    sync_error!(
        ErrorKind::SchemaIntrospectionError,
        "Source table could not be introspected",
        format!("{table}: {err}"),
        source: err
    )
}

fn decode_position(row: &MySqlRow) -> SyncResult<SourceTs> {
    if let Ok(position) = row.try_get::<u64, _>("Position") {
        return Ok(position);
    }
    if let Ok(position) = row.try_get::<i64, _>("Position") {
        return Ok(position as u64);
    }
    let position: String = row.try_get("Position")?;

    Ok(position.trim().parse()?)
}

fn decode_row(row: &MySqlRow, width: usize) -> SyncResult<TableRow> {
    let mut values = Vec::with_capacity(width);
    for index in 0..width {
        values.push(row.try_get::<Option<String>, _>(index)?);
    }

    Ok(TableRow::new(values))
}

fn parse_bound(value: &str) -> SyncResult<i128> {
    Ok(value.trim().parse::<i128>()?)
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub(crate) fn quote_table(table: &TableName) -> String {
    format!(
        "{}.{}",
        quote_identifier(&table.database),
        quote_identifier(&table.name)
    )
}

/// Renders a column so it is read back as text in the form warehouses load from CSV.
fn select_expression(column: &TableColumn) -> String {
    let name = quote_identifier(&column.name);
    match column.column_type {
        ColumnType::Binary { .. } | ColumnType::Varbinary { .. } | ColumnType::Blob => {
            format!("TO_BASE64({name})")
        }
        ColumnType::Bit { .. } => format!("CAST({name} + 0 AS CHAR)"),
        _ => format!("CAST({name} AS CHAR)"),
    }
}

fn shard_condition(predicate: &ShardPredicate) -> Option<String> {
    match predicate {
        ShardPredicate::Full => None,
        ShardPredicate::IntRange {
            column,
            lower,
            upper,
        } => Some(format!(
            "{} BETWEEN {lower} AND {upper}",
            quote_identifier(column)
        )),
        ShardPredicate::Hash {
            columns,
            modulus,
            remainder,
        } => {
            let key = columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!("CRC32(CONCAT_WS(',', {key})) % {modulus} = {remainder}"))
        }
    }
}

fn select_shard_query(table: &TableName, columns: &[TableColumn], shard: &Shard) -> String {
    let projection = columns
        .iter()
        .map(select_expression)
        .collect::<Vec<_>>()
        .join(", ");

    match shard_condition(&shard.predicate) {
        Some(condition) => format!(
            "SELECT {projection} FROM {} WHERE {condition}",
            quote_table(table)
        ),
        None => format!("SELECT {projection} FROM {}", quote_table(table)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<TableColumn> {
        vec![
            TableColumn::new("id", ColumnType::Int { unsigned: false }, false).primary(),
            TableColumn::new("payload", ColumnType::Blob, true),
            TableColumn::new("flags", ColumnType::Bit { length: Some(8) }, true),
        ]
    }

    #[test]
    fn shard_query_casts_columns_to_text() {
        let shard = Shard {
            index: 0,
            predicate: ShardPredicate::IntRange {
                column: "id".to_string(),
                lower: 1,
                upper: 50,
            },
        };

        assert_eq!(
            select_shard_query(&TableName::new("db1", "orders"), &columns(), &shard),
            "SELECT CAST(`id` AS CHAR), TO_BASE64(`payload`), CAST(`flags` + 0 AS CHAR) \
             FROM `db1`.`orders` WHERE `id` BETWEEN 1 AND 50"
        );
    }

    #[test]
    fn hash_shards_use_crc32_of_the_key() {
        let shard = Shard {
            index: 2,
            predicate: ShardPredicate::Hash {
                columns: vec!["region".to_string(), "code".to_string()],
                modulus: 4,
                remainder: 2,
            },
        };

        assert_eq!(
            shard_condition(&shard.predicate).unwrap(),
            "CRC32(CONCAT_WS(',', `region`, `code`)) % 4 = 2"
        );
    }

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
        assert_eq!(
            quote_table(&TableName::new("db", "t")),
            "`db`.`t`"
        );
    }
}
