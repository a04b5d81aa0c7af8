use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dwsync_config::shared::ReplicationConfig;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::codec::{CHANGE_META_COLUMNS, decode_changes, decode_rows};
use crate::connector::{
    ColumnState, Connector, execute_ddl_statements, load_error, record_rows_loaded,
};
use crate::error::{ErrorKind, SyncResult};
use crate::merge::{ChangeOp, ChangeRow, MergeAction, key_indices, key_of, plan};
use crate::replication::retry::with_timeout;
use crate::schema::SchemaChange;
use crate::source::Source;
use crate::storage::{StagingStore, StorageCredentials, StorageUri};
use crate::types::{ColumnType, TableColumn, TableDefinition, TableName, TableRow};
use crate::{bail, sync_error};

const CONNECTOR_NAME: &str = "memory";

#[derive(Debug, Clone, Default)]
struct WarehouseTable {
    columns: Vec<TableColumn>,
    rows: Vec<TableRow>,
}

#[derive(Debug)]
struct InjectedFailure {
    pattern: String,
    remaining: usize,
    kind: ErrorKind,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, WarehouseTable>,
    statements: Vec<String>,
    failures: Vec<InjectedFailure>,
    statement_delay: Duration,
}

/// In-memory warehouse shared by every [`MemoryConnector`] created from it.
///
/// Executed statements are recorded in order so tests can assert on what reached the
/// warehouse, and statements can be made to fail to simulate warehouse outages.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `table`, or `None` when the table does not exist.
    pub async fn table_rows(&self, table: &str) -> Option<Vec<TableRow>> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).map(|t| t.rows.clone())
    }

    /// Columns of `table`, or `None` when the table does not exist.
    pub async fn table_columns(&self, table: &str) -> Option<Vec<TableColumn>> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).map(|t| t.columns.clone())
    }

    pub async fn has_table(&self, table: &str) -> bool {
        self.inner.lock().await.tables.contains_key(table)
    }

    /// Every statement executed so far, in order.
    pub async fn statements(&self) -> Vec<String> {
        self.inner.lock().await.statements.clone()
    }

    pub async fn clear_statements(&self) {
        self.inner.lock().await.statements.clear();
    }

    /// Makes the next `times` statements whose text contains `pattern` fail with `kind`.
    pub async fn fail_statements(&self, pattern: impl Into<String>, times: usize, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.failures.push(InjectedFailure {
            pattern: pattern.into(),
            remaining: times,
            kind,
        });
    }

    /// Makes every statement take at least `delay`.
    pub async fn set_statement_delay(&self, delay: Duration) {
        self.inner.lock().await.statement_delay = delay;
    }

    /// Creates `table` with `rows`, replacing any existing table.
    pub async fn seed_table(&self, table: &str, columns: Vec<TableColumn>, rows: Vec<TableRow>) {
        let mut inner = self.inner.lock().await;
        inner
            .tables
            .insert(table.to_string(), WarehouseTable { columns, rows });
    }

    async fn execute(&self, statement: Statement) -> SyncResult<u64> {
        let delay = self.inner.lock().await.statement_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        let rendered = statement.to_string();

        if let Some(failure) = inner
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && rendered.contains(&f.pattern))
        {
            failure.remaining -= 1;
            bail!(
                failure.kind,
                "Memory warehouse rejected the statement",
                rendered
            );
        }

        debug!(statement = %rendered, "executing memory warehouse statement");
        inner.statements.push(rendered);

        match statement {
            Statement::CreateTable { table, columns } => {
                inner.tables.insert(
                    table,
                    WarehouseTable {
                        columns,
                        rows: Vec::new(),
                    },
                );
                Ok(0)
            }
            Statement::DropTable { table } => {
                inner.tables.remove(&table);
                Ok(0)
            }
            Statement::Alter { table, change } => {
                let target = existing_table(&mut inner.tables, &table)?;
                alter_table(&table, target, &change)?;
                Ok(0)
            }
            Statement::Load { table, rows, .. } => {
                let target = existing_table(&mut inner.tables, &table)?;
                for row in &rows {
                    if row.len() != target.columns.len() {
                        bail!(
                            ErrorKind::LoadError,
                            "Loaded row does not match the table columns",
                            format!(
                                "{table}: {} values for {} columns",
                                row.len(),
                                target.columns.len()
                            )
                        );
                    }
                }
                let count = rows.len() as u64;
                target.rows.extend(rows);
                Ok(count)
            }
            Statement::Merge {
                table,
                staging,
                definition,
            } => {
                let staged = existing_table(&mut inner.tables, &staging)?.rows.clone();
                let changes = staged
                    .into_iter()
                    .map(staged_change)
                    .collect::<SyncResult<Vec<_>>>()?;
                let actions = plan(&definition, &changes)?;

                let target = existing_table(&mut inner.tables, &table)?;
                merge_into(target, &definition, &actions)?;
                Ok(actions.len() as u64)
            }
        }
    }
}

/// Statement understood by the memory warehouse, rendered in a SQL-like form for the log.
#[derive(Debug, Clone)]
enum Statement {
    CreateTable {
        table: String,
        columns: Vec<TableColumn>,
    },
    DropTable {
        table: String,
    },
    Alter {
        table: String,
        change: SchemaChange,
    },
    Load {
        table: String,
        file: String,
        rows: Vec<TableRow>,
    },
    Merge {
        table: String,
        staging: String,
        definition: TableDefinition,
    },
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::CreateTable { table, columns } => {
                let columns = columns
                    .iter()
                    .map(|c| {
                        if c.nullable {
                            format!("{} {}", c.name, c.column_type)
                        } else {
                            format!("{} {} NOT NULL", c.name, c.column_type)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "CREATE OR REPLACE TABLE {table} ({columns})")
            }
            Statement::DropTable { table } => write!(f, "DROP TABLE IF EXISTS {table}"),
            Statement::Alter { table, change } => match change {
                SchemaChange::AddColumn(column) => write!(
                    f,
                    "ALTER TABLE {table} ADD COLUMN {} {}",
                    column.name, column.column_type
                ),
                SchemaChange::AlterColumn { latest, .. } => write!(
                    f,
                    "ALTER TABLE {table} ALTER COLUMN {} {}{}",
                    latest.name,
                    latest.column_type,
                    if latest.nullable { "" } else { " NOT NULL" }
                ),
                SchemaChange::DropColumn(column) => {
                    write!(f, "ALTER TABLE {table} DROP COLUMN {}", column.name)
                }
            },
            Statement::Load { table, file, rows } => {
                write!(f, "LOAD {} ROWS INTO {table} FROM {file}", rows.len())
            }
            Statement::Merge { table, staging, .. } => {
                write!(f, "MERGE INTO {table} USING {staging}")
            }
        }
    }
}

fn existing_table<'a>(
    tables: &'a mut HashMap<String, WarehouseTable>,
    table: &str,
) -> SyncResult<&'a mut WarehouseTable> {
    match tables.get_mut(table) {
        Some(target) => Ok(target),
        None => Err(sync_error!(
            ErrorKind::DestinationQueryFailed,
            "Memory warehouse table not found",
            table
        )),
    }
}

/// Fails like a real warehouse on adding a column that exists or changing one that does not.
fn alter_table(table: &str, target: &mut WarehouseTable, change: &SchemaChange) -> SyncResult<()> {
    match change {
        SchemaChange::AddColumn(column) => {
            if column_index(&target.columns, &column.name).is_some() {
                bail!(
                    ErrorKind::DdlExecutionFailed,
                    "Column already exists",
                    format!("{table}.{}", column.name)
                );
            }
            for row in &mut target.rows {
                row.values_mut().push(None);
            }
        }
        SchemaChange::DropColumn(column) => {
            let Some(index) = column_index(&target.columns, &column.name) else {
                bail!(
                    ErrorKind::DdlExecutionFailed,
                    "Column does not exist",
                    format!("{table}.{}", column.name)
                );
            };
            for row in &mut target.rows {
                if index < row.len() {
                    row.values_mut().remove(index);
                }
            }
        }
        SchemaChange::AlterColumn { latest, .. } => {
            if column_index(&target.columns, &latest.name).is_none() {
                bail!(
                    ErrorKind::DdlExecutionFailed,
                    "Column does not exist",
                    format!("{table}.{}", latest.name)
                );
            }
        }
    }

    change.apply(&mut target.columns);

    Ok(())
}

fn column_index(columns: &[TableColumn], name: &str) -> Option<usize> {
    columns.iter().position(|c| c.name == name)
}

fn staged_change(row: TableRow) -> SyncResult<ChangeRow> {
    let mut values = row.into_values();
    if values.len() < CHANGE_META_COLUMNS.len() {
        bail!(
            ErrorKind::MergeFailed,
            "Staged change is missing its metadata columns",
            format!("{} values", values.len())
        );
    }

    let data = values.split_off(CHANGE_META_COLUMNS.len());
    let op = ChangeOp::parse(values[0].as_deref().unwrap_or_default())?;
    let commit_ts = values[3].as_deref().unwrap_or_default().parse::<u64>()?;

    Ok(ChangeRow {
        op,
        commit_ts,
        row: TableRow::new(data),
    })
}

/// Applies merge actions, projecting rows written in `definition` column order onto the
/// target's columns by name.
fn merge_into(
    target: &mut WarehouseTable,
    definition: &TableDefinition,
    actions: &[MergeAction],
) -> SyncResult<()> {
    let projection: Vec<Option<usize>> = target
        .columns
        .iter()
        .map(|column| definition.columns.iter().position(|c| c.name == column.name))
        .collect();

    let target_definition = TableDefinition::new(
        definition.table.clone(),
        definition.table_version,
        target
            .columns
            .iter()
            .map(|c| {
                let mut column = c.clone();
                column.primary_key = definition.column(&c.name).is_some_and(|d| d.primary_key);
                column
            })
            .collect(),
    );
    let indices = key_indices(&target_definition)?;

    let mut positions: HashMap<Vec<String>, usize> = HashMap::with_capacity(target.rows.len());
    for (position, row) in target.rows.iter().enumerate() {
        positions.insert(key_of(row, &indices)?, position);
    }

    let mut deleted = vec![false; target.rows.len()];
    for action in actions {
        let row: TableRow = projection
            .iter()
            .map(|index| index.and_then(|i| action.row().values().get(i).cloned().flatten()))
            .collect();
        let key = key_of(&row, &indices)?;

        match (action, positions.get(&key).copied()) {
            (MergeAction::Upsert(_), Some(position)) => {
                target.rows[position] = row;
                deleted[position] = false;
            }
            (MergeAction::Upsert(_), None) => {
                positions.insert(key, target.rows.len());
                target.rows.push(row);
                deleted.push(false);
            }
            (MergeAction::Delete(_), Some(position)) => {
                deleted[position] = true;
                positions.remove(&key);
            }
            (MergeAction::Delete(_), None) => {}
        }
    }

    let mut position = 0;
    target.rows.retain(|_| {
        let keep = !deleted[position];
        position += 1;
        keep
    });

    Ok(())
}

fn staging_columns(definition: &TableDefinition) -> Vec<TableColumn> {
    let mut columns: Vec<TableColumn> = CHANGE_META_COLUMNS
        .iter()
        .map(|name| TableColumn::new(*name, ColumnType::Text, true))
        .collect();
    columns.extend(definition.columns.iter().map(|c| {
        let mut column = c.clone();
        column.primary_key = false;
        column.nullable = true;
        column
    }));

    columns
}

fn staged_row(definition: &TableDefinition, change: ChangeRow) -> TableRow {
    let mut values = vec![
        Some(change.op.as_str().to_string()),
        Some(definition.table.name.clone()),
        Some(definition.table.database.clone()),
        Some(change.commit_ts.to_string()),
    ];
    values.extend(change.row.into_values());

    TableRow::new(values)
}

/// Connector writing into a [`MemoryWarehouse`], reading staged files through `object_store`.
#[derive(Debug)]
pub struct MemoryConnector {
    warehouse: MemoryWarehouse,
    table_id: String,
    stage_name: String,
    storage_uri: StorageUri,
    credentials: StorageCredentials,
    state: ColumnState,
    operation_timeout: Duration,
    closed: bool,
}

impl MemoryConnector {
    pub fn new(
        warehouse: MemoryWarehouse,
        table_id: impl Into<String>,
        stage_name: impl Into<String>,
        storage_uri: StorageUri,
        credentials: StorageCredentials,
    ) -> Self {
        Self {
            warehouse,
            table_id: table_id.into(),
            stage_name: stage_name.into(),
            storage_uri,
            credentials,
            state: ColumnState::default(),
            operation_timeout: Duration::from_millis(
                ReplicationConfig::DEFAULT_OPERATION_TIMEOUT_MS,
            ),
            closed: false,
        }
    }

    pub fn warehouse(&self) -> &MemoryWarehouse {
        &self.warehouse
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    async fn execute(&self, operation: &str, statement: Statement) -> SyncResult<u64> {
        with_timeout(
            self.operation_timeout,
            operation,
            self.warehouse.execute(statement),
        )
        .await
    }
}

impl Connector for MemoryConnector {
    fn name() -> &'static str {
        CONNECTOR_NAME
    }

    fn columns(&self) -> &[TableColumn] {
        self.state.columns()
    }

    fn set_operation_timeout(&mut self, timeout: Duration) {
        self.operation_timeout = timeout;
    }

    async fn init_schema(&mut self, columns: Vec<TableColumn>) -> SyncResult<()> {
        self.state.init(&self.table_id, columns)
    }

    async fn copy_table_schema<S: Source>(
        &mut self,
        source: &S,
        table: &TableName,
    ) -> SyncResult<()> {
        let columns = source.table_columns(table).await?;

        let statement = Statement::CreateTable {
            table: self.table_id.clone(),
            columns: columns.clone(),
        };
        self.execute("create_table", statement).await.map_err(|err| {
            sync_error!(
                ErrorKind::DdlExecutionFailed,
                "Warehouse table could not be created",
                format!("{}: {err}", self.table_id),
                source: err
            )
        })?;

        info!(%table, target = %self.table_id, "copied table schema");

        self.state = ColumnState::default();
        self.state.init(&self.table_id, columns)
    }

    async fn exec_ddl(&mut self, definition: &TableDefinition) -> SyncResult<()> {
        let changes = self.state.plan(definition)?;
        if changes.is_empty() {
            info!(table = %definition.table, query = %definition.query, "no DDL needed");
            return Ok(());
        }

        let statements: Vec<Statement> = changes
            .into_iter()
            .map(|change| Statement::Alter {
                table: self.table_id.clone(),
                change,
            })
            .collect();

        let this = &*self;
        execute_ddl_statements(CONNECTOR_NAME, definition, &statements, |statement| async move {
            this.execute("exec_ddl", statement).await.map(|_| ())
        })
        .await?;

        self.state.commit(definition);

        Ok(())
    }

    async fn load_snapshot<F>(
        &mut self,
        target_table: &str,
        file_prefix: &str,
        mut on_progress: F,
    ) -> SyncResult<u64>
    where
        F: FnMut(u64) + Send,
    {
        let deadline = self.operation_timeout;
        let store = StagingStore::open(self.storage_uri.clone(), &self.credentials)?;
        let files: Vec<String> = with_timeout(
            deadline,
            "list_snapshot",
            store.list_with_name_prefix("", file_prefix),
        )
        .await?
        .into_iter()
            .filter(|path| path.ends_with(".csv"))
            .collect();

        if files.is_empty() {
            info!(target_table, file_prefix, "no snapshot files to load");
            return Ok(0);
        }

        let Some(columns) = self.warehouse.table_columns(target_table).await else {
            bail!(
                ErrorKind::LoadError,
                "Snapshot target table does not exist",
                target_table
            );
        };

        let mut loaded = 0;
        for file in files {
            let data = with_timeout(deadline, "read_snapshot", store.get(&file)).await?;
            let rows = decode_rows(&data, columns.len())
                .map_err(|err| load_error("Snapshot shard could not be loaded", &file, err))?;

            let statement = Statement::Load {
                table: target_table.to_string(),
                file: self.storage_uri.url_for(&file),
                rows,
            };
            let count = self
                .execute("load_snapshot", statement)
                .await
                .map_err(|err| load_error("Snapshot shard could not be loaded", &file, err))?;

            loaded += count;
            record_rows_loaded(CONNECTOR_NAME, "snapshot", count);
            on_progress(loaded);
        }

        info!(target_table, rows = loaded, "snapshot loaded");

        Ok(loaded)
    }

    async fn load_increment(
        &mut self,
        definition: &TableDefinition,
        storage_uri: &StorageUri,
        file_path: &str,
    ) -> SyncResult<()> {
        let store = StagingStore::open(storage_uri.clone(), &self.credentials)?;
        let data = with_timeout(self.operation_timeout, "read_increment", store.get(file_path)).await?;
        let changes = decode_changes(definition, &data)
            .map_err(|err| load_error("Change batch could not be loaded", file_path, err))?;
        let rows: Vec<TableRow> = changes
            .into_iter()
            .map(|change| staged_row(definition, change))
            .collect();
        let count = rows.len() as u64;

        let staging = self.stage_name.clone();
        let statements = [
            Statement::DropTable {
                table: staging.clone(),
            },
            Statement::CreateTable {
                table: staging.clone(),
                columns: staging_columns(definition),
            },
            Statement::Load {
                table: staging.clone(),
                file: storage_uri.url_for(file_path),
                rows,
            },
            Statement::Merge {
                table: self.table_id.clone(),
                staging: staging.clone(),
                definition: definition.clone(),
            },
            Statement::DropTable { table: staging },
        ];

        for statement in statements {
            self.execute("load_increment", statement)
                .await
                .map_err(|err| err.context(format!("load_increment {file_path}")))?;
        }

        record_rows_loaded(CONNECTOR_NAME, "increment", count);
        info!(table = %definition.table, file = file_path, rows = count, "merged change batch");

        Ok(())
    }

    fn clone_with(
        &self,
        stage_name: &str,
        storage_uri: StorageUri,
        credentials: StorageCredentials,
    ) -> SyncResult<Self> {
        let mut connector = Self::new(
            self.warehouse.clone(),
            self.table_id.clone(),
            stage_name,
            storage_uri,
            credentials,
        );
        connector.operation_timeout = self.operation_timeout;

        Ok(connector)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!(table = %self.table_id, stage = %self.stage_name, "closed memory connector");
        }
    }
}
