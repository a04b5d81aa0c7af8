//! Warehouse connectors.
//!
//! A [`Connector`] owns the warehouse side of one replicated table: it creates the table, keeps
//! its column set in step with the source through DDL, bulk loads snapshot shards and merges
//! change batches. A run uses two instances per table, one for the snapshot and one for the
//! incremental phase, each with its own staging identity.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::{Instrument, info, info_span, warn};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::metrics::{DWSYNC_DDL_STATEMENTS_TOTAL, DWSYNC_ROWS_LOADED_TOTAL};
use crate::schema::{SchemaChange, diff};
use crate::source::Source;
use crate::storage::{StorageCredentials, StorageUri};
use crate::types::{TableColumn, TableDefinition, TableName};
use crate::{bail, sync_error};

#[cfg(feature = "bigquery")]
pub mod bigquery;
pub mod memory;
#[cfg(feature = "redshift")]
pub mod redshift;

/// Warehouse side of one replicated table.
pub trait Connector: Send + Sync + Sized {
    /// Connector family, used in logs and metric labels.
    fn name() -> &'static str;

    /// Known column set, empty until the schema is initialized.
    fn columns(&self) -> &[TableColumn];

    /// Deadline of each warehouse statement and storage call the connector makes.
    fn set_operation_timeout(&mut self, timeout: Duration);

    /// Records the column set of the warehouse table.
    ///
    /// Does nothing when a column set is already known; fails with [`ErrorKind::SchemaError`]
    /// when `columns` is empty.
    fn init_schema(
        &mut self,
        columns: Vec<TableColumn>,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Creates the warehouse table from the source table's columns and primary key.
    fn copy_table_schema<S: Source>(
        &mut self,
        source: &S,
        table: &TableName,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Brings the warehouse table to the columns of `definition`.
    ///
    /// Only a fully applied change set updates the known columns.
    fn exec_ddl(
        &mut self,
        definition: &TableDefinition,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Loads every snapshot shard named `<file_prefix>*.csv` into `target_table`.
    ///
    /// `on_progress` receives the running total of loaded rows. Returns the total.
    fn load_snapshot<F>(
        &mut self,
        target_table: &str,
        file_prefix: &str,
        on_progress: F,
    ) -> impl Future<Output = SyncResult<u64>> + Send
    where
        F: FnMut(u64) + Send;

    /// Merges the change batch at `file_path` below `storage_uri` into the warehouse table.
    fn load_increment(
        &mut self,
        definition: &TableDefinition,
        storage_uri: &StorageUri,
        file_path: &str,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// A connector on the same warehouse session with another staging identity and no known
    /// columns.
    fn clone_with(
        &self,
        stage_name: &str,
        storage_uri: StorageUri,
        credentials: StorageCredentials,
    ) -> SyncResult<Self>;

    /// Releases the warehouse session. Safe to call more than once.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Column bookkeeping shared by connector implementations.
#[derive(Debug, Clone, Default)]
pub struct ColumnState {
    columns: Vec<TableColumn>,
}

impl ColumnState {
    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    pub fn is_initialized(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Records `columns` unless a column set is already known.
    pub fn init(&mut self, table: &str, columns: Vec<TableColumn>) -> SyncResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if columns.is_empty() {
            bail!(
                ErrorKind::SchemaError,
                "Cannot initialize a table schema without columns",
                table
            );
        }

        info!(table, columns = columns.len(), "table columns initialized");
        self.columns = columns;

        Ok(())
    }

    /// Changes needed to reach `definition`.
    ///
    /// Fails with [`ErrorKind::PreconditionError`] before initialization.
    pub fn plan(&self, definition: &TableDefinition) -> SyncResult<Vec<SchemaChange>> {
        if !self.is_initialized() {
            bail!(
                ErrorKind::PreconditionError,
                "Table columns are not initialized, a DDL cannot be applied before the schema is known",
                format!("{} version {}", definition.table, definition.table_version)
            );
        }

        Ok(diff(&self.columns, &definition.columns))
    }

    /// Records a fully applied change set.
    pub fn commit(&mut self, definition: &TableDefinition) {
        self.columns = definition.columns.clone();
    }
}

/// Runs `statements` in order through `execute`, under one span carrying the source DDL.
///
/// A failure after at least one applied statement is reported as [`ErrorKind::PartialDdl`]
/// listing the applied statements; a failure of the first one keeps its own kind.
pub async fn execute_ddl_statements<S, F, Fut>(
    connector: &'static str,
    definition: &TableDefinition,
    statements: &[S],
    mut execute: F,
) -> SyncResult<()>
where
    S: fmt::Display + Clone,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = SyncResult<()>>,
{
    let span = info_span!(
        "exec_ddl",
        connector,
        table = %definition.table,
        table_version = definition.table_version,
        query = %definition.query,
    );

    async move {
        for (index, statement) in statements.iter().enumerate() {
            if let Err(err) = execute(statement.clone()).await {
                warn!(
                    %statement,
                    applied = index,
                    total = statements.len(),
                    "ddl statement failed"
                );

                if index == 0 {
                    return Err(err.context(format!("exec_ddl {statement}")));
                }

                let applied = statements[..index]
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(sync_error!(
                    ErrorKind::PartialDdl,
                    "DDL was only partially applied",
                    format!("failed: {statement}\napplied:\n{applied}\ncause: {err}")
                )
                .with_source(err));
            }

            counter!(DWSYNC_DDL_STATEMENTS_TOTAL, "connector" => connector).increment(1);
        }

        info!(statements = statements.len(), "ddl applied");

        Ok(())
    }
    .instrument(span)
    .await
}

/// Records loaded rows under the connector's label.
pub fn record_rows_loaded(connector: &'static str, phase: &'static str, rows: u64) {
    counter!(DWSYNC_ROWS_LOADED_TOTAL, "connector" => connector, "phase" => phase).increment(rows);
}

/// Error of a load of a staged file, keeping the file in the detail.
pub fn load_error(description: &'static str, file: &str, err: SyncError) -> SyncError {
    let kind = match err.kind() {
        ErrorKind::InvalidData | ErrorKind::ConversionError => ErrorKind::LoadError,
        kind => kind,
    };

    sync_error!(kind, description, format!("{file}: {err}")).with_source(err)
}
