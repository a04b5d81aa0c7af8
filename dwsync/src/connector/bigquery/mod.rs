//! BigQuery connector.
//!
//! Every operation is a query job: DDL, `load data` from the staged CSV files in Cloud
//! Storage and a single `merge` per change batch.

mod client;
mod sql;

use std::time::Duration;

use dwsync_config::shared::ReplicationConfig;
use tracing::info;

pub use client::{BigQueryClient, BigQueryDatasetId, BigQueryProjectId, bq_error_to_sync_error};

use crate::connector::{
    ColumnState, Connector, execute_ddl_statements, load_error, record_rows_loaded,
};
use crate::error::{ErrorKind, SyncResult};
use crate::replication::retry::with_timeout;
use crate::source::Source;
use crate::storage::{StagingStore, StorageCredentials, StorageScheme, StorageUri};
use crate::types::{TableColumn, TableDefinition, TableName};
use crate::{bail, sync_error};

const CONNECTOR_NAME: &str = "bigquery";

/// Connector replicating one table into a BigQuery dataset.
#[derive(Debug)]
pub struct BigQueryConnector {
    client: BigQueryClient,
    dataset_id: BigQueryDatasetId,
    table_id: String,
    stage_table_id: String,
    storage_uri: StorageUri,
    credentials: StorageCredentials,
    state: ColumnState,
    operation_timeout: Duration,
}

impl BigQueryConnector {
    /// Creates a connector for `table_id`, loading staged files below `storage_uri`.
    ///
    /// `stage_table_id` names the staging table used for change batches.
    pub fn new(
        client: BigQueryClient,
        dataset_id: BigQueryDatasetId,
        table_id: impl Into<String>,
        stage_table_id: impl Into<String>,
        storage_uri: StorageUri,
        credentials: StorageCredentials,
    ) -> SyncResult<Self> {
        check_storage(&storage_uri)?;

        Ok(Self {
            client,
            dataset_id,
            table_id: table_id.into(),
            stage_table_id: stage_table_id.into(),
            storage_uri,
            credentials,
            state: ColumnState::default(),
            operation_timeout: Duration::from_millis(
                ReplicationConfig::DEFAULT_OPERATION_TIMEOUT_MS,
            ),
        })
    }

    fn full_table_name(&self, table_id: &str) -> SyncResult<String> {
        sql::full_table_name(self.client.project_id(), &self.dataset_id, table_id)
    }

    async fn execute(&self, operation: &str, statement: &str) -> SyncResult<()> {
        with_timeout(self.operation_timeout, operation, self.client.execute(statement)).await
    }

    async fn count_rows(&self, full_table_name: &str) -> SyncResult<u64> {
        let count = with_timeout(
            self.operation_timeout,
            "count_rows",
            self.client.query_i64(&sql::count_rows(full_table_name)),
        )
        .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn check_storage(storage_uri: &StorageUri) -> SyncResult<()> {
    if storage_uri.scheme() != StorageScheme::Gcs {
        bail!(
            ErrorKind::ConfigError,
            "BigQuery loads staged files from Cloud Storage only",
            format!("{storage_uri} is not a gs:// URI")
        );
    }

    Ok(())
}

impl Connector for BigQueryConnector {
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

        let full_table_name = self.full_table_name(&self.table_id)?;
        let statement = sql::create_table(&full_table_name, &columns)?;

        info!(%table, %full_table_name, "creating or replacing table in bigquery");

        self.execute("create_table", &statement).await.map_err(|err| {
            sync_error!(
                ErrorKind::DdlExecutionFailed,
                "BigQuery table could not be created",
                format!("{full_table_name}: {err}"),
                source: err
            )
        })?;

        self.state = ColumnState::default();
        self.state.init(&self.table_id, columns)
    }

    async fn exec_ddl(&mut self, definition: &TableDefinition) -> SyncResult<()> {
        let changes = self.state.plan(definition)?;
        if changes.is_empty() {
            info!(table = %definition.table, query = %definition.query, "no DDL needed");
            return Ok(());
        }

        let full_table_name = self.full_table_name(&self.table_id)?;
        let statements = sql::alter_table(&full_table_name, &changes)?;

        let this = &*self;
        execute_ddl_statements(CONNECTOR_NAME, definition, &statements, |statement| async move {
            this.execute("exec_ddl", &statement).await
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
        let store = StagingStore::open(self.storage_uri.clone(), &self.credentials)?;
        let files: Vec<String> = with_timeout(
            self.operation_timeout,
            "list_snapshot",
            store.list_with_name_prefix("", file_prefix),
        )
        .await?
        .into_iter()
            .filter(|path| path.ends_with(".csv"))
            .collect();

        // Loading a wildcard that matches nothing fails, an empty table has nothing to load.
        if files.is_empty() {
            info!(target_table, file_prefix, "no snapshot files to load");
            return Ok(0);
        }

        let full_table_name = self.full_table_name(target_table)?;
        let initial = self.count_rows(&full_table_name).await?;

        let mut loaded = 0;
        for file in files {
            let uri = self.storage_uri.url_for(&file);
            self.execute("load_snapshot", &sql::load_data(&full_table_name, &[uri]))
                .await
                .map_err(|err| load_error("Snapshot shard could not be loaded", &file, err))?;

            let current = self.count_rows(&full_table_name).await?;
            let total = current.saturating_sub(initial);
            record_rows_loaded(CONNECTOR_NAME, "snapshot", total.saturating_sub(loaded));
            loaded = total;
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
        check_storage(storage_uri)?;

        let target = self.full_table_name(&self.table_id)?;
        let stage = self.full_table_name(&self.stage_table_id)?;
        let uri = storage_uri.url_for(file_path);

        // A staging table left behind by an interrupted attempt is replaced.
        self.execute("create_staging_table", &sql::create_staging_table(&stage, definition)?)
            .await
            .map_err(|err| err.context(format!("create staging table for {file_path}")))?;

        self.execute("load_increment", &sql::load_data(&stage, &[uri]))
            .await
            .map_err(|err| load_error("Change batch could not be loaded", file_path, err))?;
        let staged = self.count_rows(&stage).await?;

        self.execute("merge", &sql::merge(&target, &stage, definition)?)
            .await
            .map_err(|err| err.context(format!("merge {file_path}")))?;

        self.execute("drop_staging_table", &sql::drop_table(&stage))
            .await
            .map_err(|err| err.context(format!("drop staging table for {file_path}")))?;

        record_rows_loaded(CONNECTOR_NAME, "increment", staged);
        info!(table = %definition.table, file = file_path, rows = staged, "merged change batch");

        Ok(())
    }

    fn clone_with(
        &self,
        stage_name: &str,
        storage_uri: StorageUri,
        credentials: StorageCredentials,
    ) -> SyncResult<Self> {
        let mut connector = Self::new(
            self.client.clone(),
            self.dataset_id.clone(),
            self.table_id.clone(),
            stage_name,
            storage_uri,
            credentials,
        )?;
        connector.operation_timeout = self.operation_timeout;

        Ok(connector)
    }

    async fn close(&mut self) {
        info!(table = %self.table_id, "closed bigquery connector");
    }
}
