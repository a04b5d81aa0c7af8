//! Redshift connector.
//!
//! Staged files are loaded with `COPY` from S3. A change batch is copied into a staging table
//! and merged with a delete and an insert inside one transaction.

mod sql;

use std::time::Duration;

use dwsync_config::shared::{IntoConnectOptions, RedshiftConnectionConfig, ReplicationConfig};
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{Executor, PgPool};
use tracing::{debug, info};

pub use sql::CopyAuthorization;

use crate::connector::{ColumnState, Connector, execute_ddl_statements, record_rows_loaded};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::replication::retry::with_timeout;
use crate::source::Source;
use crate::storage::{StagingStore, StorageCredentials, StorageScheme, StorageUri};
use crate::types::{TableColumn, TableDefinition, TableName};
use crate::{bail, sync_error};

const CONNECTOR_NAME: &str = "redshift";

/// Connections kept open to the cluster, shared by the connectors of one table.
const MAX_CONNECTIONS: u32 = 4;

/// Converts errors returned by the cluster to sync errors.
pub fn redshift_error(err: sqlx::Error) -> SyncError {
    let (kind, description) = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => (
            ErrorKind::DestinationConnectionFailed,
            "Redshift connection failed",
        ),
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("28000") | Some("28P01")) =>
        {
            (
                ErrorKind::AuthenticationError,
                "Redshift rejected the credentials",
            )
        }
        _ => (ErrorKind::DestinationQueryFailed, "Redshift query failed"),
    };

    sync_error!(kind, description, err.to_string(), source: err)
}

/// A `COPY` rejected by the cluster is a load error; connectivity keeps its own kind.
fn copy_error(file: &str, err: sqlx::Error) -> SyncError {
    let err = redshift_error(err);
    let kind = match err.kind() {
        ErrorKind::DestinationQueryFailed => ErrorKind::LoadError,
        kind => kind,
    };

    sync_error!(kind, "Staged file could not be copied", file).with_source(err)
}

/// Opens a pool to the cluster described by `config`.
pub async fn connect(config: &RedshiftConnectionConfig) -> SyncResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(config.without_db())
        .await
        .map_err(|err| {
            redshift_error(err).context(format!("connect to {}:{}", config.host, config.port))
        })?;

    info!(host = %config.host, database = %config.database, "connected to redshift");

    Ok(pool)
}

/// Connector replicating one table into a Redshift schema.
#[derive(Debug)]
pub struct RedshiftConnector {
    pool: PgPool,
    schema: String,
    table_id: String,
    stage_table_id: String,
    iam_role: Option<String>,
    storage_uri: StorageUri,
    credentials: StorageCredentials,
    authorization: CopyAuthorization,
    state: ColumnState,
    operation_timeout: Duration,
}

impl RedshiftConnector {
    pub fn new(
        pool: PgPool,
        schema: impl Into<String>,
        table_id: impl Into<String>,
        stage_table_id: impl Into<String>,
        iam_role: Option<String>,
        storage_uri: StorageUri,
        credentials: StorageCredentials,
    ) -> SyncResult<Self> {
        check_storage(&storage_uri)?;
        let authorization = CopyAuthorization::resolve(iam_role.as_deref(), &credentials)?;

        Ok(Self {
            pool,
            schema: schema.into(),
            table_id: table_id.into(),
            stage_table_id: stage_table_id.into(),
            iam_role,
            storage_uri,
            credentials,
            authorization,
            state: ColumnState::default(),
            operation_timeout: Duration::from_millis(
                ReplicationConfig::DEFAULT_OPERATION_TIMEOUT_MS,
            ),
        })
    }

    fn full_table_name(&self, table: &str) -> SyncResult<String> {
        sql::full_table_name(&self.schema, table)
    }

    async fn execute(&self, statement: &str) -> SyncResult<()> {
        debug!(statement, "running redshift statement");
        with_timeout(self.operation_timeout, "execute", async {
            sqlx::raw_sql(statement)
                .execute(&self.pool)
                .await
                .map_err(redshift_error)
        })
        .await?;

        Ok(())
    }

    /// Copies `uri` into `full_table_name` on `connection` and returns the copied row count.
    ///
    /// `pg_last_copy_count` reports on the session that ran the copy.
    async fn copy(
        &self,
        connection: &mut PgConnection,
        full_table_name: &str,
        uri: &str,
        file: &str,
    ) -> SyncResult<u64> {
        let copy = sql::copy_from(full_table_name, uri, &self.authorization);
        debug!(%uri, full_table_name, "copying staged file");

        with_timeout(self.operation_timeout, "copy", async {
            (&mut *connection)
                .execute(sqlx::raw_sql(&copy))
                .await
                .map_err(|err| copy_error(file, err))
        })
        .await?;

        let copied: i64 = with_timeout(self.operation_timeout, "copy_count", async {
            sqlx::query_scalar("SELECT pg_last_copy_count()")
                .fetch_one(&mut *connection)
                .await
                .map_err(redshift_error)
        })
        .await?;

        Ok(u64::try_from(copied).unwrap_or_default())
    }
}

fn check_storage(storage_uri: &StorageUri) -> SyncResult<()> {
    if storage_uri.scheme() != StorageScheme::S3 {
        bail!(
            ErrorKind::ConfigError,
            "Redshift copies staged files from S3 only",
            format!("{storage_uri} is not an s3:// URI")
        );
    }

    Ok(())
}

impl Connector for RedshiftConnector {
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

        info!(%table, %full_table_name, "creating or replacing table in redshift");

        for statement in [
            sql::drop_table(&full_table_name),
            sql::create_table(&full_table_name, &columns),
        ] {
            self.execute(&statement).await.map_err(|err| {
                sync_error!(
                    ErrorKind::DdlExecutionFailed,
                    "Redshift table could not be created",
                    format!("{full_table_name}: {err}")
                )
                .with_source(err)
            })?;
        }

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
            this.execute(&statement).await
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

        if files.is_empty() {
            info!(target_table, file_prefix, "no snapshot files to load");
            return Ok(0);
        }

        let full_table_name = self.full_table_name(target_table)?;

        let mut connection = self.pool.acquire().await.map_err(redshift_error)?;

        let mut loaded = 0;
        for file in files {
            let uri = self.storage_uri.url_for(&file);
            let copied = self
                .copy(&mut connection, &full_table_name, &uri, &file)
                .await?;

            record_rows_loaded(CONNECTOR_NAME, "snapshot", copied);
            loaded += copied;
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
        self.execute(&sql::drop_table(&stage))
            .await
            .map_err(|err| err.context(format!("drop staging table for {file_path}")))?;
        self.execute(&sql::create_staging_table(&stage, definition))
            .await
            .map_err(|err| err.context(format!("create staging table for {file_path}")))?;

        let mut connection = self.pool.acquire().await.map_err(redshift_error)?;
        let staged = self.copy(&mut connection, &stage, &uri, file_path).await?;
        drop(connection);

        let statements = sql::merge(&target, &stage, definition)?;
        let mut transaction = self.pool.begin().await.map_err(redshift_error)?;
        for statement in &statements {
            debug!(statement, "running redshift merge statement");
            with_timeout(self.operation_timeout, "merge", async {
                (&mut *transaction)
                    .execute(sqlx::raw_sql(statement))
                    .await
                    .map_err(redshift_error)
            })
            .await
            .map_err(|err| err.context(format!("merge {file_path}")))?;
        }
        with_timeout(self.operation_timeout, "commit", async {
            transaction.commit().await.map_err(redshift_error)
        })
        .await
        .map_err(|err| err.context(format!("merge {file_path}")))?;

        self.execute(&sql::drop_table(&stage))
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
            self.pool.clone(),
            self.schema.clone(),
            self.table_id.clone(),
            stage_name,
            self.iam_role.clone(),
            storage_uri,
            credentials,
        )?;
        connector.operation_timeout = self.operation_timeout;

        Ok(connector)
    }

    async fn close(&mut self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!(table = %self.table_id, "closed redshift connection pool");
        }
    }
}
