use std::sync::Arc;

use dwsync::cdc::ChangefeedClient;
use dwsync::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use dwsync::connector::Connector;
use dwsync::connector::bigquery::{BigQueryClient, BigQueryConnector};
use dwsync::connector::memory::{MemoryConnector, MemoryWarehouse};
use dwsync::connector::redshift::{self, RedshiftConnector};
use dwsync::error::{ErrorKind, SyncError, SyncResult};
use dwsync::replication::{ReplicationPhase, StorageExport, TableReplication};
use dwsync::source::TiDbSource;
use dwsync::storage::{StagingStore, StorageCredentials, StorageUri, resolve_credentials};
use dwsync::sync_error;
use dwsync::types::TableName;
use dwsync_config::shared::{
    ReplicationConfig, ReplicatorConfig, StorageConfig, TiDbConnectionConfig, WarehouseConfig,
};
use secrecy::ExposeSecret;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::ReplicatorResult;

/// Stage name of the per-table connectors the replication derives its own connectors from.
const BASE_STAGE_NAME: &str = "base";

/// Starts the replicator with the provided configuration.
///
/// Connects to the source and the staging storage, then runs one replication per configured
/// table until every one finished or shutdown was requested. Connectors are dispatched
/// statically per warehouse; without one, each table is only exported to storage.
pub async fn start_replicator_with_config(config: ReplicatorConfig) -> ReplicatorResult<()> {
    info!("starting replicator service");

    log_config(&config);

    let tables = config
        .replication
        .tables
        .iter()
        .map(|table| table.parse::<TableName>())
        .collect::<SyncResult<Vec<_>>>()?;

    let root = StorageUri::parse(&config.storage.uri)?
        .with_region(config.storage.region.clone())
        .with_endpoint(config.storage.endpoint.clone());
    let credentials = resolve_credentials(&root, config.storage.credentials.as_ref())?;
    let staging = StagingStore::open(root, &credentials)?;
    info!(
        storage = %staging.root(),
        credentials = credentials.kind(),
        "opened staging storage"
    );

    let source = Arc::new(TiDbSource::connect(&config.source).await?);
    let changefeed = config
        .changefeed
        .clone()
        .map(ChangefeedClient::new)
        .transpose()?;

    let mut runner = ReplicationRunner::new(
        source.clone(),
        staging,
        credentials,
        config.replication.clone(),
        changefeed,
    );

    let result = match &config.warehouse {
        WarehouseConfig::Memory => {
            let warehouse = MemoryWarehouse::new();
            for table in &tables {
                let connector = MemoryConnector::new(
                    warehouse.clone(),
                    table.name.clone(),
                    BASE_STAGE_NAME,
                    runner.staging.root().clone(),
                    runner.credentials.clone(),
                );
                runner.spawn(table.clone(), &connector)?;
            }
            runner.wait().await
        }
        WarehouseConfig::BigQuery {
            project_id,
            dataset_id,
            service_account_key,
            service_account_key_path,
        } => {
            let client = match (service_account_key, service_account_key_path) {
                (Some(key), _) => {
                    BigQueryClient::new_with_key(project_id.clone(), key.expose_secret()).await?
                }
                (None, Some(path)) => {
                    BigQueryClient::new_with_key_path(project_id.clone(), path).await?
                }
                (None, None) => BigQueryClient::new_with_adc(project_id.clone()).await?,
            };

            for table in &tables {
                let connector = BigQueryConnector::new(
                    client.clone(),
                    dataset_id.clone(),
                    table.name.clone(),
                    BASE_STAGE_NAME,
                    runner.staging.root().clone(),
                    runner.credentials.clone(),
                )?;
                runner.spawn(table.clone(), &connector)?;
            }
            runner.wait().await
        }
        WarehouseConfig::Redshift { connection } => {
            // Closing a connector closes its pool, so every table gets its own.
            for table in &tables {
                let pool = redshift::connect(connection).await?;
                let connector = RedshiftConnector::new(
                    pool,
                    connection.schema.clone(),
                    table.name.clone(),
                    BASE_STAGE_NAME,
                    connection.iam_role.clone(),
                    runner.staging.root().clone(),
                    runner.credentials.clone(),
                )?;
                runner.spawn(table.clone(), &connector)?;
            }
            runner.wait().await
        }
        WarehouseConfig::StorageOnly => {
            for table in &tables {
                runner.spawn_export(table.clone())?;
            }
            runner.wait().await
        }
    };

    source.close().await;
    result?;

    info!("replicator service completed");

    Ok(())
}

/// Runs the replications of several tables side by side and collects their outcome.
struct ReplicationRunner {
    source: Arc<TiDbSource>,
    staging: StagingStore,
    credentials: StorageCredentials,
    config: ReplicationConfig,
    changefeed: Option<ChangefeedClient>,
    shutdown_tx: ShutdownTx,
    replications: JoinSet<(TableName, SyncResult<ReplicationPhase>)>,
}

impl ReplicationRunner {
    fn new(
        source: Arc<TiDbSource>,
        staging: StagingStore,
        credentials: StorageCredentials,
        config: ReplicationConfig,
        changefeed: Option<ChangefeedClient>,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            source,
            staging,
            credentials,
            config,
            changefeed,
            shutdown_tx,
            replications: JoinSet::new(),
        }
    }

    /// Starts the replication of `table` on connectors derived from `connector`.
    fn spawn<C>(&mut self, table: TableName, connector: &C) -> SyncResult<()>
    where
        C: Connector + 'static,
    {
        let mut replication = TableReplication::new(
            table.clone(),
            self.source.clone(),
            connector,
            &self.staging,
            &self.credentials,
            &self.config,
            self.changefeed.clone(),
        )?;
        let shutdown_rx = self.shutdown_tx.subscribe();

        self.replications.spawn(async move {
            let result = replication.run(shutdown_rx).await;
            (table, result)
        });

        Ok(())
    }

    /// Starts the storage-only export of `table`.
    fn spawn_export(&mut self, table: TableName) -> SyncResult<()> {
        let mut export = StorageExport::new(
            table.clone(),
            self.source.clone(),
            &self.staging,
            &self.config,
            self.changefeed.clone(),
        )?;
        let shutdown_rx = self.shutdown_tx.subscribe();

        self.replications.spawn(async move {
            let result = export.run(shutdown_rx).await;
            (table, result)
        });

        Ok(())
    }

    /// Waits for every replication to stop.
    ///
    /// A failing table stops the others. Signals request a graceful stop of all of them.
    async fn wait(mut self) -> SyncResult<()> {
        let signal_handle = spawn_shutdown_listener(self.shutdown_tx.clone());

        let mut errors = Vec::new();
        while let Some(joined) = self.replications.join_next().await {
            match joined {
                Ok((table, Ok(phase))) => {
                    info!(%table, %phase, "replication stopped");
                }
                Ok((table, Err(err))) => {
                    error!(%table, error = %err, "replication failed");
                    errors.push(err);
                    self.request_shutdown();
                }
                Err(err) => {
                    error!(error = %err, "replication task failed");
                    errors.push(sync_error!(
                        ErrorKind::InvalidState,
                        "Replication task panicked or was cancelled",
                        err.to_string()
                    ));
                    self.request_shutdown();
                }
            }
        }

        signal_handle.abort();
        let _ = signal_handle.await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::from(errors))
        }
    }

    fn request_shutdown(&self) {
        if let Err(err) = self.shutdown_tx.shutdown() {
            debug!(error = ?err, "no replication left to shut down");
        }
    }
}

/// Triggers shutdown on SIGINT (ctrl+c) or SIGTERM.
fn spawn_shutdown_listener(shutdown_tx: ShutdownTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sigterm = async {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "failed to register SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down replication");
            }
            _ = sigterm => {
                info!("sigterm received, shutting down replication");
            }
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!(error = ?err, "failed to send shutdown signal");
        }
    })
}

fn log_config(config: &ReplicatorConfig) {
    log_source_config(&config.source);
    log_storage_config(&config.storage);
    log_warehouse_config(&config.warehouse);
    log_replication_config(&config.replication);

    if let Some(changefeed) = &config.changefeed {
        debug!(
            api_url = changefeed.api_url,
            changefeed_id = changefeed.changefeed_id,
            flush_interval_secs = changefeed.flush_interval_secs,
            file_size_bytes = changefeed.file_size_bytes,
            "changefeed config"
        );
    }
}

fn log_source_config(config: &TiDbConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        username = config.username,
        max_connections = config.max_connections,
        tls_enabled = config.tls.enabled,
        "source tidb connection config"
    );
}

fn log_storage_config(config: &StorageConfig) {
    debug!(
        uri = config.uri,
        region = config.region,
        endpoint = config.endpoint,
        explicit_credentials = config.credentials.is_some(),
        "staging storage config"
    );
}

fn log_warehouse_config(config: &WarehouseConfig) {
    match config {
        WarehouseConfig::BigQuery {
            project_id,
            dataset_id,
            service_account_key: _,
            service_account_key_path,
        } => {
            debug!(
                project_id,
                dataset_id, service_account_key_path, "using bigquery warehouse config"
            )
        }
        WarehouseConfig::Redshift { connection } => {
            debug!(
                host = connection.host,
                port = connection.port,
                database = connection.database,
                schema = connection.schema,
                iam_role = connection.iam_role,
                "using redshift warehouse config"
            )
        }
        WarehouseConfig::Memory => {
            debug!("using memory warehouse config");
        }
        WarehouseConfig::StorageOnly => {
            debug!("no warehouse configured, exporting to staging storage only");
        }
    }
}

fn log_replication_config(config: &ReplicationConfig) {
    debug!(
        mode = %config.mode,
        tables = ?config.tables,
        snapshot_concurrency = config.snapshot_concurrency,
        operation_timeout_ms = config.operation_timeout_ms,
        poll_interval_ms = config.poll_interval_ms,
        "replication config"
    );
}
