use std::sync::Arc;
use std::time::{Duration, Instant};

use dwsync_config::shared::{ReplicationConfig, ReplicationMode};
use metrics::{counter, gauge, histogram};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cdc::ChangefeedClient;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::connector::Connector;
use crate::error::{ErrorKind, SyncResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{INCREMENTAL__AFTER_MERGE, INCREMENTAL__BEFORE_MERGE, sync_fail_point};
use crate::increment::{Checkpoint, CheckpointStore, IncrementReader, VersionBatches};
use crate::metrics::{
    CONNECTOR_LABEL, DWSYNC_APPLIED_TABLE_VERSION, DWSYNC_BATCH_APPLY_DURATION_SECONDS,
    DWSYNC_BATCHES_APPLIED_TOTAL, PHASE_LABEL, TABLE_LABEL,
};
use crate::replication::export::hand_off_changefeed;
use crate::replication::phase::{ReplicationPhase, next_phase};
use crate::replication::retry::{Retry, with_timeout};
use crate::snapshot::{SnapshotExport, SnapshotExporter};
use crate::source::Source;
use crate::storage::{
    INCREMENT_SUBPATH, SNAPSHOT_SUBPATH, StagingStore, StorageCredentials, StorageUri,
    derive_paths,
};
use crate::sync_error;
use crate::types::{SourceTs, TableDefinition, TableName};

/// Staging table name of the snapshot connector of `table`.
pub fn snapshot_stage_name(table: &TableName) -> String {
    format!("snapshot_external_{}", table.name)
}

/// Staging table name of the incremental connector of `table`.
pub fn increment_stage_name(table: &TableName) -> String {
    format!("increment_external_{}", table.name)
}

/// Replication of one source table into the warehouse.
///
/// Walks the phases of its [`ReplicationMode`] in order. The snapshot and incremental phases
/// use separate connectors derived from the one handed to [`TableReplication::new`], so their
/// staging tables never collide.
#[derive(Debug)]
pub struct TableReplication<S, C> {
    table: TableName,
    mode: ReplicationMode,
    config: ReplicationConfig,
    phase: ReplicationPhase,
    source: Arc<S>,
    snapshot_connector: C,
    increment_connector: C,
    exporter: SnapshotExporter<S>,
    reader: IncrementReader,
    checkpoints: CheckpointStore,
    increment_uri: StorageUri,
    changefeed: Option<ChangefeedClient>,
    checkpoint: Option<Checkpoint>,
}

impl<S, C> TableReplication<S, C>
where
    S: Source + 'static,
    C: Connector,
{
    /// `staging` is rooted at the configured storage URI; the snapshot and incremental
    /// locations are derived from it.
    pub fn new(
        table: TableName,
        source: Arc<S>,
        connector: &C,
        staging: &StagingStore,
        credentials: &StorageCredentials,
        config: &ReplicationConfig,
        changefeed: Option<ChangefeedClient>,
    ) -> SyncResult<Self> {
        let (snapshot_uri, increment_uri) = derive_paths(staging.root());
        let operation_timeout = Duration::from_millis(config.operation_timeout_ms);

        let mut snapshot_connector = connector.clone_with(
            &snapshot_stage_name(&table),
            snapshot_uri,
            credentials.clone(),
        )?;
        snapshot_connector.set_operation_timeout(operation_timeout);
        let mut increment_connector = connector.clone_with(
            &increment_stage_name(&table),
            increment_uri.clone(),
            credentials.clone(),
        )?;
        increment_connector.set_operation_timeout(operation_timeout);

        let increment_store = staging.at(INCREMENT_SUBPATH);
        let exporter = SnapshotExporter::new(
            source.clone(),
            staging.at(SNAPSHOT_SUBPATH),
            config.snapshot_concurrency,
        )
        .with_operation_timeout(operation_timeout);

        Ok(Self {
            reader: IncrementReader::new(increment_store.clone(), table.clone()),
            checkpoints: CheckpointStore::new(increment_store),
            table,
            mode: config.mode,
            config: config.clone(),
            phase: ReplicationPhase::Idle,
            source,
            snapshot_connector,
            increment_connector,
            exporter,
            increment_uri,
            changefeed,
            checkpoint: None,
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn phase(&self) -> ReplicationPhase {
        self.phase
    }

    pub fn snapshot_connector(&self) -> &C {
        &self.snapshot_connector
    }

    pub fn increment_connector(&self) -> &C {
        &self.increment_connector
    }

    /// Position of the last merged change batch.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.operation_timeout_ms)
    }

    fn advance(&mut self) -> SyncResult<ReplicationPhase> {
        let next = next_phase(self.mode, self.phase)?;
        info!(table = %self.table, from = %self.phase, to = %next, "replication phase changed");
        self.phase = next;

        Ok(next)
    }

    /// Runs every phase of the mode until the run finishes, fails or `shutdown` is requested.
    ///
    /// Connectors are closed whatever the outcome.
    pub async fn run(&mut self, shutdown: ShutdownRx) -> SyncResult<ReplicationPhase> {
        let span = info_span!("replication", table = %self.table, mode = %self.mode);
        let result = self.run_phases(shutdown).instrument(span).await;

        self.snapshot_connector.close().await;
        self.increment_connector.close().await;

        result
    }

    async fn run_phases(&mut self, mut shutdown: ShutdownRx) -> SyncResult<ReplicationPhase> {
        while self.phase != ReplicationPhase::Finished {
            if shutdown.is_shutdown() {
                info!(phase = %self.phase, "shutdown requested, stopping replication");
                return Ok(self.phase);
            }

            match self.advance()? {
                ReplicationPhase::CopyingSchema => self.copy_schema().await?,
                ReplicationPhase::SnapshotExporting => {
                    let (snapshot_ts, export) = self.export_snapshot().await?;
                    info!(
                        snapshot_ts,
                        files = export.files.len(),
                        rows = export.rows,
                        "snapshot exported"
                    );
                }
                ReplicationPhase::SnapshotLoading => {
                    self.load_snapshot().await?;
                }
                ReplicationPhase::IncrementalConsuming => self.consume(&mut shutdown).await?,
                ReplicationPhase::Idle | ReplicationPhase::Finished => {}
            }
        }

        info!("replication finished");

        Ok(self.phase)
    }

    /// Creates the warehouse table from the source table and forgets any checkpoint, the
    /// incremental path restarts from the new snapshot.
    pub async fn copy_schema(&mut self) -> SyncResult<()> {
        let deadline = self.operation_timeout();

        with_timeout(
            deadline,
            "copy_table_schema",
            self.snapshot_connector
                .copy_table_schema(self.source.as_ref(), &self.table),
        )
        .await?;

        with_timeout(deadline, "clear_checkpoint", self.checkpoints.clear(&self.table)).await?;
        self.checkpoint = None;

        Ok(())
    }

    /// Exports the table as of the current source timestamp.
    ///
    /// In full mode with a managed changefeed, the changefeed is recreated at that same
    /// timestamp before any row is read, after the change batches of earlier runs are removed.
    pub async fn export_snapshot(&mut self) -> SyncResult<(SourceTs, SnapshotExport)> {
        let deadline = self.operation_timeout();

        let snapshot_ts = with_timeout(deadline, "current_ts", self.source.current_ts()).await?;
        info!(table = %self.table, snapshot_ts, "snapshot timestamp allocated");

        if let (ReplicationMode::Full, Some(changefeed)) = (self.mode, &self.changefeed) {
            hand_off_changefeed(
                changefeed,
                self.reader.store(),
                &self.increment_uri,
                &self.table,
                snapshot_ts,
                deadline,
            )
            .await?;
        }

        // Each source query and shard write has its own deadline inside the export.
        let columns = self.snapshot_connector.columns().to_vec();
        let export = self
            .exporter
            .export(&self.table, &columns, Some(snapshot_ts))
            .await?;

        Ok((snapshot_ts, export))
    }

    /// Loads the exported shards and hands the resulting columns to the incremental connector.
    pub async fn load_snapshot(&mut self) -> SyncResult<u64> {
        let table = self.table.clone();
        let target_table = self.table.name.clone();
        let file_prefix = self.table.snapshot_file_prefix();

        let rows = self
            .snapshot_connector
            .load_snapshot(&target_table, &file_prefix, |rows| {
                debug!(%table, rows, "snapshot load progress");
            })
            .await?;

        info!(table = %self.table, rows, connector = C::name(), "snapshot loaded");

        let columns = self.snapshot_connector.columns().to_vec();
        if !columns.is_empty() {
            self.increment_connector.init_schema(columns).await?;
        }

        Ok(rows)
    }

    /// Scans the incremental location once and applies every pending batch.
    ///
    /// Returns the number of merged batches.
    pub async fn consume_pending(&mut self) -> SyncResult<usize> {
        let pending = self.pending().await?;
        let mut applied = 0;
        for version in &pending {
            applied += self.apply_version(version, None).await?;
        }

        Ok(applied)
    }

    /// Applies change batches until shutdown is requested, polling the incremental location
    /// while it has nothing pending.
    async fn consume(&mut self, shutdown: &mut ShutdownRx) -> SyncResult<()> {
        loop {
            let pending = match self.wait_for_batches(shutdown).await? {
                ShutdownResult::Ok(pending) => pending,
                ShutdownResult::Shutdown(()) => return Ok(()),
            };

            for version in &pending {
                self.apply_version(version, Some(&*shutdown)).await?;
                if shutdown.is_shutdown() {
                    info!(table = %self.table, "shutdown requested, stopping at a batch boundary");
                    return Ok(());
                }
            }
        }
    }

    async fn wait_for_batches(
        &mut self,
        shutdown: &mut ShutdownRx,
    ) -> SyncResult<ShutdownResult<Vec<VersionBatches>, ()>> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown.is_shutdown() {
                return Ok(ShutdownResult::Shutdown(()));
            }

            let pending = self.pending().await?;
            if !pending.is_empty() {
                return Ok(ShutdownResult::Ok(pending));
            }

            debug!(table = %self.table, "no pending change batches");
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => return Ok(ShutdownResult::Shutdown(())),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Pending versions after the checkpoint, initializing the incremental connector's columns
    /// on first use.
    async fn pending(&mut self) -> SyncResult<Vec<VersionBatches>> {
        let deadline = self.operation_timeout();

        if self.checkpoint.is_none() {
            self.checkpoint =
                with_timeout(deadline, "load_checkpoint", self.checkpoints.load(&self.table))
                    .await?;
        }

        let pending = with_timeout(
            deadline,
            "list_change_batches",
            self.reader.pending(self.checkpoint.as_ref()),
        )
        .await?;

        if self.increment_connector.columns().is_empty() {
            self.init_increment_schema(&pending).await?;
        }

        Ok(pending)
    }

    /// Starts from the columns of the checkpointed version, or of the first pending one.
    async fn init_increment_schema(&mut self, pending: &[VersionBatches]) -> SyncResult<()> {
        let definition = match &self.checkpoint {
            Some(checkpoint) => {
                let version = checkpoint.table_version;
                let definition = with_timeout(
                    self.operation_timeout(),
                    "read_schema",
                    self.reader.definition(version),
                )
                .await?;

                Some(definition.ok_or_else(|| {
                    sync_error!(
                        ErrorKind::InvalidData,
                        "Checkpointed table version has no schema file",
                        format!("{} version {version}", self.table)
                    )
                })?)
            }
            None => pending.first().map(|version| version.definition.clone()),
        };

        if let Some(definition) = definition {
            info!(
                table = %self.table,
                table_version = definition.table_version,
                "initializing incremental columns from the change stream"
            );
            self.increment_connector
                .init_schema(definition.columns.clone())
                .await?;
        }

        Ok(())
    }

    /// Applies the DDL of `version`, then merges its batches in order, saving the checkpoint
    /// after each one. Stops at a batch boundary once `shutdown` is requested.
    ///
    /// Reaching a new table version is checkpointed as soon as its DDL is applied, so a restart
    /// never issues the same DDL twice.
    async fn apply_version(
        &mut self,
        version: &VersionBatches,
        shutdown: Option<&ShutdownRx>,
    ) -> SyncResult<usize> {
        let table = self.table.to_string();
        let retry_config = self.config.batch_retry.clone();
        let definition = version.definition.clone();

        let mut retry = Retry::new(&retry_config, &table, "exec_ddl");
        loop {
            match self.increment_connector.exec_ddl(&definition).await {
                Ok(()) => break,
                Err(err) => retry.backoff(err).await?,
            }
        }

        let reached = self
            .checkpoint
            .as_ref()
            .is_none_or(|checkpoint| checkpoint.table_version < version.table_version());
        if reached {
            self.save_checkpoint(Checkpoint::new(version.table_version(), None))
                .await?;
        }

        let mut applied = 0;
        for file in &version.files {
            if shutdown.is_some_and(ShutdownRx::is_shutdown) {
                break;
            }

            let started = Instant::now();
            let mut retry = Retry::new(&retry_config, &table, "load_increment");
            loop {
                match self.merge_batch(&definition, file).await {
                    Ok(()) => break,
                    Err(err) => retry.backoff(err).await?,
                }
            }

            #[cfg(feature = "failpoints")]
            sync_fail_point(INCREMENTAL__AFTER_MERGE)?;

            self.save_checkpoint(Checkpoint::new(version.table_version(), Some(file.clone())))
                .await?;

            counter!(
                DWSYNC_BATCHES_APPLIED_TOTAL,
                TABLE_LABEL => table.clone(),
                CONNECTOR_LABEL => C::name()
            )
            .increment(1);
            histogram!(
                DWSYNC_BATCH_APPLY_DURATION_SECONDS,
                TABLE_LABEL => table.clone(),
                PHASE_LABEL => ReplicationPhase::IncrementalConsuming.as_str()
            )
            .record(started.elapsed().as_secs_f64());
            debug!(%table, file = %file, "change batch applied");

            applied += 1;
        }

        if applied < version.files.len() {
            warn!(
                %table,
                table_version = version.table_version(),
                applied,
                pending = version.files.len() - applied,
                "stopped before the end of the table version"
            );
        }

        Ok(applied)
    }

    /// Stages and merges one batch; the connector bounds each of its warehouse calls.
    async fn merge_batch(&mut self, definition: &TableDefinition, file: &str) -> SyncResult<()> {
        #[cfg(feature = "failpoints")]
        sync_fail_point(INCREMENTAL__BEFORE_MERGE)?;

        self.increment_connector
            .load_increment(definition, &self.increment_uri, file)
            .await
            .map_err(|err| err.context(format!("load_increment {file}")))
    }

    async fn save_checkpoint(&mut self, checkpoint: Checkpoint) -> SyncResult<()> {
        with_timeout(
            self.operation_timeout(),
            "save_checkpoint",
            self.checkpoints.save(&self.table, &checkpoint),
        )
        .await?;

        gauge!(DWSYNC_APPLIED_TABLE_VERSION, TABLE_LABEL => self.table.to_string())
            .set(checkpoint.table_version as f64);
        self.checkpoint = Some(checkpoint);

        Ok(())
    }
}
