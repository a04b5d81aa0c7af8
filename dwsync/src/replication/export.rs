use std::sync::Arc;
use std::time::Duration;

use dwsync_config::shared::{ReplicationConfig, ReplicationMode};
use tracing::{Instrument, info, info_span, warn};

use crate::bail;
use crate::cdc::ChangefeedClient;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, SyncResult};
use crate::replication::phase::ReplicationPhase;
use crate::replication::retry::with_timeout;
use crate::snapshot::{SnapshotExport, SnapshotExporter};
use crate::source::Source;
use crate::storage::{
    INCREMENT_SUBPATH, SNAPSHOT_SUBPATH, StagingStore, StorageUri, derive_paths,
};
use crate::types::{SourceTs, TableName};

/// Removes the change batches of earlier runs, then recreates the changefeed of `table` at
/// `snapshot_ts` so the incremental path starts exactly where the snapshot ends.
pub(crate) async fn hand_off_changefeed(
    changefeed: &ChangefeedClient,
    increment: &StagingStore,
    increment_uri: &StorageUri,
    table: &TableName,
    snapshot_ts: SourceTs,
    deadline: Duration,
) -> SyncResult<()> {
    let stale = with_timeout(
        deadline,
        "list_increment",
        increment.list(&table.storage_path()),
    )
    .await?;
    for file in &stale {
        with_timeout(deadline, "delete_increment", increment.delete(file)).await?;
    }
    if !stale.is_empty() {
        info!(%table, files = stale.len(), "removed change batches of a previous run");
    }

    with_timeout(
        deadline,
        "create_changefeed",
        changefeed.recreate(table, increment_uri, snapshot_ts),
    )
    .await?;

    Ok(())
}

/// Export of one table to staging storage, with no warehouse behind it.
///
/// The snapshot is written as of a fresh source timestamp. In full mode the changefeed is then
/// recreated at that timestamp, so the staging location ends up holding everything a loader
/// needs: the snapshot shards plus the change stream continuing them. Nothing is loaded or
/// merged.
#[derive(Debug)]
pub struct StorageExport<S> {
    table: TableName,
    mode: ReplicationMode,
    phase: ReplicationPhase,
    source: Arc<S>,
    exporter: SnapshotExporter<S>,
    increment: StagingStore,
    increment_uri: StorageUri,
    changefeed: Option<ChangefeedClient>,
    operation_timeout: Duration,
}

impl<S> StorageExport<S>
where
    S: Source + 'static,
{
    /// Only the full and snapshot-only modes produce a snapshot, the others are rejected.
    pub fn new(
        table: TableName,
        source: Arc<S>,
        staging: &StagingStore,
        config: &ReplicationConfig,
        changefeed: Option<ChangefeedClient>,
    ) -> SyncResult<Self> {
        if !matches!(
            config.mode,
            ReplicationMode::Full | ReplicationMode::SnapshotOnly
        ) {
            bail!(
                ErrorKind::ConfigError,
                "Storage-only export needs a mode that exports a snapshot",
                format!("{} mode for {table}", config.mode)
            );
        }

        let (_, increment_uri) = derive_paths(staging.root());
        let operation_timeout = Duration::from_millis(config.operation_timeout_ms);
        let exporter = SnapshotExporter::new(
            source.clone(),
            staging.at(SNAPSHOT_SUBPATH),
            config.snapshot_concurrency,
        )
        .with_operation_timeout(operation_timeout);

        Ok(Self {
            table,
            mode: config.mode,
            phase: ReplicationPhase::Idle,
            source,
            exporter,
            increment: staging.at(INCREMENT_SUBPATH),
            increment_uri,
            changefeed,
            operation_timeout,
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn phase(&self) -> ReplicationPhase {
        self.phase
    }

    /// Exports the table unless `shutdown` was already requested.
    pub async fn run(&mut self, shutdown: ShutdownRx) -> SyncResult<ReplicationPhase> {
        if shutdown.is_shutdown() {
            info!(table = %self.table, "shutdown requested, skipping export");
            return Ok(self.phase);
        }

        let span = info_span!("storage_export", table = %self.table, mode = %self.mode);
        self.run_export().instrument(span).await
    }

    async fn run_export(&mut self) -> SyncResult<ReplicationPhase> {
        self.phase = ReplicationPhase::SnapshotExporting;
        let (snapshot_ts, export) = self.export().await?;
        info!(
            snapshot_ts,
            files = export.files.len(),
            rows = export.rows,
            "snapshot exported to storage"
        );

        self.phase = ReplicationPhase::Finished;

        Ok(self.phase)
    }

    pub async fn export(&self) -> SyncResult<(SourceTs, SnapshotExport)> {
        let deadline = self.operation_timeout;

        let columns = with_timeout(
            deadline,
            "table_columns",
            self.source.table_columns(&self.table),
        )
        .await?;
        let snapshot_ts = with_timeout(deadline, "current_ts", self.source.current_ts()).await?;
        info!(table = %self.table, snapshot_ts, "snapshot timestamp allocated");

        if self.mode == ReplicationMode::Full {
            match &self.changefeed {
                Some(changefeed) => {
                    hand_off_changefeed(
                        changefeed,
                        &self.increment,
                        &self.increment_uri,
                        &self.table,
                        snapshot_ts,
                        deadline,
                    )
                    .await?
                }
                None => warn!(
                    table = %self.table,
                    "no changefeed configured, exporting the snapshot only"
                ),
            }
        }

        let export = self
            .exporter
            .export(&self.table, &columns, Some(snapshot_ts))
            .await?;

        Ok((snapshot_ts, export))
    }
}
