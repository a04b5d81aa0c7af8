//! Parallel export of a table snapshot to staging storage.
//!
//! The table is split into disjoint shards. Each shard is read by its own worker, on its own
//! source connection, and written to its own object named after the table and shard index,
//! so the union of the objects is the table as of the snapshot timestamp.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dwsync_config::shared::ReplicationConfig;
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::codec::encode_rows;
use crate::error::{ErrorKind, SyncResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{SNAPSHOT_EXPORT__BEFORE_SHARD_WRITE, sync_fail_point};
use crate::metrics::{
    DWSYNC_SNAPSHOT_EXPORT_DURATION_SECONDS, DWSYNC_SNAPSHOT_ROWS_EXPORTED_TOTAL,
    DWSYNC_SNAPSHOT_SHARDS_EXPORTED_TOTAL, TABLE_LABEL,
};
use crate::replication::retry::with_timeout;
use crate::source::{Shard, Source};
use crate::storage::StagingStore;
use crate::sync_error;
use crate::types::{SourceTs, TableColumn, TableName};

/// Outcome of a snapshot export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotExport {
    /// Written objects, relative to the snapshot root, in shard order.
    pub files: Vec<String>,
    pub rows: u64,
}

/// Exports tables from a [`Source`] into a snapshot staging location.
#[derive(Debug)]
pub struct SnapshotExporter<S> {
    source: Arc<S>,
    store: StagingStore,
    concurrency: usize,
    operation_timeout: Duration,
}

impl<S> SnapshotExporter<S>
where
    S: Source + 'static,
{
    /// `store` is rooted at the snapshot location; at most `concurrency` shards are read at once.
    pub fn new(source: Arc<S>, store: StagingStore, concurrency: u16) -> Self {
        Self {
            source,
            store,
            concurrency: usize::from(concurrency.max(1)),
            operation_timeout: Duration::from_millis(
                ReplicationConfig::DEFAULT_OPERATION_TIMEOUT_MS,
            ),
        }
    }

    /// Deadline of each source query and storage call, not of the whole export.
    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    pub fn store(&self) -> &StagingStore {
        &self.store
    }

    /// Exports `table` as of `snapshot_ts`, or as of now when `None`.
    ///
    /// Objects left by a previous export of the same table are removed first, so a later load
    /// only sees this export. An empty table produces no objects. The first failing worker
    /// aborts the others.
    pub async fn export(
        &self,
        table: &TableName,
        columns: &[TableColumn],
        snapshot_ts: Option<SourceTs>,
    ) -> SyncResult<SnapshotExport> {
        let started = Instant::now();
        let deadline = self.operation_timeout;
        let prefix = table.snapshot_file_prefix();

        let stale_files = with_timeout(
            deadline,
            "list_snapshot",
            self.store.list_with_name_prefix("", &prefix),
        )
        .await?;
        for stale in stale_files {
            debug!(%table, file = %stale, "removing stale snapshot shard");
            with_timeout(deadline, "delete_snapshot", self.store.delete(&stale)).await?;
        }

        let shards = with_timeout(
            deadline,
            "plan_shards",
            self.source
                .plan_shards(table, columns, self.concurrency, snapshot_ts),
        )
        .await?;
        if shards.is_empty() {
            info!(%table, "source table is empty, no snapshot shards written");
            return Ok(SnapshotExport {
                files: Vec::new(),
                rows: 0,
            });
        }

        info!(
            %table,
            shards = shards.len(),
            concurrency = self.concurrency,
            snapshot_ts,
            "starting snapshot export"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let columns = Arc::new(columns.to_vec());
        let mut join_set = JoinSet::new();

        for shard in shards {
            let permit = semaphore.clone().acquire_owned().await.map_err(|err| {
                sync_error!(
                    ErrorKind::InvalidState,
                    "Could not acquire a snapshot worker slot",
                    err.to_string()
                )
            })?;

            let source = self.source.clone();
            let store = self.store.clone();
            let table = table.clone();
            let columns = columns.clone();

            join_set.spawn(async move {
                let result = export_shard(
                    source.as_ref(),
                    &store,
                    &table,
                    &columns,
                    &shard,
                    snapshot_ts,
                    deadline,
                )
                .await
                .map_err(|err| err.context(format!("snapshot shard {}", shard.index)));

                drop(permit);

                result
            });
        }

        let mut exported = Vec::new();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(Some(shard))) => exported.push(shard),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    error!(%table, error = %err, "snapshot shard export failed");
                    join_set.abort_all();

                    return Err(err);
                }
                Err(join_err) => {
                    error!(%table, error = %join_err, "snapshot worker panicked");
                    join_set.abort_all();

                    return Err(sync_error!(
                        ErrorKind::SnapshotWorkerPanic,
                        "A snapshot worker panicked, aborting all",
                        join_err.to_string()
                    ));
                }
            }
        }

        exported.sort_by_key(|(index, _, _)| *index);
        let rows: u64 = exported.iter().map(|(_, _, rows)| rows).sum();
        let files = exported.into_iter().map(|(_, file, _)| file).collect::<Vec<_>>();

        histogram!(DWSYNC_SNAPSHOT_EXPORT_DURATION_SECONDS, TABLE_LABEL => table.to_string())
            .record(started.elapsed().as_secs_f64());
        info!(%table, files = files.len(), rows, "snapshot export completed");

        Ok(SnapshotExport { files, rows })
    }
}

/// Reads one shard and writes it, each within `deadline`. A shard without rows writes nothing.
async fn export_shard<S: Source>(
    source: &S,
    store: &StagingStore,
    table: &TableName,
    columns: &[TableColumn],
    shard: &Shard,
    snapshot_ts: Option<SourceTs>,
    deadline: Duration,
) -> SyncResult<Option<(usize, String, u64)>> {
    let rows = with_timeout(
        deadline,
        "read_shard",
        source.read_shard(table, columns, shard, snapshot_ts),
    )
    .await?;
    if rows.is_empty() {
        debug!(%table, shard = shard.index, "snapshot shard is empty");
        return Ok(None);
    }

    let data = encode_rows(&rows)?;

    #[cfg(feature = "failpoints")]
    sync_fail_point(SNAPSHOT_EXPORT__BEFORE_SHARD_WRITE)?;

    let file = shard.file_name(table);
    with_timeout(deadline, "write_shard", store.put(&file, Bytes::from(data))).await?;

    let count = rows.len() as u64;
    counter!(DWSYNC_SNAPSHOT_ROWS_EXPORTED_TOTAL, TABLE_LABEL => table.to_string()).increment(count);
    counter!(DWSYNC_SNAPSHOT_SHARDS_EXPORTED_TOTAL, TABLE_LABEL => table.to_string()).increment(1);
    debug!(%table, shard = shard.index, rows = count, %file, "snapshot shard written");

    Ok(Some((shard.index, file, count)))
}
