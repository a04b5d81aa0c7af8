use std::fmt;

use dwsync_config::shared::ReplicationMode;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Phase of the replication of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationPhase {
    Idle,
    CopyingSchema,
    SnapshotExporting,
    SnapshotLoading,
    IncrementalConsuming,
    Finished,
}

impl ReplicationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationPhase::Idle => "idle",
            ReplicationPhase::CopyingSchema => "copying_schema",
            ReplicationPhase::SnapshotExporting => "snapshot_exporting",
            ReplicationPhase::SnapshotLoading => "snapshot_loading",
            ReplicationPhase::IncrementalConsuming => "incremental_consuming",
            ReplicationPhase::Finished => "finished",
        }
    }
}

impl fmt::Display for ReplicationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase following `phase` in `mode`.
///
/// Incremental consumption ends only when shutdown is requested, after which the run is
/// finished. Any other pair has no successor and is an [`ErrorKind::InvalidState`].
pub fn next_phase(mode: ReplicationMode, phase: ReplicationPhase) -> SyncResult<ReplicationPhase> {
    use ReplicationMode::*;
    use ReplicationPhase::*;

    let next = match (mode, phase) {
        (Full | SnapshotOnly | Cloud, Idle) => CopyingSchema,
        (IncrementalOnly, Idle) => IncrementalConsuming,

        (Full | SnapshotOnly, CopyingSchema) => SnapshotExporting,
        (Cloud, CopyingSchema) => SnapshotLoading,

        (Full | SnapshotOnly, SnapshotExporting) => SnapshotLoading,

        (Full | Cloud, SnapshotLoading) => IncrementalConsuming,
        (SnapshotOnly, SnapshotLoading) => Finished,

        (Full | Cloud | IncrementalOnly, IncrementalConsuming) => Finished,

        (mode, phase) => bail!(
            ErrorKind::InvalidState,
            "Replication phase has no successor in this mode",
            format!("{phase} in {mode} mode")
        ),
    };

    Ok(next)
}
