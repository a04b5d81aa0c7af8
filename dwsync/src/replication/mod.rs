//! Per-table replication: the phase machine and the run loop driving the connectors, plus the
//! storage-only export that stops after the snapshot.

mod export;
mod orchestrator;
mod phase;
pub(crate) mod retry;

pub use export::StorageExport;
pub use orchestrator::{TableReplication, increment_stage_name, snapshot_stage_name};
pub use phase::{ReplicationPhase, next_phase};
pub use retry::{Retry, backoff_delay, with_timeout};
