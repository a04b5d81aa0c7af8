//! Coordination primitives shared by the replication tasks.
//!
//! The [`shutdown`] module broadcasts a stop request to every task replicating a table. Tasks
//! observe it only at batch boundaries, so a batch is either fully applied or not started.

pub mod shutdown;
