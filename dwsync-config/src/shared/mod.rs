//! Shared configuration types for the replicator and the replication engine.

mod base;
mod changefeed;
mod replication;
mod replicator;
mod source;
mod storage;
mod warehouse;

pub use base::ValidationError;
pub use changefeed::ChangefeedConfig;
pub use replication::{ReplicationConfig, ReplicationMode, RetryConfig};
pub use replicator::ReplicatorConfig;
pub use source::{IntoConnectOptions, TiDbConnectionConfig, TlsConfig};
pub use storage::{StorageConfig, StorageCredentialsConfig};
pub use warehouse::{RedshiftConnectionConfig, WarehouseConfig};
