//! Replication of distributed SQL tables into column-store warehouses.
//!
//! Tables are copied through object storage: a parallel snapshot export first, then the change
//! batches written by the CDC service, merged by primary key. See [`replication`] for the run
//! loop and [`connector`] for the warehouse side.

pub mod cdc;
pub mod codec;
pub mod concurrency;
pub mod connector;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod increment;
mod macros;
pub mod merge;
pub mod metrics;
pub mod policy;
pub mod replication;
pub mod schema;
pub mod snapshot;
pub mod source;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
