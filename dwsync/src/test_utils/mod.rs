//! Helpers for tests of the replication engine.
//!
//! Everything runs in memory: [`crate::source::MemorySource`] stands in for the source cluster,
//! `memory://` staging URIs share named in-memory object stores, and
//! [`crate::connector::memory::MemoryWarehouse`] records what reached the warehouse.

#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod replication;
pub mod staging;
pub mod table;
