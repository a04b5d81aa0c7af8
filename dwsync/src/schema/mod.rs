//! Schema synchronization between a known column set and a newly observed table definition.

mod diff;

pub use diff::{SchemaChange, diff};
