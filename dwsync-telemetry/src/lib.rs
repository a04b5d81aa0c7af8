//! Logging and metrics setup shared by the dwsync binaries and tests.

pub mod metrics;
pub mod tracing;

pub use crate::tracing::init_test_tracing;
