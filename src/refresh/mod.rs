//! Refresh: building, publishing and scheduling generations
//!
//! The [`RefreshCoordinator`] turns a data source scan into a published generation;
//! the [`RefreshWorker`] calls it for each table whenever the table's period
//! elapses.

mod coordinator;
mod stats;
mod worker;

pub use coordinator::{MemoryLimits, RefreshCoordinator, RefreshError, RefreshOutcome};
pub use stats::{RefreshSnapshot, RefreshStats};
pub use worker::{RefreshWorker, RefreshWorkerConfig, RefreshWorkerState};
