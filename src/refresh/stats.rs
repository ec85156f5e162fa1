//! Refresh statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::table::BuildError;
use crate::utility::unix_now_secs;

/// Counters for the refresh cycles of one table
#[derive(Debug, Default)]
pub struct RefreshStats {
    /// Builds started
    pub attempts: AtomicU64,
    /// Builds published
    pub successes: AtomicU64,
    /// Builds aborted by the data source
    pub source_failures: AtomicU64,
    /// Builds aborted by an index running out of probes
    pub overflow_failures: AtomicU64,
    /// Builds aborted by arena limits or allocation failure
    pub memory_failures: AtomicU64,
    /// Builds aborted for any other reason
    pub other_failures: AtomicU64,
    /// Rows loaded by successful builds
    pub rows_loaded: AtomicU64,
    /// Duration of the last successful build in milliseconds
    pub last_duration_ms: AtomicU64,
    /// Unix time of the last successful build
    pub last_success_time: AtomicU64,
}

impl RefreshStats {
    /// Create new statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a published build
    pub fn record_success(&self, rows: u64, duration: Duration) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.rows_loaded.fetch_add(rows, Ordering::Relaxed);
        self.last_duration_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
        self.last_success_time
            .store(unix_now_secs(), Ordering::Relaxed);
    }

    /// Record an aborted build
    pub fn record_failure(&self, err: &BuildError) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match err {
            BuildError::Source(_) | BuildError::KeyCount { .. } => &self.source_failures,
            _ if err.is_probe_limit() => &self.overflow_failures,
            _ if err.is_memory() => &self.memory_failures,
            _ => &self.other_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Total failed builds
    pub fn failures(&self) -> u64 {
        self.source_failures.load(Ordering::Relaxed)
            + self.overflow_failures.load(Ordering::Relaxed)
            + self.memory_failures.load(Ordering::Relaxed)
            + self.other_failures.load(Ordering::Relaxed)
    }

    /// Get the success rate
    pub fn success_rate(&self) -> f64 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 1.0;
        }
        self.successes.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    /// Copy the counters into a plain struct
    pub fn snapshot(&self) -> RefreshSnapshot {
        RefreshSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures(),
            overflow_failures: self.overflow_failures.load(Ordering::Relaxed),
            rows_loaded: self.rows_loaded.load(Ordering::Relaxed),
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
            last_success_time: self.last_success_time.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RefreshStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSnapshot {
    /// Builds started
    pub attempts: u64,
    /// Builds published
    pub successes: u64,
    /// Builds aborted
    pub failures: u64,
    /// Builds aborted by index overflow
    pub overflow_failures: u64,
    /// Rows loaded by successful builds
    pub rows_loaded: u64,
    /// Duration of the last successful build in milliseconds
    pub last_duration_ms: u64,
    /// Unix time of the last successful build
    pub last_success_time: u64,
}
