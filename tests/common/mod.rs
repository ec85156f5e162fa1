//! Shared test utilities for refresh and fault injection tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use rowcache::source::{DataSource, RowSink, ScanSummary, SourceError};
use rowcache::table::{BuildError, TableSpec};

/// A fault-injection wrapper around any `DataSource`.
///
/// Allows deterministic injection of:
/// - a malformed row at a given position of the next scan
/// - an unreachable source on the next count or scan
/// - a per-row delay, to keep builds in flight
pub struct FaultInjectionSource<S> {
    inner: S,
    /// Total number of scans started.
    scan_count: AtomicU64,
    /// When non-zero, the Nth row (1-based) of the next scan fails.
    fail_at_row: AtomicU64,
    /// When true, the next `count_rows` call fails.
    fail_next_count: AtomicBool,
    /// When true, the next `scan` fails before delivering any row.
    fail_next_scan: AtomicBool,
    /// Delay before each delivered row, in microseconds.
    row_delay_us: AtomicU64,
}

impl<S: DataSource> FaultInjectionSource<S> {
    /// Wrap an existing source for fault injection.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            scan_count: AtomicU64::new(0),
            fail_at_row: AtomicU64::new(0),
            fail_next_count: AtomicBool::new(false),
            fail_next_scan: AtomicBool::new(false),
            row_delay_us: AtomicU64::new(0),
        }
    }

    /// Wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Make the Nth row (1-based) of the next scan fail as malformed.
    pub fn inject_malformed_row(&self, row: u64) {
        self.fail_at_row.store(row, Ordering::SeqCst);
    }

    /// Make the next `count_rows` call fail.
    pub fn inject_count_error(&self) {
        self.fail_next_count.store(true, Ordering::SeqCst);
    }

    /// Make the next `scan` call fail.
    pub fn inject_scan_error(&self) {
        self.fail_next_scan.store(true, Ordering::SeqCst);
    }

    /// Sleep for `delay` before delivering each row.
    pub fn set_row_delay(&self, delay: Duration) {
        self.row_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Return the total number of scans started.
    pub fn scan_count(&self) -> u64 {
        self.scan_count.load(Ordering::SeqCst)
    }
}

impl<S: DataSource> DataSource for FaultInjectionSource<S> {
    fn count_rows(&self, spec: &TableSpec) -> Result<u64, SourceError> {
        if self.fail_next_count.swap(false, Ordering::SeqCst) {
            return Err(SourceError::Unavailable("injected count failure".into()));
        }
        self.inner.count_rows(spec)
    }

    fn scan(&self, spec: &TableSpec, sink: &mut RowSink<'_>) -> Result<ScanSummary, BuildError> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_scan.swap(false, Ordering::SeqCst) {
            return Err(SourceError::Unavailable("injected scan failure".into()).into());
        }

        let fail_at = self.fail_at_row.swap(0, Ordering::SeqCst);
        let delay = Duration::from_micros(self.row_delay_us.load(Ordering::SeqCst));
        let mut delivered = 0u64;
        self.inner.scan(spec, &mut |row| {
            delivered += 1;
            if delivered == fail_at {
                return Err(SourceError::Malformed {
                    row: delivered - 1,
                    message: "injected malformed field".into(),
                }
                .into());
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            sink(row)
        })
    }

    fn name(&self) -> &str {
        "fault-injection"
    }
}
