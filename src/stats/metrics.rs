//! Request counters for the lookup service

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::status::Status;

/// Counters updated on every request
#[derive(Debug)]
pub struct ServiceStats {
    /// Fetch requests served
    pub fetches: AtomicU64,
    /// Fetches that found the key
    pub hits: AtomicU64,
    /// Fetches that missed
    pub misses: AtomicU64,
    /// Fetches against an unbuilt index
    pub unavailable: AtomicU64,
    /// Requests naming an unknown or unloaded table
    pub unknown_table: AtomicU64,
    /// Malformed requests
    pub bad_requests: AtomicU64,
    /// Responses replaced because they exceeded the size limit
    pub too_large: AtomicU64,
    /// Stats and describe requests
    pub admin_requests: AtomicU64,
    /// Connections accepted
    pub connections_opened: AtomicU64,
    /// Connections finished
    pub connections_closed: AtomicU64,
    /// Response bytes written
    pub bytes_sent: AtomicU64,
    started: Instant,
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self {
            fetches: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            unavailable: AtomicU64::new(0),
            unknown_table: AtomicU64::new(0),
            bad_requests: AtomicU64::new(0),
            too_large: AtomicU64::new(0),
            admin_requests: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl ServiceStats {
    /// Create new counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a fetch
    pub fn record_fetch(&self, status: Status) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            Status::Ok => &self.hits,
            Status::NotFound => &self.misses,
            Status::UnavailableIndex => &self.unavailable,
            Status::UnknownTable => &self.unknown_table,
            Status::BadRequest => &self.bad_requests,
            Status::TooLarge => &self.too_large,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stats or describe request
    pub fn record_admin(&self) {
        self.admin_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a malformed request
    pub fn record_bad_request(&self) {
        self.bad_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a response replaced by `TooLarge`
    pub fn record_too_large(&self) {
        self.too_large.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted connection
    pub fn record_connection_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished connection
    pub fn record_connection_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes written to a client
    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Time since the counters were created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Copy the counters into a plain struct
    pub fn snapshot(&self) -> ServiceSnapshot {
        let fetches = self.fetches.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        ServiceSnapshot {
            uptime_secs: self.uptime().as_secs(),
            fetches,
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            unknown_table: self.unknown_table.load(Ordering::Relaxed),
            bad_requests: self.bad_requests.load(Ordering::Relaxed),
            too_large: self.too_large.load(Ordering::Relaxed),
            admin_requests: self.admin_requests.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            hit_rate: if fetches == 0 {
                0.0
            } else {
                hits as f64 / fetches as f64
            },
        }
    }
}

/// Point-in-time copy of [`ServiceStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    /// Seconds since start
    pub uptime_secs: u64,
    /// Fetch requests
    pub fetches: u64,
    /// Fetch hits
    pub hits: u64,
    /// Fetch misses
    pub misses: u64,
    /// Fetches against unbuilt indexes
    pub unavailable: u64,
    /// Requests naming unknown tables
    pub unknown_table: u64,
    /// Malformed requests
    pub bad_requests: u64,
    /// Oversized responses
    pub too_large: u64,
    /// Stats and describe requests
    pub admin_requests: u64,
    /// Connections accepted
    pub connections_opened: u64,
    /// Connections finished
    pub connections_closed: u64,
    /// Response bytes written
    pub bytes_sent: u64,
    /// hits / fetches
    pub hit_rate: f64,
}

impl ServiceSnapshot {
    /// Connections currently open
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}
