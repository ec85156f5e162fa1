//! Probe-count statistics for a hash index

use std::fmt;

/// Histogram of probe counts observed by inserts.
///
/// Slot `n` counts inserts that settled after inspecting `n` buckets. Inserts
/// that hit the probe limit are counted in `overflows` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeStats {
    histogram: Vec<u64>,
    overflows: u64,
    queries: u64,
}

impl ProbeStats {
    /// Create an empty histogram covering `1..=probe_limit`
    pub fn new(probe_limit: usize) -> Self {
        Self {
            histogram: vec![0; probe_limit + 1],
            overflows: 0,
            queries: 0,
        }
    }

    pub(crate) fn record(&mut self, probes: usize) {
        self.queries += 1;
        if let Some(slot) = self.histogram.get_mut(probes) {
            *slot += 1;
        }
    }

    pub(crate) fn record_overflow(&mut self) {
        self.queries += 1;
        self.overflows += 1;
    }

    /// Total insert attempts, successful or not
    pub fn queries(&self) -> u64 {
        self.queries
    }

    /// Inserts that exceeded the probe limit
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Counts indexed by probe count
    pub fn histogram(&self) -> &[u64] {
        &self.histogram
    }

    /// Number of inserts that needed exactly `probes` probes
    pub fn count(&self, probes: usize) -> u64 {
        self.histogram.get(probes).copied().unwrap_or(0)
    }

    /// Longest successful probe sequence, if any insert succeeded
    pub fn max_probes(&self) -> Option<usize> {
        self.histogram.iter().rposition(|&count| count > 0)
    }

    /// Average probe count over successful inserts
    pub fn mean_probes(&self) -> f64 {
        let (total, weighted) = self
            .histogram
            .iter()
            .enumerate()
            .fold((0u64, 0u64), |(total, weighted), (probes, &count)| {
                (total + count, weighted + probes as u64 * count)
            });
        if total == 0 {
            0.0
        } else {
            weighted as f64 / total as f64
        }
    }
}

impl fmt::Display for ProbeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Probe Statistics:")?;
        writeln!(f, "  Queries: {}", self.queries)?;
        writeln!(f, "  Overflows: {}", self.overflows)?;
        writeln!(f, "  Mean probes: {:.2}", self.mean_probes())?;
        match self.max_probes() {
            Some(max) => writeln!(f, "  Max probes: {max}"),
            None => writeln!(f, "  Max probes: -"),
        }
    }
}
