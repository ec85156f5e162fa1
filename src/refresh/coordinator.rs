//! Refresh coordinator
//!
//! Builds new generations from the data source and publishes them. A failed build
//! is dropped and the table keeps serving its previous generation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::arena::{Arena, DEFAULT_ARENA_CAPACITY, MAX_ARENA_CAPACITY};
use crate::refresh::stats::{RefreshSnapshot, RefreshStats};
use crate::source::{DataSource, SnapshotSink, SourceError, SourceRow};
use crate::table::{
    BuildError, Generation, GenerationBuilder, TableEntry, TableId, TableRegistry, TableSpec,
};

/// Memory bounds applied to every generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Initial arena capacity in bytes
    pub arena_initial_bytes: usize,
    /// Arena growth limit in bytes
    pub arena_max_bytes: usize,
    /// Largest bucket array one index may allocate, in bytes
    pub index_max_bytes: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            arena_initial_bytes: DEFAULT_ARENA_CAPACITY,
            arena_max_bytes: MAX_ARENA_CAPACITY,
            index_max_bytes: usize::MAX,
        }
    }
}

/// A refresh that did not publish
#[derive(Debug, thiserror::Error)]
#[error("refresh of table {table:?} failed: {source}")]
pub struct RefreshError {
    /// Table name
    pub table: String,
    /// What went wrong
    #[source]
    pub source: BuildError,
}

/// A published refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Table refreshed
    pub table: TableId,
    /// Sequence of the new generation
    pub sequence: u64,
    /// Rows loaded
    pub rows: u64,
    /// Build time
    pub duration: Duration,
    /// Sequence of the generation it replaced
    pub retired: Option<u64>,
}

/// Releases a table's build claim when dropped
struct BuildClaim<'a>(&'a TableEntry);

impl Drop for BuildClaim<'_> {
    fn drop(&mut self) {
        self.0.end_build();
    }
}

/// Drives builds and publication for every table of a registry
pub struct RefreshCoordinator<S: DataSource> {
    registry: Arc<TableRegistry>,
    source: S,
    limits: MemoryLimits,
    stats: Vec<RefreshStats>,
}

impl<S: DataSource> RefreshCoordinator<S> {
    /// Create a coordinator loading `registry`'s tables from `source`.
    pub fn new(registry: Arc<TableRegistry>, source: S) -> Self {
        let stats = registry.iter().map(|_| RefreshStats::new()).collect();
        Self {
            registry,
            source,
            limits: MemoryLimits::default(),
            stats,
        }
    }

    /// Use custom arena limits.
    pub fn with_memory_limits(mut self, limits: MemoryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Registry being refreshed
    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Data source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Refresh counters of one table
    pub fn stats(&self, table: TableId) -> Option<&RefreshStats> {
        self.stats.get(table as usize)
    }

    /// Counters summed over every table
    pub fn totals(&self) -> RefreshSnapshot {
        self.stats
            .iter()
            .map(RefreshStats::snapshot)
            .fold(RefreshSnapshot::default(), |total, table| RefreshSnapshot {
                attempts: total.attempts + table.attempts,
                successes: total.successes + table.successes,
                failures: total.failures + table.failures,
                overflow_failures: total.overflow_failures + table.overflow_failures,
                rows_loaded: total.rows_loaded + table.rows_loaded,
                last_duration_ms: total.last_duration_ms.max(table.last_duration_ms),
                last_success_time: total.last_success_time.max(table.last_success_time),
            })
    }

    /// Build and publish the first generation of every table.
    ///
    /// Stops at the first failure. Serving must not start unless this succeeds.
    pub fn initial_load(&self) -> Result<(), RefreshError> {
        let mut rows = 0;
        for entry in self.registry.iter() {
            let outcome = self.refresh_table(entry.spec().id())?;
            rows += outcome.rows;
        }
        info!(
            tables = self.registry.len(),
            rows,
            source = self.source.name(),
            "initial load complete"
        );
        Ok(())
    }

    /// Build a new generation of `table` and publish it.
    ///
    /// On failure the current generation stays in place.
    pub fn refresh_table(&self, table: TableId) -> Result<RefreshOutcome, RefreshError> {
        let Some(entry) = self.registry.get(table) else {
            return Err(RefreshError {
                table: table.to_string(),
                source: BuildError::UnknownTable(table),
            });
        };
        let spec = entry.spec();
        let stats = &self.stats[table as usize];

        if !entry.begin_build() {
            return Err(RefreshError {
                table: spec.name().to_string(),
                source: BuildError::AlreadyBuilding(spec.name().to_string()),
            });
        }
        let _claim = BuildClaim(entry);

        match self.load(spec) {
            Ok(builder) => {
                let generation = builder.finish(entry.next_sequence());
                let outcome = RefreshOutcome {
                    table,
                    sequence: generation.sequence(),
                    rows: generation.rows(),
                    duration: generation.stats().build_duration,
                    retired: None,
                };
                let arena_bytes = generation.stats().arena_bytes;
                let retired = entry.publish(generation);
                stats.record_success(outcome.rows, outcome.duration);
                info!(
                    table = spec.name(),
                    sequence = outcome.sequence,
                    rows = outcome.rows,
                    arena_bytes,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "published generation"
                );
                Ok(RefreshOutcome { retired, ..outcome })
            }
            Err(err) => {
                stats.record_failure(&err);
                if err.is_probe_limit() {
                    error!(
                        table = spec.name(),
                        error = %err,
                        "index overflow, keeping previous generation"
                    );
                } else {
                    warn!(
                        table = spec.name(),
                        error = %err,
                        "refresh failed, keeping previous generation"
                    );
                }
                Err(RefreshError {
                    table: spec.name().to_string(),
                    source: err,
                })
            }
        }
    }

    /// Build a complete generation of `spec` without publishing it.
    pub fn build_generation(&self, spec: &TableSpec, sequence: u64) -> Result<Generation, BuildError> {
        Ok(self.load(spec)?.finish(sequence))
    }

    fn load(&self, spec: &TableSpec) -> Result<GenerationBuilder, BuildError> {
        let arena = Arena::with_limits(self.limits.arena_initial_bytes, self.limits.arena_max_bytes)?;
        let mut sink = BuildSink {
            spec,
            arena: Some(arena),
            index_max_bytes: self.limits.index_max_bytes,
            expected_rows: 0,
            builder: None,
        };
        let summary = self.source.snapshot(spec, &mut sink)?;
        let expected_rows = sink.expected_rows;
        let mut builder = match sink.builder {
            Some(builder) => builder,
            // The source never announced a count; nothing was scanned.
            None => GenerationBuilder::with_index_limit(
                spec,
                0,
                sink.arena.take().unwrap_or_default(),
                self.limits.index_max_bytes,
            )?,
        };

        if builder.rows() != expected_rows {
            debug!(
                table = spec.name(),
                counted = expected_rows,
                loaded = builder.rows(),
                "row count changed between count and scan"
            );
        }
        for &index in &summary.missing_columns {
            if builder.builds_index(index) {
                if let Some(index_spec) = spec.index(index) {
                    warn!(
                        table = spec.name(),
                        column = index_spec.column.as_str(),
                        "indexed column missing from source, index left unbuilt"
                    );
                }
                builder.skip_index(index);
            }
        }
        Ok(builder)
    }
}

/// Creates the generation builder once the source reports its row count
struct BuildSink<'a> {
    spec: &'a TableSpec,
    arena: Option<Arena>,
    index_max_bytes: usize,
    expected_rows: u64,
    builder: Option<GenerationBuilder>,
}

impl SnapshotSink for BuildSink<'_> {
    fn begin(&mut self, expected_rows: u64) -> Result<(), BuildError> {
        let arena = self.arena.take().unwrap_or_default();
        self.expected_rows = expected_rows;
        self.builder = Some(GenerationBuilder::with_index_limit(
            self.spec,
            expected_rows,
            arena,
            self.index_max_bytes,
        )?);
        Ok(())
    }

    fn row(&mut self, row: SourceRow) -> Result<(), BuildError> {
        match self.builder.as_mut() {
            Some(builder) => builder.push_row(row),
            None => Err(SourceError::Malformed {
                row: 0,
                message: "row delivered before the row count".to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_int_key, frame_payload, IndexKey};
    use crate::index::{bucket_bytes, IndexError};
    use crate::source::{MemorySource, RowSink, ScanSummary};
    use crate::table::{IndexLookup, KeyType, TableState};
    use serde_json::json;

    fn setup() -> RefreshCoordinator<MemorySource> {
        let registry = TableRegistry::new(vec![TableSpec::new("users", Duration::from_secs(60))
            .with_index("id", KeyType::Int)
            .with_index("email", KeyType::String)])
        .unwrap();
        let source = MemorySource::new();
        source.set_rows(
            "users",
            vec![
                json!({"id": 1, "email": "a@x"}),
                json!({"id": 2, "email": "b@x"}),
            ],
        );
        RefreshCoordinator::new(Arc::new(registry), source)
    }

    fn value(coordinator: &RefreshCoordinator<MemorySource>, id: i64) -> Option<serde_json::Value> {
        let entry = coordinator.registry().get(0)?;
        let generation = entry.pin()?;
        match generation.lookup(0, &encode_int_key(id)) {
            IndexLookup::Found(frame) => serde_json::from_slice(frame_payload(frame)?).ok(),
            _ => None,
        }
    }

    #[test]
    fn test_initial_load_publishes() {
        let coordinator = setup();
        coordinator.initial_load().unwrap();

        let entry = coordinator.registry().get(0).unwrap();
        assert_eq!(entry.state(), TableState::Current);
        assert_eq!(value(&coordinator, 2), Some(json!({"id": 2, "email": "b@x"})));
        assert_eq!(coordinator.totals().successes, 1);
    }

    #[test]
    fn test_refresh_replaces_generation() {
        let coordinator = setup();
        coordinator.initial_load().unwrap();

        coordinator
            .source()
            .push_row("users", json!({"id": 3, "email": "c@x"}));
        let outcome = coordinator.refresh_table(0).unwrap();
        assert_eq!(outcome.sequence, 2);
        assert_eq!(outcome.rows, 3);
        assert_eq!(outcome.retired, Some(1));
        assert!(value(&coordinator, 3).is_some());
    }

    #[test]
    fn test_failed_refresh_keeps_previous() {
        let coordinator = setup();
        coordinator.initial_load().unwrap();

        coordinator.source().push_row("users", json!("not an object"));
        let err = coordinator.refresh_table(0).unwrap_err();
        assert!(matches!(err.source, BuildError::Source(SourceError::Malformed { .. })));

        let entry = coordinator.registry().get(0).unwrap();
        assert_eq!(entry.state(), TableState::Current);
        assert_eq!(entry.pin().unwrap().sequence(), 1);
        assert_eq!(value(&coordinator, 1), Some(json!({"id": 1, "email": "a@x"})));

        let stats = coordinator.stats(0).unwrap().snapshot();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_initial_load_failure_is_reported() {
        let registry = TableRegistry::new(vec![
            TableSpec::new("missing", Duration::from_secs(1)).with_index("id", KeyType::Int)
        ])
        .unwrap();
        let coordinator = RefreshCoordinator::new(Arc::new(registry), MemorySource::new());
        let err = coordinator.initial_load().unwrap_err();
        assert_eq!(err.table, "missing");
        assert!(!coordinator.registry().all_published());
    }

    #[test]
    fn test_missing_column_left_unbuilt() {
        let coordinator = setup();
        coordinator
            .source()
            .set_rows("users", vec![json!({"id": 1}), json!({"id": 2})]);
        coordinator.initial_load().unwrap();

        let generation = coordinator.registry().get(0).unwrap().pin().unwrap();
        assert!(generation.is_index_built(0));
        assert!(!generation.is_index_built(1));
    }

    #[test]
    fn test_unknown_table() {
        let coordinator = setup();
        let err = coordinator.refresh_table(7).unwrap_err();
        assert!(matches!(err.source, BuildError::UnknownTable(7)));
    }

    #[test]
    fn test_arena_limit_fails_build() {
        let coordinator = setup().with_memory_limits(MemoryLimits {
            arena_initial_bytes: 8,
            arena_max_bytes: 16,
            ..MemoryLimits::default()
        });
        let err = coordinator.refresh_table(0).unwrap_err();
        assert!(err.source.is_memory());
        assert_eq!(coordinator.registry().get(0).unwrap().state(), TableState::Empty);
    }

    /// Reports a fixed row count and delivers the rows it holds.
    struct FixedCountSource {
        count: u64,
        rows: Vec<SourceRow>,
    }

    impl DataSource for FixedCountSource {
        fn count_rows(&self, _spec: &TableSpec) -> Result<u64, SourceError> {
            Ok(self.count)
        }

        fn scan(&self, _spec: &TableSpec, sink: &mut RowSink<'_>) -> Result<ScanSummary, BuildError> {
            for row in &self.rows {
                sink(row.clone())?;
            }
            Ok(ScanSummary {
                rows: self.rows.len() as u64,
                missing_columns: Vec::new(),
            })
        }
    }

    fn fixed_count(count: u64, ids: &[i64]) -> RefreshCoordinator<FixedCountSource> {
        let registry = TableRegistry::new(vec![
            TableSpec::new("t", Duration::from_secs(60)).with_index("id", KeyType::Int)
        ])
        .unwrap();
        let rows = ids
            .iter()
            .map(|&id| SourceRow {
                keys: vec![Some(IndexKey::Int(id))],
                value: id.to_string().into_bytes(),
            })
            .collect();
        RefreshCoordinator::new(Arc::new(registry), FixedCountSource { count, rows })
    }

    #[test]
    fn test_huge_row_count_fails_build() {
        let coordinator = fixed_count(1 << 60, &[1]);
        let err = coordinator.refresh_table(0).unwrap_err();
        assert!(err.source.is_memory());
        assert!(matches!(
            err.source,
            BuildError::Index(IndexError::CapacityExceeded { .. })
        ));
        assert_eq!(coordinator.registry().get(0).unwrap().state(), TableState::Empty);
        let stats = coordinator.stats(0).unwrap();
        assert_eq!(stats.memory_failures.load(std::sync::atomic::Ordering::Relaxed), 1);

        // The coordinator is still usable afterwards.
        assert!(coordinator.refresh_table(0).is_err());
        assert_eq!(coordinator.stats(0).unwrap().snapshot().attempts, 2);
    }

    #[test]
    fn test_index_limit_keeps_previous_generation() {
        // Two rows fit in four buckets; nine do not.
        let coordinator = setup().with_memory_limits(MemoryLimits {
            index_max_bytes: bucket_bytes(4).unwrap(),
            ..MemoryLimits::default()
        });
        coordinator.initial_load().unwrap();

        for id in 3..10 {
            coordinator
                .source()
                .push_row("users", json!({"id": id, "email": format!("{id}@x")}));
        }
        let err = coordinator.refresh_table(0).unwrap_err();
        assert!(err.source.is_memory());
        assert_eq!(coordinator.registry().get(0).unwrap().pin().unwrap().sequence(), 1);
        assert_eq!(value(&coordinator, 2), Some(json!({"id": 2, "email": "b@x"})));
    }

    #[test]
    fn test_stale_count_still_publishes() {
        let coordinator = fixed_count(0, &[5]);
        let outcome = coordinator.refresh_table(0).unwrap();
        assert_eq!(outcome.rows, 1);

        let generation = coordinator.registry().get(0).unwrap().pin().unwrap();
        assert!(matches!(
            generation.lookup(0, &encode_int_key(5)),
            IndexLookup::Found(_)
        ));
    }

    #[test]
    fn test_build_generation_does_not_publish() {
        let coordinator = setup();
        let spec = coordinator.registry().get(0).unwrap().spec().clone();
        let generation = coordinator.build_generation(&spec, 42).unwrap();
        assert_eq!(generation.sequence(), 42);
        assert_eq!(generation.rows(), 2);
        assert!(!coordinator.registry().get(0).unwrap().cell().is_published());
    }
}
