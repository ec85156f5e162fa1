//! Generations: immutable snapshots of one table
//!
//! A generation owns one arena and one hash index per built index spec. It is
//! assembled row by row by a [`GenerationBuilder`] and never modified once
//! finished.

use std::time::{Duration, Instant};

use crate::arena::{Arena, ArenaError};
use crate::codec::{IndexKey, FRAME_HEADER_LEN};
use crate::index::{HashIndex, IndexError, MAX_PROBE_COUNT};
use crate::source::{SourceError, SourceRow};
use crate::table::spec::{IndexId, KeyType, TableId, TableSpec};
use crate::utility::unix_now_secs;

/// Errors that abort a generation build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The data source failed.
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    /// The arena could not hold the table.
    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),
    /// An index insert failed.
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    /// A row carried the wrong number of key slots.
    #[error("row {row} has {found} key slots, expected {expected}")]
    KeyCount {
        /// Zero-based row number
        row: u64,
        /// Number of index specs
        expected: usize,
        /// Number of keys in the row
        found: usize,
    },
    /// The table id is not registered.
    #[error("unknown table id {0}")]
    UnknownTable(TableId),
    /// Another build of the same table is in progress.
    #[error("table {0:?} is already being built")]
    AlreadyBuilding(String),
}

impl BuildError {
    /// Index overflow is a sizing problem rather than a transient failure.
    pub fn is_probe_limit(&self) -> bool {
        matches!(self, BuildError::Index(IndexError::ProbeLimit { .. }))
    }

    /// Failures caused by memory bounds
    pub fn is_memory(&self) -> bool {
        matches!(
            self,
            BuildError::Arena(_)
                | BuildError::Index(
                    IndexError::Arena(_)
                        | IndexError::CapacityExceeded { .. }
                        | IndexError::OutOfMemory { .. }
                )
        )
    }
}

/// Aggregate statistics of a generation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerationStats {
    /// Rows loaded
    pub rows: u64,
    /// Smallest integer key seen on the primary index
    pub min_id: Option<i64>,
    /// Largest integer key seen on the primary index
    pub max_id: Option<i64>,
    /// Per-table sequence number, starting at 1
    pub sequence: u64,
    /// Unix time the build finished
    pub built_at: u64,
    /// Wall time spent building
    pub build_duration: Duration,
    /// Index keys skipped because they were null, empty or mistyped
    pub skipped_keys: u64,
    /// Arena bytes in use
    pub arena_bytes: usize,
}

/// Result of a lookup against one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLookup<'a> {
    /// Framed value, length prefix included
    Found(&'a [u8]),
    /// The index holds no such key
    NotFound,
    /// The index is not built in this generation
    Unavailable,
}

/// Immutable snapshot of one table
#[derive(Debug)]
pub struct Generation {
    arena: Arena,
    indexes: Vec<Option<HashIndex>>,
    stats: GenerationStats,
}

impl Generation {
    /// Look `key` up in index `index`.
    pub fn lookup(&self, index: IndexId, key: &[u8]) -> IndexLookup<'_> {
        match self.index(index) {
            Some(index) => match index.lookup(&self.arena, key) {
                Some(frame) => IndexLookup::Found(frame),
                None => IndexLookup::NotFound,
            },
            None => IndexLookup::Unavailable,
        }
    }

    /// The built index with id `index`, if any
    pub fn index(&self, index: IndexId) -> Option<&HashIndex> {
        self.indexes.get(index as usize).and_then(Option::as_ref)
    }

    /// Whether index `index` was built
    pub fn is_index_built(&self, index: IndexId) -> bool {
        self.index(index).is_some()
    }

    /// Number of index slots (built or not)
    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    /// Backing arena
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Aggregate statistics
    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    /// Rows loaded
    pub fn rows(&self) -> u64 {
        self.stats.rows
    }

    /// Sequence number
    pub fn sequence(&self) -> u64 {
        self.stats.sequence
    }
}

/// Assembles a [`Generation`] from source rows
pub struct GenerationBuilder {
    key_types: Vec<KeyType>,
    primary_is_int: bool,
    arena: Arena,
    indexes: Vec<Option<HashIndex>>,
    rows: u64,
    min_id: Option<i64>,
    max_id: Option<i64>,
    skipped_keys: u64,
    key_buf: Vec<u8>,
    started: Instant,
}

impl GenerationBuilder {
    /// Start a build for `spec`, sizing every built index for `expected_rows`.
    pub fn new(spec: &TableSpec, expected_rows: u64, arena: Arena) -> Result<Self, BuildError> {
        Self::with_index_limit(spec, expected_rows, arena, usize::MAX)
    }

    /// Start a build whose bucket arrays may take at most `index_max_bytes` each.
    pub fn with_index_limit(
        spec: &TableSpec,
        expected_rows: u64,
        arena: Arena,
        index_max_bytes: usize,
    ) -> Result<Self, BuildError> {
        let hint = usize::try_from(expected_rows).unwrap_or(usize::MAX);
        let indexes = spec
            .indexes()
            .iter()
            .map(|index| {
                index
                    .build
                    .then(|| HashIndex::with_limits(hint, MAX_PROBE_COUNT, index_max_bytes))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            key_types: spec.indexes().iter().map(|index| index.key_type).collect(),
            primary_is_int: spec.primary().map(|index| index.key_type) == Some(KeyType::Int),
            arena,
            indexes,
            rows: 0,
            min_id: None,
            max_id: None,
            skipped_keys: 0,
            key_buf: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Leave index `index` unbuilt for this generation.
    pub fn skip_index(&mut self, index: IndexId) {
        if let Some(slot) = self.indexes.get_mut(index as usize) {
            *slot = None;
        }
    }

    /// Whether index `index` is still being built
    pub fn builds_index(&self, index: IndexId) -> bool {
        matches!(self.indexes.get(index as usize), Some(Some(_)))
    }

    /// Rows pushed so far
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Store one row and insert its keys into every built index.
    ///
    /// A missing, empty or mistyped key skips that index for this row only. Any
    /// error leaves the builder unusable; the caller drops it.
    pub fn push_row(&mut self, row: SourceRow) -> Result<(), BuildError> {
        if row.keys.len() != self.indexes.len() {
            return Err(BuildError::KeyCount {
                row: self.rows,
                expected: self.indexes.len(),
                found: row.keys.len(),
            });
        }

        let value_handle = self.arena.store_framed(&row.value)?;
        // store_framed bounds the payload so the frame length fits in u32.
        let value_len = (FRAME_HEADER_LEN + row.value.len()) as u32;

        if self.primary_is_int {
            if let Some(IndexKey::Int(id)) = row.keys[0] {
                self.min_id = Some(self.min_id.map_or(id, |min| min.min(id)));
                self.max_id = Some(self.max_id.map_or(id, |max| max.max(id)));
            }
        }

        for ((slot, key), key_type) in self
            .indexes
            .iter_mut()
            .zip(row.keys.iter())
            .zip(self.key_types.iter())
        {
            let Some(index) = slot.as_mut() else {
                continue;
            };
            let key = match key {
                Some(key) if !key.is_empty() && key_matches(key, *key_type) => key,
                _ => {
                    self.skipped_keys += 1;
                    continue;
                }
            };
            self.key_buf.clear();
            key.encode_into(&mut self.key_buf);
            index.insert(&mut self.arena, &self.key_buf, value_handle, value_len)?;
        }

        self.rows += 1;
        Ok(())
    }

    /// Seal the build into an immutable generation.
    pub fn finish(self, sequence: u64) -> Generation {
        let stats = GenerationStats {
            rows: self.rows,
            min_id: self.min_id,
            max_id: self.max_id,
            sequence,
            built_at: unix_now_secs(),
            build_duration: self.started.elapsed(),
            skipped_keys: self.skipped_keys,
            arena_bytes: self.arena.used(),
        };
        Generation {
            arena: self.arena,
            indexes: self.indexes,
            stats,
        }
    }
}

fn key_matches(key: &IndexKey, key_type: KeyType) -> bool {
    matches!(
        (key, key_type),
        (IndexKey::Int(_), KeyType::Int) | (IndexKey::Str(_), KeyType::String)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_int_key, frame_payload};

    fn spec() -> TableSpec {
        TableSpec::new("users", Duration::from_secs(60))
            .with_index("id", KeyType::Int)
            .with_index("email", KeyType::String)
    }

    fn row(id: Option<i64>, email: Option<&str>, value: &str) -> SourceRow {
        SourceRow {
            keys: vec![id.map(IndexKey::Int), email.map(IndexKey::from)],
            value: value.as_bytes().to_vec(),
        }
    }

    fn payload<'a>(generation: &'a Generation, index: IndexId, key: &[u8]) -> Option<&'a [u8]> {
        match generation.lookup(index, key) {
            IndexLookup::Found(frame) => frame_payload(frame),
            _ => None,
        }
    }

    #[test]
    fn test_min_max_and_row_count() {
        let spec = spec();
        let mut builder = GenerationBuilder::new(&spec, 4, Arena::with_capacity(64)).unwrap();
        for id in [7, 2, 19, 2] {
            builder
                .push_row(row(Some(id), None, &format!("row{id}")))
                .unwrap();
        }
        let generation = builder.finish(1);

        let stats = generation.stats();
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.min_id, Some(2));
        assert_eq!(stats.max_id, Some(19));
        assert_eq!(stats.sequence, 1);
        assert_eq!(
            payload(&generation, 0, &encode_int_key(19)),
            Some(&b"row19"[..])
        );
    }

    #[test]
    fn test_null_key_skips_only_that_index() {
        let spec = spec();
        let mut builder = GenerationBuilder::new(&spec, 2, Arena::with_capacity(64)).unwrap();
        builder.push_row(row(Some(1), None, "a")).unwrap();
        builder.push_row(row(Some(2), Some(""), "b")).unwrap();
        builder.push_row(row(Some(3), Some("c@x"), "c")).unwrap();
        let generation = builder.finish(1);

        assert_eq!(generation.stats().skipped_keys, 2);
        assert_eq!(payload(&generation, 0, &encode_int_key(1)), Some(&b"a"[..]));
        assert_eq!(payload(&generation, 0, &encode_int_key(2)), Some(&b"b"[..]));
        assert_eq!(payload(&generation, 1, b"c@x"), Some(&b"c"[..]));
        assert_eq!(generation.lookup(1, b""), IndexLookup::NotFound);
    }

    #[test]
    fn test_mistyped_key_is_skipped() {
        let spec = spec();
        let mut builder = GenerationBuilder::new(&spec, 1, Arena::with_capacity(64)).unwrap();
        builder
            .push_row(SourceRow {
                keys: vec![Some(IndexKey::from("7")), Some(IndexKey::Int(7))],
                value: b"v".to_vec(),
            })
            .unwrap();
        let generation = builder.finish(1);
        assert_eq!(generation.stats().skipped_keys, 2);
        assert_eq!(generation.stats().min_id, None);
        assert_eq!(generation.index(0).unwrap().len(), 0);
    }

    #[test]
    fn test_unbuilt_index_is_unavailable() {
        let spec = TableSpec::new("t", Duration::from_secs(1))
            .with_index("id", KeyType::Int)
            .with_unbuilt_index("name", KeyType::String);
        let mut builder = GenerationBuilder::new(&spec, 1, Arena::with_capacity(64)).unwrap();
        assert!(!builder.builds_index(1));
        builder
            .push_row(SourceRow {
                keys: vec![Some(IndexKey::Int(1)), Some(IndexKey::from("n"))],
                value: b"v".to_vec(),
            })
            .unwrap();
        let generation = builder.finish(1);

        assert!(generation.is_index_built(0));
        assert!(!generation.is_index_built(1));
        assert_eq!(generation.lookup(1, b"n"), IndexLookup::Unavailable);
        assert_eq!(generation.lookup(9, b"n"), IndexLookup::Unavailable);
        assert_eq!(generation.stats().skipped_keys, 0);
    }

    #[test]
    fn test_skip_index() {
        let spec = spec();
        let mut builder = GenerationBuilder::new(&spec, 1, Arena::with_capacity(64)).unwrap();
        builder.skip_index(1);
        builder.push_row(row(Some(1), Some("e"), "v")).unwrap();
        let generation = builder.finish(1);
        assert_eq!(generation.lookup(1, b"e"), IndexLookup::Unavailable);
    }

    #[test]
    fn test_key_count_mismatch() {
        let spec = spec();
        let mut builder = GenerationBuilder::new(&spec, 1, Arena::with_capacity(64)).unwrap();
        let err = builder
            .push_row(SourceRow {
                keys: vec![Some(IndexKey::Int(1))],
                value: Vec::new(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::KeyCount {
                row: 0,
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_string_primary_has_no_min_max() {
        let spec = TableSpec::new("t", Duration::from_secs(1)).with_index("name", KeyType::String);
        let mut builder = GenerationBuilder::new(&spec, 1, Arena::with_capacity(64)).unwrap();
        builder
            .push_row(SourceRow {
                keys: vec![Some(IndexKey::from("a"))],
                value: b"v".to_vec(),
            })
            .unwrap();
        let generation = builder.finish(3);
        assert_eq!(generation.stats().min_id, None);
        assert_eq!(generation.stats().max_id, None);
        assert_eq!(generation.sequence(), 3);
    }

    #[test]
    fn test_undersized_index_overflows() {
        let spec = TableSpec::new("t", Duration::from_secs(1)).with_index("id", KeyType::Int);
        // Sized for zero rows: a single bucket.
        let mut builder = GenerationBuilder::new(&spec, 0, Arena::with_capacity(64)).unwrap();
        builder.push_row(row_int(1)).unwrap();
        let err = builder.push_row(row_int(2)).unwrap_err();
        assert!(err.is_probe_limit());
        assert!(!err.is_memory());
    }

    fn row_int(id: i64) -> SourceRow {
        SourceRow {
            keys: vec![Some(IndexKey::Int(id))],
            value: id.to_string().into_bytes(),
        }
    }

    #[test]
    fn test_arena_limit_aborts() {
        let spec = TableSpec::new("t", Duration::from_secs(1)).with_index("id", KeyType::Int);
        let arena = Arena::with_limits(16, 16).unwrap();
        let mut builder = GenerationBuilder::new(&spec, 4, arena).unwrap();
        let err = builder
            .push_row(SourceRow {
                keys: vec![Some(IndexKey::Int(1))],
                value: vec![0; 64],
            })
            .unwrap_err();
        assert!(err.is_memory());
    }

    #[test]
    fn test_index_limit_fails_before_any_row() {
        let spec = TableSpec::new("t", Duration::from_secs(1))
            .with_index("id", KeyType::Int)
            .with_unbuilt_index("name", KeyType::String);
        let err =
            GenerationBuilder::with_index_limit(&spec, 1000, Arena::with_capacity(64), 1024)
                .err()
                .unwrap();
        assert!(err.is_memory());
        assert!(matches!(
            err,
            BuildError::Index(IndexError::CapacityExceeded { limit: 1024, .. })
        ));

        let err = GenerationBuilder::new(&spec, 1 << 60, Arena::with_capacity(64))
            .err()
            .unwrap();
        assert!(err.is_memory());
    }
}
