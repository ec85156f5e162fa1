//! Lookup service
//!
//! Answers point lookups against the current generation of each table. Every
//! call pins the generation for exactly as long as the caller needs the bytes;
//! a refresh publishing a new generation meanwhile never blocks or disturbs it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::stats::ServiceStats;
use crate::status::Status;
use crate::table::{GenerationRef, IndexId, TableId, TableRegistry};

/// A framed value kept alive by a generation pin
///
/// Not `Send`, like the pin it holds.
pub struct FrameRef<'a> {
    generation: GenerationRef<'a>,
    handle: Handle,
    len: usize,
}

impl FrameRef<'_> {
    /// Length prefix plus payload, ready to be written verbatim
    pub fn frame(&self) -> &[u8] {
        self.generation
            .arena()
            .resolve(self.handle, self.len)
            .unwrap_or_default()
    }

    /// Payload without the length prefix
    pub fn payload(&self) -> &[u8] {
        crate::codec::frame_payload(self.frame()).unwrap_or_default()
    }

    /// Sequence of the generation the value came from
    pub fn sequence(&self) -> u64 {
        self.generation.sequence()
    }
}

impl std::fmt::Debug for FrameRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRef")
            .field("sequence", &self.sequence())
            .field("len", &self.len)
            .finish()
    }
}

/// Outcome of [`LookupService::get`]
#[derive(Debug)]
pub enum Lookup<'a> {
    /// The key is present
    Found(FrameRef<'a>),
    /// The key is absent
    NotFound,
    /// The index exists but was not built for the current generation
    UnavailableIndex,
    /// Unknown table, or a table with no generation yet
    UnknownTable,
}

impl Lookup<'_> {
    /// Wire status of this outcome
    pub fn status(&self) -> Status {
        match self {
            Lookup::Found(_) => Status::Ok,
            Lookup::NotFound => Status::NotFound,
            Lookup::UnavailableIndex => Status::UnavailableIndex,
            Lookup::UnknownTable => Status::UnknownTable,
        }
    }

    /// The frame, if found
    pub fn frame(&self) -> Option<&[u8]> {
        match self {
            Lookup::Found(frame) => Some(frame.frame()),
            _ => None,
        }
    }
}

/// Aggregate statistics of a table's current generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Table name
    pub table: String,
    /// Rows in the current generation
    pub rows: u64,
    /// Smallest primary integer key
    pub min_id: Option<i64>,
    /// Largest primary integer key
    pub max_id: Option<i64>,
    /// Generation sequence number
    pub generation: u64,
    /// Unix time the generation was built
    pub built_at: u64,
    /// Build time in milliseconds
    pub build_duration_ms: u64,
    /// Index keys skipped during the build
    pub skipped_keys: u64,
    /// Arena bytes held by the generation
    pub arena_bytes: u64,
}

/// Schema of one index, as reported by `describe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescription {
    /// Index id within the table
    pub id: IndexId,
    /// Indexed column
    pub column: String,
    /// `int` or `string`
    pub key_type: String,
    /// Whether the current generation has this index built
    pub built: bool,
}

/// Schema of one table, as reported by `describe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    /// Table id
    pub id: TableId,
    /// Table name
    pub name: String,
    /// Refresh period in seconds
    pub period_secs: u64,
    /// Whether a generation is published
    pub loaded: bool,
    /// Configured indexes
    pub indexes: Vec<IndexDescription>,
}

/// Read side of the cache
#[derive(Debug)]
pub struct LookupService {
    registry: Arc<TableRegistry>,
    stats: Arc<ServiceStats>,
}

impl LookupService {
    /// Create a service over `registry`.
    pub fn new(registry: Arc<TableRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(ServiceStats::new()),
        }
    }

    /// Table registry
    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Request counters
    pub fn metrics(&self) -> &Arc<ServiceStats> {
        &self.stats
    }

    /// Look `key` up in index `index` of table `table`.
    ///
    /// Integer keys must be passed in their 8-byte big-endian encoding.
    pub fn get(&self, table: TableId, index: IndexId, key: &[u8]) -> Lookup<'_> {
        let lookup = self.lookup(table, index, key);
        self.stats.record_fetch(lookup.status());
        lookup
    }

    /// Append the framed value for `key` to `out`.
    ///
    /// Nothing is appended unless the status is [`Status::Ok`]. The generation is
    /// unpinned before this returns.
    pub fn get_into(&self, table: TableId, index: IndexId, key: &[u8], out: &mut Vec<u8>) -> Status {
        let lookup = self.get(table, index, key);
        if let Some(frame) = lookup.frame() {
            out.extend_from_slice(frame);
        }
        lookup.status()
    }

    fn lookup(&self, table: TableId, index: IndexId, key: &[u8]) -> Lookup<'_> {
        let Some(generation) = self.registry.get(table).and_then(|entry| entry.pin()) else {
            return Lookup::UnknownTable;
        };
        let Some(hash_index) = generation.index(index) else {
            return Lookup::UnavailableIndex;
        };
        let Some(bucket) = hash_index.lookup_entry(generation.arena(), key).copied() else {
            return Lookup::NotFound;
        };
        Lookup::Found(FrameRef {
            generation,
            handle: bucket.value_handle(),
            len: bucket.value_len() as usize,
        })
    }

    /// Statistics of the current generation of `table`
    pub fn stats(&self, table: TableId) -> Option<TableStats> {
        let entry = self.registry.get(table)?;
        let generation = entry.pin()?;
        let stats = generation.stats();
        Some(TableStats {
            table: entry.spec().name().to_string(),
            rows: stats.rows,
            min_id: stats.min_id,
            max_id: stats.max_id,
            generation: stats.sequence,
            built_at: stats.built_at,
            build_duration_ms: stats.build_duration.as_millis() as u64,
            skipped_keys: stats.skipped_keys,
            arena_bytes: stats.arena_bytes as u64,
        })
    }

    /// Id of the table called `name`
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.registry.table_id(name)
    }

    /// Schema of every configured table
    pub fn describe(&self) -> Vec<TableDescription> {
        self.registry
            .iter()
            .map(|entry| {
                let spec = entry.spec();
                let generation = entry.pin();
                TableDescription {
                    id: spec.id(),
                    name: spec.name().to_string(),
                    period_secs: spec.period().as_secs(),
                    loaded: generation.is_some(),
                    indexes: spec
                        .indexes()
                        .iter()
                        .map(|index| IndexDescription {
                            id: index.id,
                            column: index.column.clone(),
                            key_type: index.key_type.as_str().to_string(),
                            built: generation
                                .as_ref()
                                .is_some_and(|generation| generation.is_index_built(index.id)),
                        })
                        .collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_int_key, write_frame};
    use crate::refresh::RefreshCoordinator;
    use crate::source::MemorySource;
    use crate::table::{KeyType, TableSpec};
    use serde_json::json;
    use std::time::Duration;

    fn service() -> (LookupService, RefreshCoordinator<MemorySource>) {
        let registry = Arc::new(
            TableRegistry::new(vec![
                TableSpec::new("users", Duration::from_secs(60))
                    .with_index("id", KeyType::Int)
                    .with_index("email", KeyType::String)
                    .with_unbuilt_index("nick", KeyType::String),
                TableSpec::new("empty", Duration::from_secs(60)).with_index("id", KeyType::Int),
            ])
            .unwrap(),
        );
        let source = MemorySource::new();
        source.set_rows(
            "users",
            vec![
                json!({"id": 42, "email": "a@x", "nick": "al"}),
                json!({"id": 7, "email": "b@x", "nick": "bo"}),
            ],
        );
        let coordinator = RefreshCoordinator::new(Arc::clone(&registry), source);
        coordinator.refresh_table(0).unwrap();
        (LookupService::new(registry), coordinator)
    }

    #[test]
    fn test_get_found() {
        let (service, _coordinator) = service();
        let lookup = service.get(0, 0, &encode_int_key(42));
        let Lookup::Found(frame) = &lookup else {
            panic!("expected a hit, got {lookup:?}");
        };
        let value: serde_json::Value = serde_json::from_slice(frame.payload()).unwrap();
        assert_eq!(value["email"], "a@x");
        assert_eq!(frame.sequence(), 1);
        assert_eq!(lookup.status(), Status::Ok);
    }

    #[test]
    fn test_get_by_secondary_index() {
        let (service, _coordinator) = service();
        let mut out = Vec::new();
        assert_eq!(service.get_into(0, 1, b"b@x", &mut out), Status::Ok);
        let value: serde_json::Value =
            serde_json::from_slice(crate::codec::frame_payload(&out).unwrap()).unwrap();
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn test_get_negative_statuses() {
        let (service, _coordinator) = service();
        assert_eq!(service.get(0, 0, &encode_int_key(1)).status(), Status::NotFound);
        assert_eq!(service.get(0, 2, b"al").status(), Status::UnavailableIndex);
        assert_eq!(service.get(0, 9, b"al").status(), Status::UnavailableIndex);
        assert_eq!(service.get(1, 0, &encode_int_key(1)).status(), Status::UnknownTable);
        assert_eq!(service.get(5, 0, &encode_int_key(1)).status(), Status::UnknownTable);

        let snapshot = service.metrics().snapshot();
        assert_eq!(snapshot.fetches, 5);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.unavailable, 2);
        assert_eq!(snapshot.unknown_table, 2);
    }

    #[test]
    fn test_get_into_appends_frame() {
        let (service, _coordinator) = service();
        let mut out = vec![0xAA];
        assert_eq!(service.get_into(0, 0, &encode_int_key(7), &mut out), Status::Ok);

        let mut expected = vec![0xAA];
        write_frame(&mut expected, br#"{"email":"b@x","id":7,"nick":"bo"}"#).unwrap();
        assert_eq!(out, expected);

        let mut out = Vec::new();
        assert_eq!(
            service.get_into(0, 0, &encode_int_key(8), &mut out),
            Status::NotFound
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_stats() {
        let (service, _coordinator) = service();
        let stats = service.stats(0).unwrap();
        assert_eq!(stats.table, "users");
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.min_id, Some(7));
        assert_eq!(stats.max_id, Some(42));
        assert_eq!(stats.generation, 1);
        assert!(service.stats(1).is_none());
        assert!(service.stats(3).is_none());
    }

    #[test]
    fn test_describe() {
        let (service, _coordinator) = service();
        assert_eq!(service.table_id("empty"), Some(1));

        let tables = service.describe();
        assert_eq!(tables.len(), 2);
        assert!(tables[0].loaded);
        assert!(!tables[1].loaded);
        let built: Vec<bool> = tables[0].indexes.iter().map(|index| index.built).collect();
        assert_eq!(built, vec![true, true, false]);
        assert_eq!(tables[0].indexes[0].key_type, "int");
    }

    #[test]
    fn test_pin_survives_refresh() {
        let (service, coordinator) = service();
        let lookup = service.get(0, 0, &encode_int_key(42));

        coordinator
            .source()
            .set_rows("users", vec![json!({"id": 42, "email": "new@x"})]);
        coordinator.refresh_table(0).unwrap();

        let Lookup::Found(frame) = &lookup else {
            panic!("expected a hit");
        };
        assert_eq!(frame.sequence(), 1);
        let value: serde_json::Value = serde_json::from_slice(frame.payload()).unwrap();
        assert_eq!(value["email"], "a@x");
        drop(lookup);

        let mut out = Vec::new();
        service.get_into(0, 0, &encode_int_key(42), &mut out);
        assert!(String::from_utf8_lossy(&out).contains("new@x"));
    }
}
