//! In-memory data source
//!
//! Tables are lists of JSON objects keyed by column name. Rows are serialized the
//! same way the SQLite adapter serializes them, which makes this source a drop-in
//! stand-in for tests, demos and benches.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::source::{
    key_from_json, DataSource, RowSink, ScanSummary, SnapshotSink, SourceError, SourceRow,
};
use crate::table::{BuildError, TableSpec};

/// Data source backed by JSON rows held in memory
#[derive(Debug, Default)]
pub struct MemorySource {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    strip_null: bool,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Omit null fields from serialized rows.
    pub fn with_strip_null(mut self, strip_null: bool) -> Self {
        self.strip_null = strip_null;
        self
    }

    /// Replace the rows of `table`.
    pub fn set_rows(&self, table: impl Into<String>, rows: Vec<Value>) {
        self.tables.write().insert(table.into(), rows);
    }

    /// Append one row to `table`, creating it if needed.
    pub fn push_row(&self, table: &str, row: Value) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Drop `table` from the source.
    pub fn remove_table(&self, table: &str) -> bool {
        self.tables.write().remove(table).is_some()
    }

    /// Number of rows currently held for `table`
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.tables.read().get(table).map(Vec::len)
    }

    fn serialize(&self, fields: &Map<String, Value>) -> Result<Vec<u8>, SourceError> {
        if self.strip_null {
            let stripped: Map<String, Value> = fields
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            Ok(serde_json::to_vec(&stripped)?)
        } else {
            Ok(serde_json::to_vec(fields)?)
        }
    }
}

impl DataSource for MemorySource {
    fn count_rows(&self, spec: &TableSpec) -> Result<u64, SourceError> {
        self.row_count(spec.name())
            .map(|rows| rows as u64)
            .ok_or_else(|| SourceError::UnknownTable(spec.name().to_string()))
    }

    fn scan(&self, spec: &TableSpec, sink: &mut RowSink<'_>) -> Result<ScanSummary, BuildError> {
        let rows = self.rows(spec)?;
        self.scan_rows(spec, &rows, sink)
    }

    fn snapshot(
        &self,
        spec: &TableSpec,
        sink: &mut dyn SnapshotSink,
    ) -> Result<ScanSummary, BuildError> {
        let rows = self.rows(spec)?;
        sink.begin(rows.len() as u64)?;
        self.scan_rows(spec, &rows, &mut |row| sink.row(row))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl MemorySource {
    /// Copy of `spec`'s rows, so the lock is not held while the sink builds.
    fn rows(&self, spec: &TableSpec) -> Result<Vec<Value>, SourceError> {
        self.tables
            .read()
            .get(spec.name())
            .cloned()
            .ok_or_else(|| SourceError::UnknownTable(spec.name().to_string()))
    }

    fn scan_rows(
        &self,
        spec: &TableSpec,
        rows: &[Value],
        sink: &mut RowSink<'_>,
    ) -> Result<ScanSummary, BuildError> {
        let mut summary = ScanSummary::default();
        if !rows.is_empty() {
            summary.missing_columns = spec
                .indexes()
                .iter()
                .filter(|index| {
                    !rows.iter().any(|row| {
                        row.as_object()
                            .is_some_and(|fields| fields.contains_key(&index.column))
                    })
                })
                .map(|index| index.id)
                .collect();
        }

        for (row_number, row) in rows.iter().enumerate() {
            let fields = row.as_object().ok_or_else(|| SourceError::Malformed {
                row: row_number as u64,
                message: "row is not a JSON object".to_string(),
            })?;
            let keys = spec
                .indexes()
                .iter()
                .map(|index| {
                    fields
                        .get(&index.column)
                        .and_then(|value| key_from_json(value, index.key_type))
                })
                .collect();
            let value = self.serialize(fields)?;
            sink(SourceRow { keys, value })?;
            summary.rows += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::IndexKey;
    use crate::table::KeyType;
    use serde_json::json;
    use std::time::Duration;

    fn spec() -> TableSpec {
        TableSpec::new("users", Duration::from_secs(1))
            .with_index("id", KeyType::Int)
            .with_index("email", KeyType::String)
    }

    fn collect(source: &MemorySource, spec: &TableSpec) -> (Vec<SourceRow>, ScanSummary) {
        let mut rows = Vec::new();
        let summary = source
            .scan(spec, &mut |row| {
                rows.push(row);
                Ok(())
            })
            .unwrap();
        (rows, summary)
    }

    #[test]
    fn test_scan_extracts_keys() {
        let source = MemorySource::new();
        source.set_rows(
            "users",
            vec![
                json!({"id": 1, "email": "a@x", "name": "ann"}),
                json!({"id": 2, "email": null}),
            ],
        );
        assert_eq!(source.count_rows(&spec()).unwrap(), 2);

        let (rows, summary) = collect(&source, &spec());
        assert_eq!(summary.rows, 2);
        assert!(summary.missing_columns.is_empty());
        assert_eq!(rows[0].keys, vec![Some(IndexKey::Int(1)), Some(IndexKey::from("a@x"))]);
        assert_eq!(rows[1].keys, vec![Some(IndexKey::Int(2)), None]);

        let value: Value = serde_json::from_slice(&rows[1].value).unwrap();
        assert_eq!(value, json!({"id": 2, "email": null}));
    }

    #[test]
    fn test_strip_null() {
        let source = MemorySource::new().with_strip_null(true);
        source.push_row("users", json!({"id": 2, "email": null}));
        let (rows, _) = collect(&source, &spec());
        let value: Value = serde_json::from_slice(&rows[0].value).unwrap();
        assert_eq!(value, json!({"id": 2}));
    }

    #[test]
    fn test_missing_column_reported() {
        let source = MemorySource::new();
        source.push_row("users", json!({"id": 1}));
        let (_, summary) = collect(&source, &spec());
        assert_eq!(summary.missing_columns, vec![1]);
    }

    #[test]
    fn test_unknown_table() {
        let source = MemorySource::new();
        source.push_row("users", json!({"id": 1}));
        assert!(source.remove_table("users"));
        assert!(!source.remove_table("users"));
        assert!(matches!(
            source.count_rows(&spec()),
            Err(SourceError::UnknownTable(_))
        ));
        let err = source.scan(&spec(), &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, BuildError::Source(SourceError::UnknownTable(_))));
    }

    #[test]
    fn test_non_object_row_is_malformed() {
        let source = MemorySource::new();
        source.set_rows("users", vec![json!({"id": 1}), json!([1, 2])]);
        let mut seen = 0;
        let err = source
            .scan(&spec(), &mut |_| {
                seen += 1;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(seen, 1);
        assert!(matches!(
            err,
            BuildError::Source(SourceError::Malformed { row: 1, .. })
        ));
    }

    #[test]
    fn test_sink_error_stops_scan() {
        let source = MemorySource::new();
        source.set_rows("users", vec![json!({"id": 1}), json!({"id": 2})]);
        let mut seen = 0;
        let err = source
            .scan(&spec(), &mut |_| {
                seen += 1;
                Err(BuildError::UnknownTable(9))
            })
            .unwrap_err();
        assert_eq!(seen, 1);
        assert!(matches!(err, BuildError::UnknownTable(9)));
    }

    #[derive(Default)]
    struct Recorder {
        counted: Option<u64>,
        rows: u64,
    }

    impl SnapshotSink for Recorder {
        fn begin(&mut self, expected_rows: u64) -> Result<(), BuildError> {
            self.counted = Some(expected_rows);
            Ok(())
        }

        fn row(&mut self, _row: SourceRow) -> Result<(), BuildError> {
            assert!(self.counted.is_some(), "row before begin");
            self.rows += 1;
            Ok(())
        }
    }

    #[test]
    fn test_snapshot_counts_what_it_scans() {
        let source = MemorySource::new();
        source.set_rows("users", vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
        let mut recorder = Recorder::default();
        let summary = source.snapshot(&spec(), &mut recorder).unwrap();
        assert_eq!(recorder.counted, Some(3));
        assert_eq!(recorder.rows, 3);
        assert_eq!(summary.rows, 3);
    }
}
