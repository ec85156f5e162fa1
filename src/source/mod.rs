//! Data source adapters
//!
//! A [`DataSource`] streams every row of a table as a serialized value plus one key
//! slot per index spec. The refresh coordinator only talks to this trait.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemorySource;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteSource, MAX_FIELDS};

use serde_json::Value;

use crate::codec::IndexKey;
use crate::table::{BuildError, IndexId, KeyType, TableSpec};

/// One row as delivered by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    /// One slot per index spec, in index id order. `None` is a null column.
    pub keys: Vec<Option<IndexKey>>,
    /// Serialized row, stored verbatim as the lookup value
    pub value: Vec<u8>,
}

/// What a completed scan reports about the result set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Rows handed to the sink
    pub rows: u64,
    /// Indexes whose column does not exist in the result set
    pub missing_columns: Vec<IndexId>,
}

/// Errors raised by a data source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source could not be reached.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// The source has no such table.
    #[error("table {0:?} not found in source")]
    UnknownTable(String),
    /// A row or field could not be decoded.
    #[error("malformed row {row}: {message}")]
    Malformed {
        /// Zero-based row number
        row: u64,
        /// What was wrong
        message: String,
    },
    /// The result set has more columns than the adapter accepts.
    #[error("table {table:?} has {count} columns, limit is {limit}")]
    TooManyFields {
        /// Table name
        table: String,
        /// Column count
        count: usize,
        /// Adapter limit
        limit: usize,
    },
    /// Row serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// SQLite error.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Row sink handed to [`DataSource::scan`]
pub type RowSink<'a> = dyn FnMut(SourceRow) -> Result<(), BuildError> + 'a;

/// Receiver of one table load from [`DataSource::snapshot`]
pub trait SnapshotSink {
    /// Called once, before any row, with the row count of the snapshot.
    fn begin(&mut self, expected_rows: u64) -> Result<(), BuildError>;

    /// Called for every row of the snapshot.
    fn row(&mut self, row: SourceRow) -> Result<(), BuildError>;
}

/// A relational source a table can be loaded from
pub trait DataSource: Send + Sync {
    /// Number of rows the next scan is expected to deliver. Used to size indexes.
    fn count_rows(&self, spec: &TableSpec) -> Result<u64, SourceError>;

    /// Deliver every row of `spec`'s table to `sink`, stopping at the first error.
    fn scan(&self, spec: &TableSpec, sink: &mut RowSink<'_>) -> Result<ScanSummary, BuildError>;

    /// Count and scan `spec`'s table, handing both to `sink`.
    ///
    /// The default runs [`count_rows`](Self::count_rows) then [`scan`](Self::scan)
    /// with no isolation between them. Sources that can read both from one
    /// consistent view override it.
    fn snapshot(
        &self,
        spec: &TableSpec,
        sink: &mut dyn SnapshotSink,
    ) -> Result<ScanSummary, BuildError> {
        let expected_rows = self.count_rows(spec)?;
        sink.begin(expected_rows)?;
        self.scan(spec, &mut |row| sink.row(row))
    }

    /// Short human-readable name for logs
    fn name(&self) -> &str {
        "source"
    }
}

impl<S: DataSource + ?Sized> DataSource for std::sync::Arc<S> {
    fn count_rows(&self, spec: &TableSpec) -> Result<u64, SourceError> {
        (**self).count_rows(spec)
    }

    fn scan(&self, spec: &TableSpec, sink: &mut RowSink<'_>) -> Result<ScanSummary, BuildError> {
        (**self).scan(spec, sink)
    }

    fn snapshot(
        &self,
        spec: &TableSpec,
        sink: &mut dyn SnapshotSink,
    ) -> Result<ScanSummary, BuildError> {
        (**self).snapshot(spec, sink)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Extract a typed key from a JSON field.
///
/// Integer indexes accept JSON integers and integer strings. String indexes take
/// strings verbatim and the textual form of numbers and booleans. Anything else is
/// treated as null.
pub fn key_from_json(value: &Value, key_type: KeyType) -> Option<IndexKey> {
    match key_type {
        KeyType::Int => match value {
            Value::Number(number) => number.as_i64().map(IndexKey::Int),
            Value::String(text) => text.trim().parse().ok().map(IndexKey::Int),
            _ => None,
        },
        KeyType::String => match value {
            Value::String(text) => Some(IndexKey::Str(text.clone())),
            Value::Number(number) => Some(IndexKey::Str(number.to_string())),
            Value::Bool(flag) => Some(IndexKey::Str(flag.to_string())),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_from_json_int() {
        assert_eq!(key_from_json(&json!(42), KeyType::Int), Some(IndexKey::Int(42)));
        assert_eq!(key_from_json(&json!(" 17 "), KeyType::Int), Some(IndexKey::Int(17)));
        assert_eq!(key_from_json(&json!(1.5), KeyType::Int), None);
        assert_eq!(key_from_json(&json!("x"), KeyType::Int), None);
        assert_eq!(key_from_json(&Value::Null, KeyType::Int), None);
    }

    #[test]
    fn test_key_from_json_string() {
        assert_eq!(
            key_from_json(&json!("a@b"), KeyType::String),
            Some(IndexKey::from("a@b"))
        );
        assert_eq!(key_from_json(&json!(5), KeyType::String), Some(IndexKey::from("5")));
        assert_eq!(key_from_json(&json!(true), KeyType::String), Some(IndexKey::from("true")));
        assert_eq!(key_from_json(&json!([1]), KeyType::String), None);
        assert_eq!(key_from_json(&Value::Null, KeyType::String), None);
    }
}
