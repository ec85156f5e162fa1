//! SQLite data source
//!
//! Each load opens the database read-only and, inside one read transaction, counts
//! the table and runs `SELECT *` over it, turning every row into a JSON object
//! keyed by column name.

use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Number, Value};

use crate::codec::IndexKey;
use crate::source::{DataSource, RowSink, ScanSummary, SnapshotSink, SourceError, SourceRow};
use crate::table::{BuildError, KeyType, TableSpec};

/// Maximum number of columns a table may have
pub const MAX_FIELDS: usize = 99;

/// Data source reading tables from a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteSource {
    path: PathBuf,
    strip_null: bool,
}

impl SqliteSource {
    /// Create a source for the database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            strip_null: false,
        }
    }

    /// Omit `NULL` columns from serialized rows.
    pub fn with_strip_null(mut self, strip_null: bool) -> Self {
        self.strip_null = strip_null;
        self
    }

    /// Database path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, SourceError> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| SourceError::Unavailable(format!("{}: {err}", self.path.display())))
    }
}

impl DataSource for SqliteSource {
    fn count_rows(&self, spec: &TableSpec) -> Result<u64, SourceError> {
        count(&self.open()?, spec)
    }

    fn scan(&self, spec: &TableSpec, sink: &mut RowSink<'_>) -> Result<ScanSummary, BuildError> {
        self.scan_with(&self.open()?, spec, sink)
    }

    /// Count and scan inside one read transaction, so both see the same rows.
    fn snapshot(
        &self,
        spec: &TableSpec,
        sink: &mut dyn SnapshotSink,
    ) -> Result<ScanSummary, BuildError> {
        let mut conn = self.open()?;
        let tx = conn.transaction().map_err(SourceError::from)?;
        sink.begin(count(&tx, spec)?)?;
        let summary = self.scan_with(&tx, spec, &mut |row| sink.row(row))?;
        // Read-only, so rolling back just ends the transaction.
        tx.rollback().map_err(SourceError::from)?;
        Ok(summary)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

impl SqliteSource {
    fn scan_with(
        &self,
        conn: &Connection,
        spec: &TableSpec,
        sink: &mut RowSink<'_>,
    ) -> Result<ScanSummary, BuildError> {
        let sql = format!("SELECT * FROM {}", quote_ident(spec.name()));
        let mut stmt = conn.prepare(&sql).map_err(SourceError::from)?;

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        if columns.len() > MAX_FIELDS {
            return Err(SourceError::TooManyFields {
                table: spec.name().to_string(),
                count: columns.len(),
                limit: MAX_FIELDS,
            }
            .into());
        }

        let mut summary = ScanSummary::default();
        // Result-set position of each index column, if present.
        let positions: Vec<Option<usize>> = spec
            .indexes()
            .iter()
            .map(|index| {
                let position = columns.iter().position(|column| *column == index.column);
                if position.is_none() {
                    summary.missing_columns.push(index.id);
                }
                position
            })
            .collect();

        let mut rows = stmt.query([]).map_err(SourceError::from)?;
        while let Some(row) = rows.next().map_err(SourceError::from)? {
            let mut fields = Map::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let field = row.get_ref(i).map_err(SourceError::from)?;
                if self.strip_null && matches!(field, ValueRef::Null) {
                    continue;
                }
                fields.insert(column.clone(), json_value(field));
            }

            let keys = spec
                .indexes()
                .iter()
                .zip(positions.iter())
                .map(|(index, position)| match position {
                    Some(i) => row
                        .get_ref(*i)
                        .map(|field| key_from_sql(field, index.key_type))
                        .map_err(SourceError::from),
                    None => Ok(None),
                })
                .collect::<Result<Vec<_>, _>>()?;

            let value = serde_json::to_vec(&fields).map_err(SourceError::from)?;
            sink(SourceRow { keys, value })?;
            summary.rows += 1;
        }
        Ok(summary)
    }
}

fn count(conn: &Connection, spec: &TableSpec) -> Result<u64, SourceError> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(spec.name()));
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_value(field: ValueRef<'_>) -> Value {
    match field {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::from(value),
        ValueRef::Real(value) => Number::from_f64(value).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn key_from_sql(field: ValueRef<'_>, key_type: KeyType) -> Option<IndexKey> {
    match (key_type, field) {
        (_, ValueRef::Null) => None,
        (KeyType::Int, ValueRef::Integer(value)) => Some(IndexKey::Int(value)),
        (KeyType::Int, ValueRef::Text(bytes)) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .map(IndexKey::Int),
        (KeyType::Int, _) => None,
        (KeyType::String, ValueRef::Integer(value)) => Some(IndexKey::Str(value.to_string())),
        (KeyType::String, ValueRef::Real(value)) => Some(IndexKey::Str(value.to_string())),
        (KeyType::String, ValueRef::Text(bytes) | ValueRef::Blob(bytes)) => {
            Some(IndexKey::Str(String::from_utf8_lossy(bytes).into_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_json_value() {
        assert_eq!(json_value(ValueRef::Integer(3)), Value::from(3));
        assert_eq!(json_value(ValueRef::Real(f64::NAN)), Value::Null);
        assert_eq!(json_value(ValueRef::Text(b"hi")), Value::from("hi"));
        assert_eq!(json_value(ValueRef::Null), Value::Null);
    }

    #[test]
    fn test_key_from_sql() {
        assert_eq!(key_from_sql(ValueRef::Integer(5), KeyType::Int), Some(IndexKey::Int(5)));
        assert_eq!(key_from_sql(ValueRef::Text(b"12"), KeyType::Int), Some(IndexKey::Int(12)));
        assert_eq!(key_from_sql(ValueRef::Real(1.5), KeyType::Int), None);
        assert_eq!(
            key_from_sql(ValueRef::Integer(5), KeyType::String),
            Some(IndexKey::from("5"))
        );
        assert_eq!(key_from_sql(ValueRef::Null, KeyType::String), None);
    }
}
