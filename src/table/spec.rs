//! Table and index specifications
//!
//! Specs are fixed at startup and never change while the process runs. Ids are
//! positions: a table's id is its position in the registry, an index's id is its
//! position in the table's index list. Index 0 is the primary index.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of tables a registry can hold
pub const MAX_TABLES: usize = 64;

/// Maximum number of indexes per table
pub const MAX_INDEXES: usize = 16;

/// Maximum length of a table or column name in bytes
pub const MAX_NAME_LEN: usize = 256;

/// Table identifier (position in the registry)
pub type TableId = u8;

/// Index identifier (position in the table's index list)
pub type IndexId = u8;

/// How an indexed column's values are turned into key bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// 64-bit signed integer, 8 bytes big-endian
    #[serde(alias = "integer")]
    Int,
    /// UTF-8 string, raw bytes
    #[serde(alias = "str", alias = "text")]
    String,
}

impl KeyType {
    /// Name used in configuration and describe output
    pub const fn as_str(&self) -> &'static str {
        match self {
            KeyType::Int => "int",
            KeyType::String => "string",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors found while validating table specs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    /// A table or column name is empty.
    #[error("empty {0} name")]
    EmptyName(&'static str),
    /// A table or column name is longer than `MAX_NAME_LEN`.
    #[error("name {name:?} is {len} bytes, limit is {MAX_NAME_LEN}")]
    NameTooLong {
        /// Offending name
        name: String,
        /// Its length in bytes
        len: usize,
    },
    /// More tables than `MAX_TABLES`.
    #[error("{0} tables configured, limit is {MAX_TABLES}")]
    TooManyTables(usize),
    /// Two tables share a name.
    #[error("table {0:?} is configured twice")]
    DuplicateTable(String),
    /// A table has no index.
    #[error("table {0:?} has no index")]
    NoIndexes(String),
    /// A table has more indexes than `MAX_INDEXES`.
    #[error("table {table:?} has {count} indexes, limit is {MAX_INDEXES}")]
    TooManyIndexes {
        /// Table name
        table: String,
        /// Number of indexes configured
        count: usize,
    },
    /// A column is indexed twice in the same table.
    #[error("column {column:?} of table {table:?} is indexed twice")]
    DuplicateIndex {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
    /// A table's refresh period is zero.
    #[error("table {0:?} has a zero refresh period")]
    ZeroPeriod(String),
}

/// One indexed column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Position in the table's index list
    pub id: IndexId,
    /// Source column the key is taken from
    pub column: String,
    /// Key encoding
    pub key_type: KeyType,
    /// Whether generations build this index. Unbuilt indexes answer every lookup
    /// with "unavailable".
    pub build: bool,
}

/// Process-lifetime description of one cached table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    id: TableId,
    name: String,
    period: Duration,
    indexes: Vec<IndexSpec>,
}

impl TableSpec {
    /// Create a table spec with no indexes yet.
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            id: 0,
            name: name.into(),
            period,
            indexes: Vec::new(),
        }
    }

    /// Add a built index over `column`.
    pub fn with_index(self, column: impl Into<String>, key_type: KeyType) -> Self {
        self.with_index_spec(column, key_type, true)
    }

    /// Add an index over `column` that generations leave unbuilt.
    pub fn with_unbuilt_index(self, column: impl Into<String>, key_type: KeyType) -> Self {
        self.with_index_spec(column, key_type, false)
    }

    fn with_index_spec(mut self, column: impl Into<String>, key_type: KeyType, build: bool) -> Self {
        let id = self.indexes.len() as IndexId;
        self.indexes.push(IndexSpec {
            id,
            column: column.into(),
            key_type,
            build,
        });
        self
    }

    pub(crate) fn set_id(&mut self, id: TableId) {
        self.id = id;
    }

    /// Position in the registry
    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Table name in the source
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How often the table is reloaded
    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Index specs in id order
    #[inline]
    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Look up an index spec by id
    pub fn index(&self, id: IndexId) -> Option<&IndexSpec> {
        self.indexes.get(id as usize)
    }

    /// Index 0, if any index is configured
    pub fn primary(&self) -> Option<&IndexSpec> {
        self.indexes.first()
    }

    /// Look up an index id by column name
    pub fn index_id(&self, column: &str) -> Option<IndexId> {
        self.indexes
            .iter()
            .find(|index| index.column == column)
            .map(|index| index.id)
    }

    /// Check bounds and naming rules for this table alone.
    pub fn validate(&self) -> Result<(), SpecError> {
        check_name("table", &self.name)?;
        if self.period.is_zero() {
            return Err(SpecError::ZeroPeriod(self.name.clone()));
        }
        if self.indexes.is_empty() {
            return Err(SpecError::NoIndexes(self.name.clone()));
        }
        if self.indexes.len() > MAX_INDEXES {
            return Err(SpecError::TooManyIndexes {
                table: self.name.clone(),
                count: self.indexes.len(),
            });
        }
        let mut columns = HashSet::new();
        for index in &self.indexes {
            check_name("column", &index.column)?;
            if !columns.insert(index.column.as_str()) {
                return Err(SpecError::DuplicateIndex {
                    table: self.name.clone(),
                    column: index.column.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Validate a full table list: each table, the table count and name uniqueness.
pub fn validate_tables(tables: &[TableSpec]) -> Result<(), SpecError> {
    if tables.len() > MAX_TABLES {
        return Err(SpecError::TooManyTables(tables.len()));
    }
    let mut names = HashSet::new();
    for table in tables {
        table.validate()?;
        if !names.insert(table.name()) {
            return Err(SpecError::DuplicateTable(table.name().to_string()));
        }
    }
    Ok(())
}

fn check_name(kind: &'static str, name: &str) -> Result<(), SpecError> {
    if name.is_empty() {
        return Err(SpecError::EmptyName(kind));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SpecError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
        });
    }
    Ok(())
}
