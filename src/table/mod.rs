//! Tables, generations and the current-generation pointer
//!
//! - [`TableSpec`] / [`IndexSpec`]: process-lifetime configuration
//! - [`Generation`]: immutable snapshot built by a [`GenerationBuilder`]
//! - [`GenerationCell`]: atomically swappable current generation
//! - [`TableRegistry`]: the fixed set of tables

mod cell;
mod generation;
mod registry;
mod spec;

pub use cell::{GenerationCell, GenerationRef};
pub use generation::{BuildError, Generation, GenerationBuilder, GenerationStats, IndexLookup};
pub use registry::{TableEntry, TableRegistry, TableState};
pub use spec::{
    validate_tables, IndexId, IndexSpec, KeyType, SpecError, TableId, TableSpec, MAX_INDEXES,
    MAX_NAME_LEN, MAX_TABLES,
};
