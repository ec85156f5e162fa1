//! rowcache - An in-memory table cache with hash-indexed point lookups
//!
//! Each configured database table is loaded into an immutable *generation*: a
//! flat byte arena holding every row's serialized value, plus one
//! open-addressing hash index per indexed column. Lookups read the current
//! generation without locks; a background worker rebuilds each table on its
//! refresh period and publishes the new generation with a single atomic swap.
//! Retired generations are reclaimed through epoch protection once no reader
//! can still see them.
//!
//! # Features
//!
//! - Lock-free reads that never wait for a refresh
//! - Failed refreshes keep serving the previous generation
//! - Integer and string keys, several indexes per table
//! - Binary socket protocol over TCP or Unix sockets, with an async client
//! - SQLite data source (feature `sqlite`)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rowcache::prelude::*;
//!
//! let registry = Arc::new(TableRegistry::new(vec![
//!     TableSpec::new("users", Duration::from_secs(30)).with_index("id", KeyType::Int),
//! ])?);
//! let coordinator = Arc::new(RefreshCoordinator::new(Arc::clone(&registry), source));
//! coordinator.initial_load()?;
//!
//! let service = LookupService::new(registry);
//! if let Lookup::Found(value) = service.get(0, 0, &encode_int_key(42)) {
//!     println!("{}", String::from_utf8_lossy(value.payload()));
//! }
//! ```

#![warn(missing_docs)]

pub mod arena;
pub mod codec;
pub mod config;
pub mod epoch;
pub mod index;
pub mod refresh;
pub mod service;
pub mod source;
pub mod stats;
pub mod status;
pub mod table;
mod utility;

// Re-exports for convenience
pub use arena::{Arena, ArenaError, Handle};
pub use config::{ConfigError, RowcacheConfig};
pub use status::Status;

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads holding epoch slots at once
    pub const MAX_THREADS: usize = 256;
}

/// Utility for size literals
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: usize = 1024;
    /// 1 MiB in bytes
    pub const MIB: usize = 1024 * KIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::codec::{encode_int_key, IndexKey};
    pub use crate::refresh::{RefreshCoordinator, RefreshWorker, RefreshWorkerConfig};
    pub use crate::service::{Client, Lookup, LookupService, Server, ServerConfig};
    pub use crate::source::{DataSource, MemorySource, SourceRow};
    pub use crate::status::Status;
    pub use crate::table::{KeyType, TableRegistry, TableSpec};
}
