//! Configuration loading helpers.
//!
//! A TOML file (path in `ROWCACHE_CONFIG`) describes the listeners, the data
//! source, memory limits and the cached tables:
//!
//! ```toml
//! [server]
//! tcp = "127.0.0.1:7070"
//! max_response_bytes = 1048576
//!
//! [source]
//! kind = "sqlite"
//! path = "/var/lib/app/app.db"
//! strip_null = true
//!
//! [[tables]]
//! name = "users"
//! period_secs = 30
//! indexes = [
//!     { column = "id", type = "int" },
//!     { column = "email", type = "string" },
//! ]
//! ```
//!
//! Scalar settings can be overridden with `ROWCACHE__section__field` variables.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::arena::{DEFAULT_ARENA_CAPACITY, MAX_ARENA_CAPACITY};
use crate::refresh::{MemoryLimits, RefreshWorkerConfig};
use crate::service::{ServerConfig, DEFAULT_MAX_RESPONSE_BYTES};
use crate::table::{validate_tables, KeyType, SpecError, TableSpec};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "ROWCACHE_CONFIG";

const ENV_PREFIX: &str = "ROWCACHE__";

/// TCP address used when no listener is configured
pub const DEFAULT_TCP_ADDR: &str = "127.0.0.1:7070";

/// Refresh period for tables that do not set one
pub const DEFAULT_PERIOD_SECS: u64 = 60;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
    /// Table or index definitions out of bounds.
    #[error("invalid table definition: {0}")]
    Spec(#[from] SpecError),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowcacheConfig {
    /// Listener settings.
    pub server: Option<ServerSection>,
    /// Data source settings.
    pub source: Option<SourceSection>,
    /// Refresh scheduling.
    pub refresh: Option<RefreshSection>,
    /// Arena limits.
    pub memory: Option<MemorySection>,
    /// Cached tables, in id order.
    #[serde(default)]
    pub tables: Vec<TableSection>,
}

impl RowcacheConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Load configuration from `path` (if any), then apply
    /// `ROWCACHE__section__field` overrides and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// [`RowcacheConfig::load`] from the file named by `ROWCACHE_CONFIG`.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let path = env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load(path.as_deref())
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim();

            match parts.as_slice() {
                ["server", "tcp"] => self.server_mut().tcp = Some(value.to_string()),
                ["server", "unix"] => self.server_mut().unix = Some(PathBuf::from(value)),
                ["server", "metrics"] => self.server_mut().metrics = Some(value.to_string()),
                ["server", "max_response_bytes"] => {
                    self.server_mut().max_response_bytes = Some(parse_value(&key, value)?);
                }
                ["source", "kind"] => self.source_mut().kind = Some(value.to_string()),
                ["source", "path"] => self.source_mut().path = Some(PathBuf::from(value)),
                ["source", "strip_null"] => {
                    self.source_mut().strip_null = Some(parse_value(&key, value)?);
                }
                ["refresh", "default_period_secs"] => {
                    self.refresh_mut().default_period_secs = Some(parse_value(&key, value)?);
                }
                ["refresh", "tick_ms"] => {
                    self.refresh_mut().tick_ms = Some(parse_value(&key, value)?);
                }
                ["memory", "arena_initial_bytes"] => {
                    self.memory_mut().arena_initial_bytes = Some(parse_value(&key, value)?);
                }
                ["memory", "arena_max_bytes"] => {
                    self.memory_mut().arena_max_bytes = Some(parse_value(&key, value)?);
                }
                ["memory", "index_max_bytes"] => {
                    self.memory_mut().index_max_bytes = Some(parse_value(&key, value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Check every section, including table bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_table_specs()?;
        self.to_server_config()?;
        self.metrics_addr()?;
        self.to_memory_limits()?;
        self.source_config()?;
        Ok(())
    }

    /// Build the table specs, in configuration order.
    pub fn to_table_specs(&self) -> Result<Vec<TableSpec>, ConfigError> {
        if self.tables.is_empty() {
            return Err(ConfigError::MissingField("tables".into()));
        }
        let default_period = self
            .refresh
            .as_ref()
            .and_then(|refresh| refresh.default_period_secs)
            .unwrap_or(DEFAULT_PERIOD_SECS);

        let specs: Vec<TableSpec> = self
            .tables
            .iter()
            .map(|table| table.to_spec(default_period))
            .collect();
        validate_tables(&specs)?;
        Ok(specs)
    }

    /// Build the listener configuration.
    ///
    /// Falls back to [`DEFAULT_TCP_ADDR`] when no listener is set.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let section = self.server.clone().unwrap_or_default();
        let mut config = ServerConfig::default();
        if let Some(tcp) = &section.tcp {
            config.tcp = Some(parse_value("server.tcp", tcp)?);
        }
        config.unix = section.unix;
        if config.tcp.is_none() && config.unix.is_none() {
            config.tcp = Some(parse_value("server.tcp", DEFAULT_TCP_ADDR)?);
        }
        config.max_response_bytes = section
            .max_response_bytes
            .unwrap_or(DEFAULT_MAX_RESPONSE_BYTES);
        if config.max_response_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.max_response_bytes".into(),
                value: "0".into(),
            });
        }
        Ok(config)
    }

    /// Address of the metrics endpoint, if enabled.
    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        match self.server.as_ref().and_then(|server| server.metrics.as_deref()) {
            Some(addr) => Ok(Some(parse_value("server.metrics", addr)?)),
            None => Ok(None),
        }
    }

    /// Resolve the data source.
    pub fn source_config(&self) -> Result<SourceConfig, ConfigError> {
        let section = self
            .source
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("source".into()))?;
        let strip_null = section.strip_null.unwrap_or(false);
        match section.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("sqlite") | None => {
                let path = section
                    .path
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField("source.path".into()))?;
                Ok(SourceConfig::Sqlite { path, strip_null })
            }
            Some(other) => Err(ConfigError::InvalidValue {
                key: "source.kind".into(),
                value: other.into(),
            }),
        }
    }

    /// Build the arena and index limits.
    pub fn to_memory_limits(&self) -> Result<MemoryLimits, ConfigError> {
        let section = self.memory.clone().unwrap_or_default();
        let limits = MemoryLimits {
            arena_initial_bytes: section.arena_initial_bytes.unwrap_or(DEFAULT_ARENA_CAPACITY),
            arena_max_bytes: section.arena_max_bytes.unwrap_or(MAX_ARENA_CAPACITY),
            index_max_bytes: section.index_max_bytes.unwrap_or(usize::MAX),
        };
        if limits.arena_max_bytes > MAX_ARENA_CAPACITY {
            return Err(ConfigError::InvalidValue {
                key: "memory.arena_max_bytes".into(),
                value: limits.arena_max_bytes.to_string(),
            });
        }
        if limits.arena_initial_bytes > limits.arena_max_bytes {
            return Err(ConfigError::InvalidValue {
                key: "memory.arena_initial_bytes".into(),
                value: limits.arena_initial_bytes.to_string(),
            });
        }
        Ok(limits)
    }

    /// Build the refresh worker configuration.
    pub fn to_worker_config(&self) -> RefreshWorkerConfig {
        let mut config = RefreshWorkerConfig::default();
        if let Some(tick_ms) = self.refresh.as_ref().and_then(|refresh| refresh.tick_ms) {
            config.tick = Duration::from_millis(tick_ms.max(1));
        }
        config
    }

    fn server_mut(&mut self) -> &mut ServerSection {
        self.server.get_or_insert_with(ServerSection::default)
    }

    fn source_mut(&mut self) -> &mut SourceSection {
        self.source.get_or_insert_with(SourceSection::default)
    }

    fn refresh_mut(&mut self) -> &mut RefreshSection {
        self.refresh.get_or_insert_with(RefreshSection::default)
    }

    fn memory_mut(&mut self) -> &mut MemorySection {
        self.memory.get_or_insert_with(MemorySection::default)
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// TCP listen address.
    pub tcp: Option<String>,
    /// Unix socket path.
    pub unix: Option<PathBuf>,
    /// Largest response payload.
    pub max_response_bytes: Option<usize>,
    /// Prometheus endpoint address.
    pub metrics: Option<String>,
}

/// `[source]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    /// Source kind; only `"sqlite"` is supported.
    pub kind: Option<String>,
    /// Database path.
    pub path: Option<PathBuf>,
    /// Omit `NULL` columns from stored rows.
    pub strip_null: Option<bool>,
}

/// `[refresh]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshSection {
    /// Period for tables that do not set `period_secs`.
    pub default_period_secs: Option<u64>,
    /// Longest the refresh worker sleeps between checks.
    pub tick_ms: Option<u64>,
}

/// `[memory]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySection {
    /// Initial arena capacity per generation.
    pub arena_initial_bytes: Option<usize>,
    /// Arena growth limit per generation.
    pub arena_max_bytes: Option<usize>,
    /// Bucket array limit per index.
    pub index_max_bytes: Option<usize>,
}

/// One `[[tables]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSection {
    /// Table name in the source.
    pub name: String,
    /// Refresh period in seconds.
    pub period_secs: Option<u64>,
    /// Indexed columns; the first is the primary index.
    #[serde(default)]
    pub indexes: Vec<IndexSection>,
}

impl TableSection {
    fn to_spec(&self, default_period: u64) -> TableSpec {
        let period = Duration::from_secs(self.period_secs.unwrap_or(default_period));
        self.indexes
            .iter()
            .fold(TableSpec::new(self.name.clone(), period), |spec, index| {
                if index.build {
                    spec.with_index(index.column.clone(), index.key_type)
                } else {
                    spec.with_unbuilt_index(index.column.clone(), index.key_type)
                }
            })
    }
}

/// One indexed column.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexSection {
    /// Column name.
    pub column: String,
    /// Key type: `int` or `string`.
    #[serde(rename = "type")]
    pub key_type: KeyType,
    /// Build this index (default true).
    #[serde(default = "default_build")]
    pub build: bool,
}

fn default_build() -> bool {
    true
}

/// Resolved data source configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    /// SQLite database file.
    Sqlite {
        /// Database path.
        path: PathBuf,
        /// Omit `NULL` columns from stored rows.
        strip_null: bool,
    },
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
