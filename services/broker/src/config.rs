//! Broker configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides
//! (except `LOG_LEVEL`, which only drives tracing).  Default config path:
//! `/etc/eventline/broker.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `store.sqlite_path` when `store.backend = "sqlite"`
//!
//! Everything else has defaults.

use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/eventline/broker.toml";

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub limits: LimitsConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Required for the sqlite backend; ignored otherwise.
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Inbound command channel capacity per connection.
    pub command_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub conflict_retries: u32,
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    store: Option<RawStoreConfig>,
    limits: Option<RawLimitsConfig>,
    dispatch: Option<RawDispatchConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    backend: Option<String>,
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLimitsConfig {
    command_buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawDispatchConfig {
    conflict_retries: Option<u32>,
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

/// Load and validate the config file at `path`.
pub fn load_config(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Parse and validate config text.
pub fn parse_config(text: &str) -> Result<BrokerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::Invalid("schema_version is required".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::Invalid(format!(
            "unsupported schema_version {schema_version} (expected 1)"
        )));
    }

    let bind = raw
        .server
        .and_then(|s| s.bind)
        .unwrap_or_else(|| "0.0.0.0:4550".to_owned());

    let raw_store = raw.store;
    let backend = match raw_store.as_ref().and_then(|s| s.backend.as_deref()) {
        None | Some("memory") => StoreBackend::Memory,
        Some("sqlite") => StoreBackend::Sqlite,
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "unknown store backend '{other}' (expected 'memory' or 'sqlite')"
            )));
        }
    };
    let sqlite_path = raw_store.and_then(|s| s.sqlite_path);
    if backend == StoreBackend::Sqlite && sqlite_path.is_none() {
        return Err(ConfigError::Invalid(
            "store.sqlite_path is required for the sqlite backend".to_owned(),
        ));
    }

    let command_buffer = raw
        .limits
        .and_then(|l| l.command_buffer)
        .unwrap_or(64);
    if command_buffer == 0 {
        return Err(ConfigError::Invalid(
            "limits.command_buffer must be at least 1".to_owned(),
        ));
    }

    let conflict_retries = raw
        .dispatch
        .and_then(|d| d.conflict_retries)
        .unwrap_or(0);

    Ok(BrokerConfig {
        schema_version,
        server: ServerConfig { bind },
        store: StoreConfig {
            backend,
            sqlite_path,
        },
        limits: LimitsConfig { command_buffer },
        dispatch: DispatchConfig { conflict_retries },
    })
}
