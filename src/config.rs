//! Runtime configuration for pincache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! The cache-sizing knobs (capacity, GC thresholds, storage root) are
//! additionally exposed as hot-reloadable [`CacheSettings`] through a
//! [`SettingsProvider`], so every GC cycle and transfer sees the latest values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transfer::registry::HandlerKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("total capacity must be greater than zero")]
    MissingCapacity,

    #[error("storage root path is not set")]
    MissingStorageRoot,

    #[error("{name} must be within [0, 1], got {value}")]
    InvalidFraction { name: &'static str, value: f64 },

    #[error("invalid scheme token {0:?}")]
    InvalidScheme(String),

    #[error("scheme {0:?} is mapped to the managed handler but no managed service is configured")]
    ManagedNotConfigured(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "pincache", about = "Pinned-object disk cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address; overrides `server.listen`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,

    /// Where cached bytes live and how much room they get.
    pub storage: StorageConfig,

    /// Garbage collector schedule and thresholds.
    pub gc: GcConfig,

    /// Metadata store backend.
    pub store: StoreConfig,

    /// Transfer handlers.
    pub transfer: TransferConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the cache; objects land at `root/<c0>/<c1>/<id>`.
    pub root: PathBuf,

    /// Total cache capacity in bytes.
    pub capacity_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/ps"),
            capacity_bytes: 100 * 1024 * 1024 * 1024, // 100 GiB
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Seconds between collection cycles.
    pub interval_secs: u64,

    /// Collect when usage exceeds this fraction of capacity.
    pub start_fraction: f64,

    /// Stop collecting once usage is at or below this fraction of capacity.
    pub stop_fraction: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            start_fraction: 0.5,
            stop_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Database file, used by the sqlite backend.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from("pincache.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Extra scheme → handler mappings, merged over the built-in table.
    pub schemes: BTreeMap<String, HandlerKind>,

    pub http: HttpConfig,

    /// External managed transfer service, if any.
    pub managed: Option<ManagedConfig>,

    /// Sleep between attempts while an object is being deleted.
    pub delete_poll_ms: u64,

    /// Poll interval used by callers waiting for an object to be cached.
    pub cached_poll_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            schemes: BTreeMap::new(),
            http: HttpConfig::default(),
            managed: None,
            delete_poll_ms: 50,
            cached_poll_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,

    /// Whole-request timeout; 0 disables it.
    pub timeout_secs: u64,

    /// Extra headers sent to matching hosts.
    pub auth: Vec<HttpAuth>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            timeout_secs: 0,
            auth: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpAuth {
    pub host: String,
    pub header: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedConfig {
    /// Base URL of the transfer service API.
    pub endpoint: String,

    /// Directory the service materializes files into.
    pub drop_dir: PathBuf,

    #[serde(default = "default_managed_poll_secs")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub token: Option<String>,
}

fn default_managed_poll_secs() -> u64 {
    10
}

/// Built-in scheme table.
pub fn default_schemes() -> BTreeMap<String, HandlerKind> {
    BTreeMap::from([
        ("local".to_string(), HandlerKind::Local),
        ("file".to_string(), HandlerKind::Local),
        ("http".to_string(), HandlerKind::Http),
        ("https".to_string(), HandlerKind::Http),
    ])
}

fn valid_scheme_token(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.'))
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist. The result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache_settings().validate()?;
        self.scheme_table()?;
        Ok(())
    }

    /// Built-in schemes merged with the configured ones, checked for
    /// malformed tokens and for managed mappings without a managed service.
    pub fn scheme_table(&self) -> Result<BTreeMap<String, HandlerKind>, ConfigError> {
        let mut table = default_schemes();
        table.extend(self.transfer.schemes.clone());
        for (scheme, kind) in &table {
            if !valid_scheme_token(scheme) {
                return Err(ConfigError::InvalidScheme(scheme.clone()));
            }
            if *kind == HandlerKind::Managed && self.transfer.managed.is_none() {
                return Err(ConfigError::ManagedNotConfigured(scheme.clone()));
            }
        }
        Ok(table)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            total_capacity_bytes: self.storage.capacity_bytes,
            gc_interval_secs: self.gc.interval_secs,
            gc_start_fraction: self.gc.start_fraction,
            gc_stop_fraction: self.gc.stop_fraction,
            storage_root: self.storage.root.clone(),
        }
    }
}

/// Snapshot of the settings consulted on every cache operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub total_capacity_bytes: u64,
    pub gc_interval_secs: u64,
    pub gc_start_fraction: f64,
    pub gc_stop_fraction: f64,
    pub storage_root: PathBuf,
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_capacity_bytes == 0 {
            return Err(ConfigError::MissingCapacity);
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(ConfigError::MissingStorageRoot);
        }
        for (name, value) in [
            ("gc_start_fraction", self.gc_start_fraction),
            ("gc_stop_fraction", self.gc_stop_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidFraction { name, value });
            }
        }
        Ok(())
    }
}

/// Source of the current [`CacheSettings`]. Called on every use; callers must
/// not cache the result across cycles.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> CacheSettings;
}

/// Settings that can be swapped at runtime.
pub struct LiveSettings {
    inner: RwLock<CacheSettings>,
}

impl LiveSettings {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Replace the settings after validating them.
    pub fn replace(&self, settings: CacheSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }
}

impl SettingsProvider for LiveSettings {
    fn settings(&self) -> CacheSettings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.storage.root, PathBuf::from("/tmp/ps"));
        assert_eq!(cfg.storage.capacity_bytes, 100 * 1024 * 1024 * 1024);
        assert_eq!(cfg.gc.interval_secs, 600);
        assert_eq!(cfg.gc.start_fraction, 0.5);
        assert_eq!(cfg.transfer.delete_poll_ms, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"storage": {"capacity_bytes": 1024}}"#).unwrap();
        assert_eq!(cfg.storage.capacity_bytes, 1024);
        assert_eq!(cfg.storage.root, PathBuf::from("/tmp/ps"));
        assert_eq!(cfg.gc.stop_fraction, 0.5);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut cfg = Config::default();
        cfg.storage.capacity_bytes = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingCapacity)));
    }

    #[test]
    fn test_fraction_out_of_range() {
        let mut cfg = Config::default();
        cfg.gc.stop_fraction = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidFraction { name: "gc_stop_fraction", .. })
        ));
    }

    #[test]
    fn test_managed_scheme_requires_service() {
        let mut cfg = Config::default();
        cfg.transfer
            .schemes
            .insert("globus".to_string(), HandlerKind::Managed);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ManagedNotConfigured(s)) if s == "globus"
        ));

        cfg.transfer.managed = Some(ManagedConfig {
            endpoint: "http://localhost:9000".into(),
            drop_dir: PathBuf::from("/tmp/drop"),
            poll_interval_secs: 10,
            token: None,
        });
        let table = cfg.scheme_table().unwrap();
        assert_eq!(table["globus"], HandlerKind::Managed);
        assert_eq!(table["https"], HandlerKind::Http);
    }

    #[test]
    fn test_bad_scheme_token() {
        let mut cfg = Config::default();
        cfg.transfer
            .schemes
            .insert("Bad Scheme".to_string(), HandlerKind::Http);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidScheme(_))));
    }

    #[test]
    fn test_live_settings_replace() {
        let live = LiveSettings::new(Config::default().cache_settings());
        let mut next = live.settings();
        next.total_capacity_bytes = 10;
        live.replace(next.clone()).unwrap();
        assert_eq!(live.settings(), next);

        next.gc_start_fraction = -0.1;
        assert!(live.replace(next).is_err());
        assert_eq!(live.settings().total_capacity_bytes, 10);
    }
}
