//! # fdist-config
//!
//! Settings shared by the `fdist` CLI and the `fdistd` daemon.
//!
//! Layers, later ones win: built-in defaults, `~/.fdist/config.toml`,
//! `.fdist/config.toml` in the working directory, then `FDIST_*` variables.

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get a snapshot of the global config
pub fn config() -> Config {
    match CONFIG.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    match CONFIG.write() {
        Ok(mut guard) => *guard = new_config,
        Err(poisoned) => *poisoned.into_inner() = new_config,
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Invalid peer address {0:?}")]
    InvalidPeer(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    pub lock: LockConfig,
    pub server: ServerConfig,
    pub notify: NotifyConfig,
    pub retention: RetentionConfig,
    pub redownload: RedownloadConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.fdist/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Project config (.fdist/config.toml) overrides global
        let project_path = Path::new(".fdist/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config.merge(Self::from_file(project_path)?);
        }

        // 3. Environment
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse one config file without layering.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.fdist/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".fdist/config.toml"))
    }

    /// Merge a project config over this one. Fields the project file leaves
    /// at their defaults keep the global value.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        macro_rules! overlay {
            ($($section:ident . $field:ident),* $(,)?) => {
                $(
                    if other.$section.$field != defaults.$section.$field {
                        self.$section.$field = other.$section.$field;
                    }
                )*
            };
        }
        overlay!(
            storage.root,
            storage.state_dir,
            registry.hosted,
            registry.download_timeout_secs,
            lock.timeout_secs,
            lock.lock_dir,
            lock.scope,
            server.bind,
            server.port,
            server.workers,
            server.max_frame_bytes,
            notify.timeout_secs,
            retention.interval_secs,
            retention.max_unused_age_secs,
            retention.keep_at_least,
            redownload.interval_secs,
            redownload.peers,
        );
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FDIST_ROOT") {
            self.storage.root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("FDIST_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(path);
        }
        if let Ok(port) = std::env::var("FDIST_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(workers) = std::env::var("FDIST_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.server.workers = Some(n);
            }
        }
        if let Ok(hosted) = std::env::var("FDIST_HOSTED") {
            self.registry.hosted = matches!(hosted.as_str(), "1" | "true" | "yes");
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }

    /// Blob store root with `~` expanded.
    pub fn store_root(&self) -> PathBuf {
        path::expand_tilde(&self.storage.root)
    }

    /// State directory (snapshots, application index) with `~` expanded.
    pub fn state_dir(&self) -> PathBuf {
        path::expand_tilde(&self.storage.state_dir)
    }

    /// Directory holding coordination lock files.
    pub fn lock_dir(&self) -> PathBuf {
        match &self.lock.lock_dir {
            Some(dir) => path::expand_tilde(dir),
            None => self.state_dir().join("locks"),
        }
    }

    /// Where the registry snapshot of `app_id` is kept.
    pub fn snapshot_path(&self, app_id: &str) -> PathBuf {
        self.state_dir().join("snapshots").join(format!("{}.txt", app_id))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Content-addressed blob root
    pub root: PathBuf,
    /// Registry snapshots and application index
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.fdist/files"),
            state_dir: PathBuf::from("~/.fdist/state"),
        }
    }
}

/// File registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Hosted deployments refuse URI registrations
    pub hosted: bool,
    pub download_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            hosted: false,
            download_timeout_secs: 60,
        }
    }
}

impl RegistryConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_secs: u64,
    /// Shared directory for lock files (None = `<state_dir>/locks`)
    pub lock_dir: Option<PathBuf>,
    /// Lock scope guarding store mutations
    pub scope: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            lock_dir: None,
            scope: "filedistribution".to_string(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// File server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Concurrent fetch workers (None = number of CPUs)
    pub workers: Option<usize>,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 19070,
            workers: None,
            max_frame_bytes: 256 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Distribution notifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl NotifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Unused file retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub interval_secs: u64,
    pub max_unused_age_secs: u64,
    /// Newest unused references that are never deleted
    pub keep_at_least: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            max_unused_age_secs: 14 * 24 * 3600,
            keep_at_least: 0,
        }
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_unused_age(&self) -> Duration {
        Duration::from_secs(self.max_unused_age_secs)
    }
}

/// Application package re-download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedownloadConfig {
    pub interval_secs: u64,
    /// Other controller replicas as `host:port`
    pub peers: Vec<String>,
}

impl Default for RedownloadConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            peers: Vec::new(),
        }
    }
}

impl RedownloadConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Peers as `(host, port)` pairs.
    pub fn peer_addrs(&self) -> Result<Vec<(String, u16)>, ConfigError> {
        self.peers
            .iter()
            .map(|peer| {
                if let Ok(addr) = peer.parse::<SocketAddr>() {
                    return Ok((addr.ip().to_string(), addr.port()));
                }
                let (host, port) = peer
                    .rsplit_once(':')
                    .ok_or_else(|| ConfigError::InvalidPeer(peer.clone()))?;
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidPeer(peer.clone()))?;
                Ok((host.to_string(), port))
            })
            .collect()
    }
}
