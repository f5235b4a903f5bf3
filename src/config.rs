//! Configuration management for Floodgate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file,
//! then `FLOODGATE__`-prefixed environment variables using `__` between
//! nested keys (e.g. `FLOODGATE__STORE__BACKEND=redis`).

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{SlidingWindowMode, UserId};
use crate::store::RedisStoreConfig;

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission algorithm settings
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Initial rule registry contents
    #[serde(default)]
    pub rules: RulesConfig,

    /// Path to the policy book
    #[serde(default)]
    pub policies_path: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Serve over TLS when set
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            tls: None,
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// PEM files for the gRPC server.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Which quota store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; quotas are not shared between instances
    #[default]
    Memory,
    /// Redis store shared by every instance
    Redis,
}

/// Quota store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace prepended to every scope key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each store call in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "floodgate:".to_string()
}

fn default_command_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Settings for [`crate::store::RedisStore::connect`].
    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
            command_timeout: self.command_timeout(),
        }
    }
}

/// Admission algorithm settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub sliding_window_mode: SlidingWindowMode,
}

/// Initial contents of the rule registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Global switch; when false every request is allowed
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub user_whitelist: Vec<UserId>,

    #[serde(default)]
    pub ip_whitelist: Vec<String>,

    #[serde(default)]
    pub ip_blacklist: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            user_whitelist: Vec::new(),
            ip_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const ENV_PREFIX: &str = "FLOODGATE";

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("rules.user_whitelist")
        .with_list_parse_key("rules.ip_whitelist")
        .with_list_parse_key("rules.ip_blacklist")
}

impl FloodgateConfig {
    /// Load configuration from an optional file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    /// Load configuration from a YAML file, without the environment overlay.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with(
            Some(path.as_ref()),
            environment().source(Some(Default::default())),
        )
    }

    fn load_with(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        let config: FloodgateConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.store.command_timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(FloodgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if let Some(tls) = &self.server.tls {
            if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
                return Err(FloodgateError::Config(
                    "server.tls needs both cert_path and key_path".to_string(),
                ));
            }
        }
        Ok(())
    }
}
