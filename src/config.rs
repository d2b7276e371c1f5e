//! Configuration management for Tollgate.
//!
//! Configuration is loaded once at startup from an optional YAML file,
//! overlaid with `TOLLGATE__<SECTION>__<FIELD>` environment variables, and
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Prefix of environment variables recognised by [`TollgateConfig::load`].
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota and window configuration
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Counter/block store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Trust `X-Forwarded-For` / `X-Real-IP` for client address resolution.
    ///
    /// Only enable behind a proxy that overwrites these headers, otherwise
    /// clients can pick their own identity key.
    #[serde(default)]
    pub trust_proxy: bool,

    /// Request header carrying the optional access token
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_proxy: false,
            token_header: default_token_header(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

/// Quota, window and block settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests admitted per window for an IP identity
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Requests admitted per window for a token identity
    #[serde(default = "default_max_token_requests")]
    pub max_token_requests: u64,

    /// Window length in seconds; zero is read as one
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How long an identity stays blocked after exceeding its quota
    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            max_token_requests: default_max_token_requests(),
            window_secs: default_window_secs(),
            block_duration_secs: default_block_duration_secs(),
        }
    }
}

impl LimitsConfig {
    /// Shortest window that can be configured, also used when the window is zero.
    pub const MIN_WINDOW: Duration = Duration::from_secs(1);

    /// Upper bound for `window_secs` and `block_duration_secs` (one year).
    pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

    /// Window duration, applying the zero-means-one-second rule.
    pub fn window(&self) -> Duration {
        if self.window_secs == 0 {
            Self::MIN_WINDOW
        } else {
            Duration::from_secs(self.window_secs)
        }
    }

    /// Block duration.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

fn default_max_requests() -> u64 {
    10
}

fn default_max_token_requests() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    1
}

fn default_block_duration_secs() -> u64 {
    300
}

/// Which store implementation backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map; state is not shared between processes
    #[default]
    Memory,
    /// Redis server shared by every process
    Redis,
}

/// Counter/block store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Eviction sweep interval for the memory store, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Deadline for a single store call in milliseconds (0 disables it)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            sweep_interval_ms: default_sweep_interval_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Per-call store deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Memory store sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    500
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file overlaid with the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    fn load_from(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder
                .add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(env);

        let config: TollgateConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limits.block_duration_secs == 0 {
            return Err(TollgateError::Config(
                "limits.block_duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.limits.window_secs > LimitsConfig::MAX_DURATION_SECS {
            return Err(TollgateError::Config(format!(
                "limits.window_secs must be at most {}",
                LimitsConfig::MAX_DURATION_SECS
            )));
        }
        if self.limits.block_duration_secs > LimitsConfig::MAX_DURATION_SECS {
            return Err(TollgateError::Config(format!(
                "limits.block_duration_secs must be at most {}",
                LimitsConfig::MAX_DURATION_SECS
            )));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(TollgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}
