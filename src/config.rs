//! Configuration management for Turnstile.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `TURNSTILE__`-prefixed environment variables (`TURNSTILE__STORE__URL`,
//! `TURNSTILE__RATE_LIMITING__LIMIT`, ...). `REDIS_URL` and `PORT` are
//! honoured when the prefixed variables are absent.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{FailurePolicy, FixedWindow, DEFAULT_KEY_PREFIX};
use crate::store::RedisStoreConfig;

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5001))
}

/// Which counter store backs the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server
    #[default]
    Redis,
    /// In-process counters, for a single instance
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis URL (`redis://` or `rediss://`)
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Namespace prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Fixed delay between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    /// Keepalive ping interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

impl StoreConfig {
    /// Connection settings for the Redis store.
    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            url: self.url.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_command_timeout() -> u64 {
    250
}

fn default_reconnect_backoff() -> u64 {
    1000
}

fn default_keepalive_interval() -> u64 {
    300
}

/// How the caller identity is derived from a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentitySource {
    /// The TCP peer address
    #[default]
    PeerAddress,
    /// `X-Forwarded-For` / `X-Real-IP`, for deployments behind a proxy
    ForwardedFor,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Requests allowed per identity per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Caller identity source
    #[serde(default)]
    pub identity: IdentitySource,

    /// Behaviour while the counter store is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            limit: default_limit(),
            identity: IdentitySource::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_limit() -> u64 {
    100
}

impl TurnstileConfig {
    /// Load configuration from defaults, an optional YAML file, and the
    /// environment, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Yaml),
            );
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            builder = builder.set_default("store.url", url)?;
        }
        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|e| TurnstileError::Config(format!("invalid PORT {port:?}: {e}")))?;
            builder = builder.set_default(
                "server.http_addr",
                SocketAddr::from(([0, 0, 0, 0], port)).to_string(),
            )?;
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gate can not run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.limit == 0 {
            return Err(TurnstileError::Config(
                "rate_limiting.limit must be at least 1".to_string(),
            ));
        }
        FixedWindow::from_secs(self.rate_limiting.window_secs)?;

        if self.store.backend == StoreBackend::Redis {
            if self.store.url.is_empty() {
                return Err(TurnstileError::Config("store.url is required".to_string()));
            }
            if self.store.command_timeout_ms == 0 || self.store.connect_timeout_ms == 0 {
                return Err(TurnstileError::Config(
                    "store timeouts must be greater than zero".to_string(),
                ));
            }
            if self.store.keepalive_interval_secs == 0 {
                return Err(TurnstileError::Config(
                    "store.keepalive_interval_secs must be greater than zero".to_string(),
                ));
            }
        }

        Ok(())
    }
}
