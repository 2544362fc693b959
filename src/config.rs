//! Configuration module
//!
//! Loads the sectioned TOML configuration file, with `AUTHZ_`-prefixed
//! environment variables overriding file values. Validation failures are
//! reported before startup so the binary can exit with the validation code.

use std::net::SocketAddr;

use serde::Deserialize;

use crate::domain::{DataElementKind, OperationKind};
use crate::sharding::{RoutingWindow, ShardClientConfig, ShardConfigurationItem};

/// Which surface this node serves: a shard node persists and answers locally,
/// a router node fronts the shard groups over the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerRole {
    Shard,
    Router,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    pub storage: StorageConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub buffering: BufferingConfig,

    #[serde(default)]
    pub caching: CachingConfig,

    /// Shard routing; required when the server role is `router`.
    #[serde(default)]
    pub routing: Option<RoutingConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub role: ServerRole,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            role: ServerRole::Shard,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

/// Retry budget for deadlock-class store errors and shard connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferingConfig {
    /// Queue length that triggers a flush.
    pub buffer_size_limit: usize,

    /// Interval between timer-driven flushes, in milliseconds.
    pub flush_loop_interval_ms: u64,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            buffer_size_limit: 200,
            flush_loop_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    /// Bound on the in-memory event cache.
    pub cached_event_count: usize,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            cached_event_count: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Interval between metric snapshot log lines, in milliseconds.
    pub log_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_interval_ms: 30_000,
        }
    }
}

/// One shard endpoint row in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardEndpoint {
    pub data_element_kind: DataElementKind,
    pub op_kind: OperationKind,
    pub hash_range_start: i32,
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub routing_initially_on: bool,

    pub data_element_kind: DataElementKind,
    pub source_range_start: i32,
    pub source_range_end: i32,
    pub target_range_start: i32,
    pub target_range_end: i32,

    /// Deadline applied to every outward shard call, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    pub source_shards: Vec<ShardEndpoint>,

    #[serde(default)]
    pub target_shards: Vec<ShardEndpoint>,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl RoutingConfig {
    pub fn window(&self) -> RoutingWindow {
        RoutingWindow {
            data_element_kind: self.data_element_kind,
            source_range_start: self.source_range_start,
            source_range_end: self.source_range_end,
            target_range_start: self.target_range_start,
            target_range_end: self.target_range_end,
        }
    }

    pub fn source_items(&self) -> Vec<ShardConfigurationItem> {
        self.items(&self.source_shards)
    }

    pub fn target_items(&self) -> Vec<ShardConfigurationItem> {
        self.items(&self.target_shards)
    }

    fn items(&self, shards: &[ShardEndpoint]) -> Vec<ShardConfigurationItem> {
        shards
            .iter()
            .map(|shard| ShardConfigurationItem {
                data_element_kind: shard.data_element_kind,
                op_kind: shard.op_kind,
                hash_range_start: shard.hash_range_start,
                client: ShardClientConfig {
                    base_url: shard.base_url.clone(),
                    request_timeout_ms: self.request_timeout_ms,
                },
            })
            .collect()
    }
}

impl Config {
    /// Load the configuration file, apply environment overrides, validate.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("AUTHZ").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "invalid server address {}:{}",
                    self.server.host, self.server.port
                ))
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.url.is_empty() {
            return Err(ConfigError::Invalid("storage.url must be set".to_string()));
        }
        if self.storage.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_connections must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.buffering.buffer_size_limit == 0 {
            return Err(ConfigError::Invalid(
                "buffering.buffer_size_limit must be at least 1".to_string(),
            ));
        }
        if self.buffering.flush_loop_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "buffering.flush_loop_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.caching.cached_event_count == 0 {
            return Err(ConfigError::Invalid(
                "caching.cached_event_count must be at least 1".to_string(),
            ));
        }
        if self.metrics.log_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "metrics.log_interval_ms must be at least 1".to_string(),
            ));
        }

        if self.server.role == ServerRole::Router {
            let routing = self.routing.as_ref().ok_or_else(|| {
                ConfigError::Invalid("router role requires a [routing] section".to_string())
            })?;
            routing.validate()?;
        }

        Ok(())
    }
}

impl RoutingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.source_shards.is_empty() {
            return Err(ConfigError::Invalid(
                "routing.source_shards must not be empty".to_string(),
            ));
        }
        self.window().validate().map_err(ConfigError::Invalid)?;

        for shard in self.source_shards.iter().chain(self.target_shards.iter()) {
            reqwest::Url::parse(&shard.base_url).map_err(|e| {
                ConfigError::Invalid(format!("invalid shard URL {}: {}", shard.base_url, e))
            })?;
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
