//! Client configuration.
//!
//! [`ClientConfig`] is deserialized from JSON (every field has a default) and
//! can be adjusted with the `with_*` builders. Durations are in milliseconds.
//!
//! # Example
//!
//! ```
//! use fabric_client::{ClientConfig, LoadBalancingStrategy, WireProtocol};
//!
//! let config = ClientConfig::from_json_str(r#"{
//!     "hosts": ["10.0.0.1:8529", "10.0.0.2:8529"],
//!     "protocol": "vst",
//!     "load_balancing": "round_robin",
//!     "credentials": {"user": "root", "password": "secret"}
//! }"#).unwrap();
//!
//! assert_eq!(config.protocol, WireProtocol::Vst);
//! assert_eq!(config.load_balancing, LoadBalancingStrategy::RoundRobin);
//! assert_eq!(config.effective_max_connections(), 1);
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fabric_common::auth::{Credentials, DEFAULT_TENANT};
use fabric_common::protocol::error::{FabricError, Result};
use fabric_common::transport::DEFAULT_CHUNK_SIZE;
use fabric_common::HostDescription;
use serde::Deserialize;

use crate::pool::PoolConfig;

/// Wire protocol used to talk to coordinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireProtocol {
    #[default]
    Http,
    Vst,
}

impl WireProtocol {
    pub fn default_max_connections(&self) -> usize {
        match self {
            WireProtocol::Http => 20,
            WireProtocol::Vst => 1,
        }
    }
}

/// Host selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Sticky host with fallback
    #[default]
    None,
    Random,
    RoundRobin,
}

/// Configuration for retry logic with exponential backoff.
///
/// Transient failures (unknown host, no response, 5xx) are retried against
/// the same host. Each retry waits `backoff_multiplier` times longer than the
/// previous one; retrying stops after `max_retries` or once the next wait
/// would exceed `max_backoff_ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    ///
    /// Default: 3
    pub max_retries: usize,
    /// Initial backoff in milliseconds
    ///
    /// Default: 50ms
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    ///
    /// Default: 5000ms (5 seconds)
    pub max_backoff_ms: u64,
    /// Exponential backoff multiplier
    ///
    /// Default: 2.0 (doubles each time)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn next_backoff_ms(&self, current_ms: u64) -> u64 {
        (current_ms as f64 * self.backoff_multiplier) as u64
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seed hosts as `host:port` or `scheme://host:port`
    pub hosts: Vec<String>,
    pub protocol: WireProtocol,
    pub load_balancing: LoadBalancingStrategy,
    /// Connections per host; defaults to 20 for HTTP and 1 for VST
    pub max_connections: Option<usize>,
    pub connection_ttl_ms: Option<u64>,
    /// Request timeout, 0 waits forever
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Pool acquisition timeout, 0 waits forever
    pub acquire_timeout_ms: u64,
    /// Discover the cluster's endpoints after the first successful call
    pub acquire_host_list: bool,
    pub acquire_host_list_interval_ms: u64,
    /// Full cycles over the host list before a fallback handler gives up
    pub max_iterations: usize,
    pub retry: RetryConfig,
    pub max_redirects: usize,
    /// Payload bytes per VST chunk
    pub chunk_size: usize,
    pub use_ssl: bool,
    #[serde(skip)]
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub credentials: Credentials,
    pub default_tenant: String,
    pub default_database: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:8529".to_string()],
            protocol: WireProtocol::Http,
            load_balancing: LoadBalancingStrategy::None,
            max_connections: None,
            connection_ttl_ms: None,
            timeout_ms: 0,
            connect_timeout_ms: 5000,
            acquire_timeout_ms: 30000,
            acquire_host_list: false,
            acquire_host_list_interval_ms: 60 * 60 * 1000,
            max_iterations: crate::handler::DEFAULT_MAX_ITERATIONS,
            retry: RetryConfig::default(),
            max_redirects: 5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            use_ssl: false,
            tls: None,
            credentials: Credentials::default(),
            default_tenant: DEFAULT_TENANT.to_string(),
            default_database: "_system".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FabricError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            FabricError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_protocol(mut self, protocol: WireProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_load_balancing(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing = strategy;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_acquire_host_list(mut self, enabled: bool, interval_ms: u64) -> Self {
        self.acquire_host_list = enabled;
        self.acquire_host_list_interval_ms = interval_ms;
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.use_ssl = true;
        self.tls = Some(tls);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(FabricError::Config("at least one host is required".to_string()));
        }
        if self.max_connections == Some(0) {
            return Err(FabricError::Config("max_connections must be positive".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(FabricError::Config("max_iterations must be positive".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(FabricError::Config("chunk_size must be positive".to_string()));
        }
        self.host_descriptions().map(|_| ())
    }

    pub fn host_descriptions(&self) -> Result<Vec<HostDescription>> {
        self.hosts.iter().map(|h| HostDescription::parse(h)).collect()
    }

    pub fn effective_max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| self.protocol.default_max_connections())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acquire_host_list_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_host_list_interval_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.effective_max_connections(),
            acquire_timeout_ms: self.acquire_timeout_ms,
            connection_ttl_ms: self.connection_ttl_ms,
        }
    }
}
