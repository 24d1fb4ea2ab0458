//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the control
//! plane. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ControlConfig {
    /// Remote store connection.
    pub store: StoreConfig,

    /// Key material for sealed values.
    pub secrets: SecretsConfig,

    /// Routing table settings.
    pub server: ServerConfig,

    /// Retry policy for store reads.
    pub retries: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Which store implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Etcd,
    /// Process-local namespace, empty at start. For local runs only.
    Memory,
}

/// Read consistency for etcd requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Reads go through quorum.
    #[default]
    Strong,
    /// Reads may be served by any member.
    Weak,
}

/// Remote store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,

    /// etcd member URLs, tried in order.
    pub endpoints: Vec<String>,

    /// Root key of the proxy namespace.
    pub root: String,

    pub consistency: Consistency,

    /// Timeout for a single non-watch request in seconds.
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            root: "/proxy".to_string(),
            consistency: Consistency::Strong,
            request_timeout_secs: 5,
        }
    }
}

/// Secret box configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SecretsConfig {
    /// Hex-encoded 32 byte key. Sealed values cannot be read without it.
    pub box_key: Option<String>,
}

/// Routing table configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface of the default listener.
    pub interface: String,

    /// Port of the default listener.
    pub port: u16,

    /// Install the default listener at startup.
    pub default_listener: bool,

    /// Upper bound on waiting for connections to drain, in seconds.
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 8181,
            default_listener: true,
            drain_timeout_secs: 30,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries.
    pub enabled: bool,

    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
