//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the streaming gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, TLS, connection cap).
    pub listener: ListenerConfig,

    /// Proxy routes mapping inbound paths to downstream services.
    pub routes: Vec<RouteConfig>,

    /// Downstream idle and connect timeouts.
    pub timeouts: TimeoutConfig,

    /// Downstream connection pool settings.
    pub pool: PoolConfig,

    /// Default circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent inbound connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// A proxy route: inbound path template to downstream service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match, case-insensitive).
    #[serde(default)]
    pub host: Option<String>,

    /// Inbound path template, e.g. "/proxy/{id}". A trailing "/{*rest}"
    /// captures the remainder of the path.
    pub path: String,

    /// Methods this route accepts. Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Downstream base URL, e.g. "http://10.0.0.5:9000" or "https://api.internal".
    pub downstream: String,

    /// Downstream path template using the inbound path variables,
    /// e.g. "/backend/{id}".
    pub downstream_path: String,

    /// Skip circuit breaker bookkeeping for this route.
    #[serde(default)]
    pub disable_breaker: bool,
}

/// Timeout configuration for downstream calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Max gap without downstream traffic while a call is active, in milliseconds.
    pub active_call_idle_ms: u64,

    /// Max time an unused pooled connection stays open, in milliseconds.
    pub pool_idle_ms: u64,

    /// Connection establishment timeout in milliseconds.
    pub connect_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            active_call_idle_ms: 5_000,
            pool_idle_ms: 60_000,
            connect_ms: 2_000,
        }
    }
}

/// Downstream connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum open connections per downstream destination.
    pub max_connections_per_destination: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_destination: 100,
        }
    }
}

/// Default per-host circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,

    /// Time the breaker stays open before allowing a probe, in milliseconds.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 20,
            reset_timeout_ms: 15_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Log every downstream call phase transition at DEBUG.
    pub debug_lifecycle_logging: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            debug_lifecycle_logging: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [[routes]]
            name = "items"
            path = "/proxy/{id}"
            downstream = "http://127.0.0.1:9000"
            downstream_path = "/backend/{id}"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.timeouts.active_call_idle_ms, 5_000);
        assert_eq!(config.routes.len(), 1);
        assert!(!config.routes[0].disable_breaker);
        assert!(config.routes[0].methods.is_empty());
        assert_eq!(config.observability.log_format, LogFormat::Text);
    }

    #[test]
    fn json_log_format_parses() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [observability]
            log_format = "json"
            debug_lifecycle_logging = true
            "#,
        )
        .unwrap();
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert!(config.observability.debug_lifecycle_logging);
    }
}
