//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that downstream templates only use variables the inbound template binds
//! - Validate value ranges (timeouts > 0, limits > 0, addresses parse)
//! - Detect duplicate route names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::Method;

use crate::config::schema::{GatewayConfig, RouteConfig};
use crate::routing::matcher::PathTemplate;
use crate::routing::router::parse_downstream;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration, collecting every error found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("not a socket address: {}", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    for (field, value) in [
        ("timeouts.active_call_idle_ms", config.timeouts.active_call_idle_ms),
        ("timeouts.pool_idle_ms", config.timeouts.pool_idle_ms),
        ("timeouts.connect_ms", config.timeouts.connect_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.pool.max_connections_per_destination == 0 {
        errors.push(ValidationError::new(
            "pool.max_connections_per_destination",
            "must be greater than 0",
        ));
    }
    if config.circuit_breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be greater than 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("not a socket address: {}", config.observability.metrics_address),
        ));
    }

    let mut names = HashSet::new();
    for (i, route) in config.routes.iter().enumerate() {
        if !names.insert(route.name.as_str()) {
            errors.push(ValidationError::new(
                format!("routes[{i}].name"),
                format!("duplicate route name: {}", route.name),
            ));
        }
        validate_route(i, route, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_route(i: usize, route: &RouteConfig, errors: &mut Vec<ValidationError>) {
    let inbound = match PathTemplate::parse(&route.path) {
        Ok(t) => Some(t),
        Err(e) => {
            errors.push(ValidationError::new(format!("routes[{i}].path"), e.to_string()));
            None
        }
    };

    match PathTemplate::parse(&route.downstream_path) {
        Ok(downstream) => {
            if let Some(inbound) = inbound {
                for var in downstream.variables() {
                    if !inbound.variables().any(|v| v == var) {
                        errors.push(ValidationError::new(
                            format!("routes[{i}].downstream_path"),
                            format!("variable {{{var}}} is not bound by {}", route.path),
                        ));
                    }
                }
            }
        }
        Err(e) => errors.push(ValidationError::new(format!("routes[{i}].downstream_path"), e.to_string())),
    }

    if let Err(e) = parse_downstream(&route.downstream) {
        errors.push(ValidationError::new(format!("routes[{i}].downstream"), e.to_string()));
    }

    for method in &route.methods {
        if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
            errors.push(ValidationError::new(
                format!("routes[{i}].methods"),
                format!("invalid method: {method}"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, path: &str, downstream_path: &str) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            host: None,
            path: path.into(),
            methods: vec![],
            downstream: "http://127.0.0.1:9000".into(),
            downstream_path: downstream_path.into(),
            disable_breaker: false,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn collects_all_errors() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "nope".into();
        config.timeouts.connect_ms = 0;
        config.routes.push(route("r1", "/proxy/{id}", "/backend/{other}"));
        config.routes.push(route("r1", "/a", "/b"));

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"timeouts.connect_ms"));
        assert!(fields.contains(&"routes[0].downstream_path"));
        assert!(fields.contains(&"routes[1].name"));
    }

    #[test]
    fn rejects_bad_downstream_and_method() {
        let mut config = GatewayConfig::default();
        let mut r = route("r1", "/proxy/{id}", "/backend/{id}");
        r.downstream = "ftp://host".into();
        r.methods = vec!["GE T".into()];
        config.routes.push(r);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
