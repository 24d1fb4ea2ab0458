//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, attempts > 0)
//! - Check that URLs, keys and addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ControlConfig → Result<(), Vec<ValidationError>>

use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{BackendKind, ControlConfig};
use crate::secret::Key;

/// One rejected configuration field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

pub fn validate_config(config: &ControlConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let store = &config.store;
    if store.backend == BackendKind::Etcd {
        if store.endpoints.is_empty() {
            errors.push(ValidationError::new("store.endpoints", "at least one endpoint is required"));
        }
        for endpoint in &store.endpoints {
            if let Err(e) = Url::parse(endpoint) {
                errors.push(ValidationError::new(
                    "store.endpoints",
                    format!("invalid URL '{}': {}", endpoint, e),
                ));
            }
        }
    }
    if store.root.trim_matches('/').is_empty() {
        errors.push(ValidationError::new("store.root", "must name a key below '/'"));
    }
    if store.request_timeout_secs == 0 {
        errors.push(ValidationError::new("store.request_timeout_secs", "must be greater than 0"));
    }

    if let Some(key) = &config.secrets.box_key {
        if let Err(e) = Key::from_hex(key) {
            errors.push(ValidationError::new("secrets.box_key", e.to_string()));
        }
    }

    if config.server.drain_timeout_secs == 0 {
        errors.push(ValidationError::new("server.drain_timeout_secs", "must be greater than 0"));
    }

    let retries = &config.retries;
    if retries.enabled {
        if retries.max_attempts == 0 {
            errors.push(ValidationError::new("retries.max_attempts", "must be greater than 0"));
        }
        if retries.base_delay_ms > retries.max_delay_ms {
            errors.push(ValidationError::new(
                "retries.base_delay_ms",
                "must not exceed retries.max_delay_ms",
            ));
        }
    }

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", observability.log_level),
        ));
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&ControlConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_error() {
        let mut config = ControlConfig::default();
        config.store.endpoints.clear();
        config.store.root = "/".to_string();
        config.retries.max_attempts = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["store.endpoints", "store.root", "retries.max_attempts"]
        );
    }

    #[test]
    fn memory_backend_needs_no_endpoints() {
        let mut config = ControlConfig::default();
        config.store.backend = BackendKind::Memory;
        config.store.endpoints.clear();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn rejects_bad_key_and_urls() {
        let mut config = ControlConfig::default();
        config.secrets.box_key = Some("not-hex".to_string());
        config.store.endpoints = vec!["::nope".to_string()];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field == "secrets.box_key"));
    }
}
