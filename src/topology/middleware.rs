//! Middleware kind registry.
//!
//! The control plane does not run middlewares; it only needs to know whether
//! a kind exists and whether its config is acceptable before handing it to
//! the server.

use std::collections::BTreeMap;

use serde_json::Value;

/// Config check for one middleware kind.
pub type ConfigCheck = fn(&Value) -> Result<(), String>;

#[derive(Debug, Clone)]
pub struct MiddlewareRegistry {
    kinds: BTreeMap<String, ConfigCheck>,
    /// Reject kinds that were never registered.
    strict: bool,
}

impl MiddlewareRegistry {
    /// Registry with the built-in kinds that accepts unknown kinds as is.
    pub fn permissive() -> Self {
        Self::builtin(false)
    }

    /// Registry with the built-in kinds that rejects unknown kinds.
    pub fn strict() -> Self {
        Self::builtin(true)
    }

    fn builtin(strict: bool) -> Self {
        let mut registry = Self {
            kinds: BTreeMap::new(),
            strict,
        };
        registry.register("ratelimit", check_ratelimit);
        registry.register("connlimit", check_connlimit);
        registry
    }

    pub fn register(&mut self, kind: &str, check: ConfigCheck) -> &mut Self {
        self.kinds.insert(kind.to_string(), check);
        self
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn validate(&self, kind: &str, config: &Value) -> Result<(), String> {
        match self.kinds.get(kind) {
            Some(check) => check(config),
            None if self.strict => Err(format!("unknown middleware type '{}'", kind)),
            None => Ok(()),
        }
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::permissive()
    }
}

fn positive_field(config: &Value, field: &str) -> Result<u64, String> {
    match config.get(field).and_then(Value::as_u64) {
        Some(n) if n > 0 => Ok(n),
        _ => Err(format!("'{}' must be a positive integer", field)),
    }
}

fn check_ratelimit(config: &Value) -> Result<(), String> {
    positive_field(config, "requests")?;
    positive_field(config, "period_secs")?;
    Ok(())
}

fn check_connlimit(config: &Value) -> Result<(), String> {
    positive_field(config, "connections").map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_kinds_check_config() {
        let registry = MiddlewareRegistry::permissive();
        assert!(registry.validate("ratelimit", &json!({"requests": 10, "period_secs": 1})).is_ok());
        assert!(registry.validate("ratelimit", &json!({"requests": 0, "period_secs": 1})).is_err());
        assert!(registry.validate("connlimit", &json!({})).is_err());
    }

    #[test]
    fn unknown_kinds_depend_on_mode() {
        assert!(MiddlewareRegistry::permissive().validate("auth", &Value::Null).is_ok());
        assert!(MiddlewareRegistry::strict().validate("auth", &Value::Null).is_err());

        let mut registry = MiddlewareRegistry::strict();
        registry.register("auth", |_| Ok(()));
        assert!(registry.is_registered("auth"));
        assert!(registry.validate("auth", &Value::Null).is_ok());
    }
}
