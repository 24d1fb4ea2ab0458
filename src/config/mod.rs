//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ControlConfig (validated, immutable)
//!     → lifecycle::startup builds the backend, secret box and server from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the proxy topology itself lives in the
//!   remote store, not here
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackendKind, Consistency, ControlConfig, ObservabilityConfig, RetryConfig, SecretsConfig,
    ServerConfig, StoreConfig,
};
pub use validation::{validate_config, ValidationError};
