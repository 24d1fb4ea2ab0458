//! Proxy server subsystem: the contract the control plane drives.
//!
//! # Data Flow
//! ```text
//! sync::Reconciler
//!     → Server::upsert_* / delete_*   (one call per changed entity)
//!     → table.rs (RoutingTable: validate, mutate, publish snapshot)
//!     → ArcSwap<RoutingSnapshot> read lock-free by the data path
//!
//! Shutdown:
//!     Server::stop(drain) → connection.rs (wait for zero, bounded by timeout)
//! ```
//!
//! # Design Decisions
//! - Every mutation is idempotent; re-applying the same entity is a no-op
//! - Deletes of absent entities succeed
//! - A stopped server rejects every mutation

pub mod connection;
pub mod table;

use async_trait::async_trait;
use thiserror::Error;

use crate::topology::{EntityKind, Endpoint, Host, Listener, Location, Middleware, Upstream};

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use table::{RoutingSnapshot, RoutingTable, DEFAULT_LISTENER_ID};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("{kind} '{id}' rejected: {reason}")]
    Rejected {
        kind: &'static str,
        id: String,
        reason: String,
    },

    #[error("server is stopped")]
    Stopped,
}

impl ServerError {
    pub fn rejected(kind: EntityKind, id: &str, reason: impl Into<String>) -> Self {
        ServerError::Rejected {
            kind: kind.as_str(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Live-reconfigurable proxy server.
///
/// Implementations must be safe to call while traffic is flowing.
#[async_trait]
pub trait Server: Send + Sync {
    async fn upsert_host(&self, host: &Host) -> Result<(), ServerError>;
    async fn delete_host(&self, host_id: &str) -> Result<(), ServerError>;

    async fn upsert_listener(&self, listener: &Listener) -> Result<(), ServerError>;
    async fn delete_listener(&self, host_id: &str, listener_id: &str) -> Result<(), ServerError>;

    async fn upsert_upstream(&self, upstream: &Upstream) -> Result<(), ServerError>;
    async fn delete_upstream(&self, upstream_id: &str) -> Result<(), ServerError>;

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<(), ServerError>;
    async fn delete_endpoint(&self, upstream_id: &str, endpoint_id: &str)
        -> Result<(), ServerError>;

    async fn upsert_location(&self, location: &Location) -> Result<(), ServerError>;
    async fn delete_location(&self, location_id: &str) -> Result<(), ServerError>;

    async fn upsert_middleware(&self, middleware: &Middleware) -> Result<(), ServerError>;
    async fn delete_middleware(
        &self,
        location_id: &str,
        middleware_id: &str,
    ) -> Result<(), ServerError>;

    /// Stop serving. With `drain`, returns once active connections reach zero
    /// or the implementation's drain timeout passes; without, returns at once.
    async fn stop(&self, drain: bool);
}
