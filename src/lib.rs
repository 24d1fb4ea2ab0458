//! Proxy control plane library.
//!
//! Keeps a reverse proxy's routing state in line with a hierarchical
//! key-value namespace: hosts with listeners, upstreams with endpoints, and
//! locations with middleware chains.

// Data access
pub mod secret;
pub mod store;
pub mod topology;

// Synchronization
pub mod server;
pub mod sync;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::ControlConfig;
pub use lifecycle::Shutdown;
pub use server::{RoutingTable, Server};
pub use store::{HierarchicalStore, KvBackend};
pub use sync::{Configurator, SyncOptions};
