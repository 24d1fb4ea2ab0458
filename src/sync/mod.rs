//! Synchronization subsystem: keeps the server in line with the namespace.
//!
//! # Data Flow
//! ```text
//! Configurator::start
//!     → Reconciler::load (one HierarchicalStore over the root, apply by kind)
//!     → KvBackend::watch(root, observed index)
//!     → spawned change loop:
//!         select { shutdown, ChangeFeed::next }
//!         → Reconciler::handle (classify, re-read scope, diff, apply)
//!         → fatal error → one-shot failure channel
//!
//! Configurator::stop(graceful)
//!     graceful:  shutdown signal → join loop → Server::stop(drain = true)
//!     immediate: abort loop → Server::stop(drain = false)
//! ```
//!
//! # Design Decisions
//! - The reconciler is moved into the loop task and is the only writer of
//!   the topology; readers get published `Arc<Topology>` snapshots
//! - Events are applied strictly one at a time in delivery order
//! - A location that is not fully written, or whose host or upstream is not
//!   applied yet, is deferred rather than failing the loop

pub mod configurator;
pub mod error;
pub mod reconcile;

pub use configurator::{Configurator, ConfiguratorState, SyncOptions};
pub use error::SyncError;
pub use reconcile::Reconciler;
