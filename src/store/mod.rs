//! Remote hierarchical store subsystem.
//!
//! # Data Flow
//! ```text
//! remote namespace (etcd v2 keys API, or in-memory)
//!     → KvBackend::fetch (one recursive, ordered round-trip per subtree)
//!     → HierarchicalStore (per-operation subtree cache, typed reads)
//!     → topology decode
//!
//! Change notifications:
//!     KvBackend::watch → ChangeFeed::next → Configurator change loop
//! ```
//!
//! # Design Decisions
//! - A fetched subtree is owned by exactly one HierarchicalStore; there is no
//!   process-wide cache, so every logical read sees a fresh snapshot
//! - Absence is a value in listings and an error in single-value reads
//! - Backend and feed are object-safe traits so the memory backend can stand
//!   in for etcd in tests and local runs

pub mod error;
pub mod etcd;
pub mod hierarchical;
pub mod key;
pub mod memory;
pub mod node;

use std::fmt;

use async_trait::async_trait;

pub use error::StoreError;
pub use etcd::EtcdBackend;
pub use hierarchical::HierarchicalStore;
pub use memory::MemoryBackend;
pub use node::{Node, NodeKind, Pair, Tree};

/// Kind of mutation reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
    Expire,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Expire => "expire",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: String,
    pub action: Action,
    /// Store index of the mutation; strictly increasing across the namespace.
    pub index: u64,
}

/// Read access to the remote namespace.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch `key` together with its whole subtree, children ordered by name.
    ///
    /// An absent key is not an error: the tree has no node but still carries
    /// the store index, so a watch can start from it.
    async fn fetch(&self, key: &str) -> Result<Tree, StoreError>;

    /// Open a feed of every change below `prefix` with an index greater than
    /// `after_index`.
    async fn watch(&self, prefix: &str, after_index: u64)
        -> Result<Box<dyn ChangeFeed>, StoreError>;
}

/// Ordered stream of remote mutations.
///
/// `next` may block indefinitely. Implementations must be cancel-safe:
/// dropping a pending `next` future never loses a change, so the consumer can
/// race it against a shutdown signal.
#[async_trait]
pub trait ChangeFeed: Send {
    async fn next(&mut self) -> Result<Change, StoreError>;
}
