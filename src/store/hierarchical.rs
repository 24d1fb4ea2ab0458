//! Lazy, subtree-caching reader over the remote namespace.
//!
//! # Responsibilities
//! - Fetch a hint key's whole subtree in one round-trip
//! - Serve reads below any fetched prefix from the cached tree
//! - Provide absence-tolerant listings and typed single-value reads
//! - Unseal sensitive leaves through the configured secret box
//!
//! # Design Decisions
//! - One instance per logical operation (a full load, one change); the
//!   remote tree may change between operations, so nothing is shared
//! - Absent subtrees are cached too: a key below a prefix known to be
//!   missing is answered without a round-trip
//! - Backend failures are retried per [`RetryPolicy`]; `NotFound` never is

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::resilience::RetryPolicy;
use crate::secret::{SealedValue, SecretBox};
use crate::store::{key, KvBackend, Node, Pair, StoreError};

/// Read-optimized accessor scoped to one logical read batch.
pub struct HierarchicalStore<'a> {
    backend: &'a dyn KvBackend,
    secrets: Option<&'a SecretBox>,
    retry: RetryPolicy,
    /// Fetched root key → subtree, `None` when the root did not exist.
    fetched: BTreeMap<String, Option<Node>>,
    round_trips: usize,
    observed_index: u64,
}

impl<'a> HierarchicalStore<'a> {
    /// Create a store without fetching anything yet.
    pub fn new(backend: &'a dyn KvBackend) -> Self {
        Self {
            backend,
            secrets: None,
            retry: RetryPolicy::none(),
            fetched: BTreeMap::new(),
            round_trips: 0,
            observed_index: 0,
        }
    }

    /// Create a store and eagerly fetch the subtree under `hint_key`.
    pub async fn open(backend: &'a dyn KvBackend, hint_key: &str) -> Result<Self, StoreError> {
        Self::new(backend).prefetch(hint_key).await
    }

    pub fn with_secrets(mut self, secrets: Option<&'a SecretBox>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch and cache the subtree under `hint_key` unless already covered.
    pub async fn prefetch(mut self, hint_key: &str) -> Result<Self, StoreError> {
        let hint = key::normalize(hint_key);
        if self.cached_root(&hint).is_none() {
            self.fetch(&hint).await?;
        }
        Ok(self)
    }

    /// Number of backend fetches issued by this instance.
    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    /// Highest store index seen across all fetches.
    pub fn observed_index(&self) -> u64 {
        self.observed_index
    }

    /// Resolve `key` to its node, fetching its subtree if no cached prefix
    /// covers it.
    pub async fn get_node(&mut self, key: &str) -> Result<&Node, StoreError> {
        let key = key::normalize(key);
        let root = match self.cached_root(&key) {
            Some(root) => root,
            None => {
                self.fetch(&key).await?;
                key.clone()
            }
        };
        match self.fetched.get(&root) {
            Some(Some(node)) => node.find(&key).ok_or_else(|| StoreError::not_found(&key)),
            _ => Err(StoreError::not_found(&key)),
        }
    }

    /// Leaf value at `key`. Directories count as not found.
    pub async fn get_val(&mut self, key: &str) -> Result<String, StoreError> {
        let node = self.get_node(key).await?;
        match node.value() {
            Some(value) => Ok(value.to_string()),
            None => Err(StoreError::not_found(node.key.clone())),
        }
    }

    /// Leaf children of directory `key`. Empty when `key` is absent or a leaf.
    pub async fn get_vals(&mut self, key: &str) -> Result<Vec<Pair>, StoreError> {
        let node = match self.get_node(key).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(node
            .children()
            .filter_map(|child| child.value().map(|value| Pair::new(child.key.clone(), value)))
            .collect())
    }

    /// Keys of the directory children of `key`. Empty when `key` is absent or
    /// a leaf.
    pub async fn get_dirs(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        let node = match self.get_node(key).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(node
            .children()
            .filter(|child| child.is_dir())
            .map(|child| child.key.clone())
            .collect())
    }

    /// Read the envelope at `key` and open it with the secret box.
    pub async fn get_sealed_val(&mut self, key: &str) -> Result<Vec<u8>, StoreError> {
        let secrets = self.secrets.ok_or_else(|| StoreError::EncryptionUnavailable {
            key: key.to_string(),
        })?;
        let raw = self.get_val(key).await?;
        let sealed =
            SealedValue::from_json(raw.as_bytes()).map_err(|e| StoreError::decode(key, e))?;
        secrets.open(&sealed).map_err(|source| StoreError::Secret {
            key: key.to_string(),
            source,
        })
    }

    /// Read the leaf at `key` and decode it as JSON into `T`.
    pub async fn get_json_val<T: DeserializeOwned>(&mut self, key: &str) -> Result<T, StoreError> {
        let raw = self.get_val(key).await?;
        serde_json::from_str(&raw).map_err(|e| StoreError::decode(key, e))
    }

    /// `Ok(())` when `key` exists as a leaf or a directory.
    pub async fn check_key_exists(&mut self, key: &str) -> Result<(), StoreError> {
        self.get_node(key).await.map(|_| ())
    }

    /// Longest fetched root that covers `key`.
    fn cached_root(&self, key: &str) -> Option<String> {
        self.fetched
            .keys()
            .filter(|root| key::is_within(key, root))
            .max_by_key(|root| root.len())
            .cloned()
    }

    async fn fetch(&mut self, key: &str) -> Result<(), StoreError> {
        let backend = self.backend;
        let result = self.retry.run(key, || backend.fetch(key)).await;
        self.round_trips += 1;

        let tree = result?;
        tracing::trace!(key, index = tree.index, found = tree.node.is_some(), "Fetched subtree");
        self.observed_index = self.observed_index.max(tree.index);
        self.fetched.insert(key.to_string(), tree.node);
        Ok(())
    }
}
