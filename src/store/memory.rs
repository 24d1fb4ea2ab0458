//! In-process backend.
//!
//! Holds the namespace as a [`Node`] tree behind a mutex and keeps a bounded
//! history of changes so that feeds can resume from an older index, the way
//! etcd does. Used for local runs without an etcd cluster and as the test
//! double for everything above the store.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::store::{key, Action, Change, ChangeFeed, KvBackend, Node, NodeKind, StoreError, Tree};

/// Changes retained for feed replay.
const HISTORY_LIMIT: usize = 1000;

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Change>,
}

struct State {
    root: Node,
    index: u64,
    history: VecDeque<Change>,
    /// Highest index dropped from `history`.
    cleared_through: u64,
    watchers: Vec<Watcher>,
    round_trips: usize,
    failing_fetches: u32,
}

impl State {
    fn record(&mut self, key: &str, action: Action) -> u64 {
        let change = Change {
            key: key.to_string(),
            action,
            index: self.index,
        };
        tracing::trace!(key, %action, index = self.index, "Memory store mutation");

        self.watchers.retain(|w| {
            !key::is_within(&change.key, &w.prefix) || w.tx.send(change.clone()).is_ok()
        });

        self.history.push_back(change);
        if self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.cleared_through = dropped.index;
            }
        }
        self.index
    }
}

/// Namespace kept in memory. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                root: Node::dir("/", 0),
                index: 0,
                history: VecDeque::new(),
                cleared_through: 0,
                watchers: Vec::new(),
                round_trips: 0,
                failing_fetches: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a leaf, creating missing parent directories. Returns the index of
    /// the change.
    pub fn set(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let key = key::normalize(key);
        let mut state = self.lock();
        let index = state.index + 1;

        let (name, parents) = split_key(&key)?;
        let children = ensure_dir(&mut state.root, &parents, index)?;
        let action = match children.get(name).map(Node::is_dir) {
            Some(true) => {
                return Err(StoreError::Backend(format!("'{}' is a directory", key)));
            }
            Some(false) => Action::Update,
            None => Action::Create,
        };
        children.insert(name.to_string(), Node::leaf(&key, value, index));

        state.index = index;
        Ok(state.record(&key, action))
    }

    /// Create an empty directory, creating missing parents.
    pub fn mkdir(&self, key: &str) -> Result<u64, StoreError> {
        let key = key::normalize(key);
        let mut state = self.lock();
        let index = state.index + 1;

        let (name, parents) = split_key(&key)?;
        let children = ensure_dir(&mut state.root, &parents, index)?;
        if children.contains_key(name) {
            return Err(StoreError::Backend(format!("'{}' already exists", key)));
        }
        children.insert(name.to_string(), Node::dir(&key, index));

        state.index = index;
        Ok(state.record(&key, Action::Create))
    }

    /// Remove a leaf or a whole directory.
    pub fn delete(&self, key: &str) -> Result<u64, StoreError> {
        self.remove(key, Action::Delete)
    }

    /// Remove a key as if its TTL ran out.
    pub fn expire(&self, key: &str) -> Result<u64, StoreError> {
        self.remove(key, Action::Expire)
    }

    fn remove(&self, key: &str, action: Action) -> Result<u64, StoreError> {
        let key = key::normalize(key);
        let mut state = self.lock();

        let (name, parents) = split_key(&key)?;
        let removed = dir_children_mut(&mut state.root, &parents)
            .and_then(|children| children.remove(name));
        if removed.is_none() {
            return Err(StoreError::not_found(&key));
        }

        state.index += 1;
        Ok(state.record(&key, action))
    }

    /// Index of the latest change.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// Number of `fetch` calls served, failed ones included.
    pub fn round_trips(&self) -> usize {
        self.lock().round_trips
    }

    /// Make the next `n` fetches fail with a backend error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.lock().failing_fetches = n;
    }

    /// End every open feed. Their next `next()` returns
    /// [`StoreError::FeedClosed`] once buffered changes are drained.
    pub fn close_feeds(&self) {
        self.lock().watchers.clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn fetch(&self, key: &str) -> Result<Tree, StoreError> {
        let key = key::normalize(key);
        let mut state = self.lock();
        state.round_trips += 1;

        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(StoreError::Backend(format!("injected failure reading '{}'", key)));
        }

        Ok(Tree {
            node: state.root.find(&key).cloned(),
            index: state.index,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        after_index: u64,
    ) -> Result<Box<dyn ChangeFeed>, StoreError> {
        let prefix = key::normalize(prefix);
        let mut state = self.lock();

        if after_index < state.cleared_through {
            return Err(StoreError::Backend(format!(
                "event index cleared: requested {}, oldest retained {}",
                after_index + 1,
                state.cleared_through + 1
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for change in state.history.iter() {
            if change.index > after_index && key::is_within(&change.key, &prefix) {
                let _ = tx.send(change.clone());
            }
        }
        state.watchers.push(Watcher { prefix, tx });

        Ok(Box::new(MemoryFeed { rx }))
    }
}

/// Feed over a [`MemoryBackend`].
pub struct MemoryFeed {
    rx: mpsc::UnboundedReceiver<Change>,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next(&mut self) -> Result<Change, StoreError> {
        self.rx.recv().await.ok_or(StoreError::FeedClosed)
    }
}

fn split_key(key: &str) -> Result<(&str, Vec<&str>), StoreError> {
    let mut segments: Vec<&str> = key::segments(key).collect();
    match segments.pop() {
        Some(name) => Ok((name, segments)),
        None => Err(StoreError::Backend("the root key cannot be modified".to_string())),
    }
}

/// Children of the directory at `path`, creating missing directories.
fn ensure_dir<'n>(
    root: &'n mut Node,
    path: &[&str],
    index: u64,
) -> Result<&'n mut BTreeMap<String, Node>, StoreError> {
    let mut node = root;
    for segment in path {
        let parent_key = node.key.clone();
        let children = match &mut node.kind {
            NodeKind::Dir(children) => children,
            NodeKind::Leaf(_) => {
                return Err(StoreError::Backend(format!("'{}' is not a directory", parent_key)));
            }
        };
        node = children
            .entry(segment.to_string())
            .or_insert_with(|| Node::dir(&key::join(&parent_key, segment), index));
    }
    let dir_key = node.key.clone();
    match &mut node.kind {
        NodeKind::Dir(children) => Ok(children),
        NodeKind::Leaf(_) => Err(StoreError::Backend(format!("'{}' is not a directory", dir_key))),
    }
}

fn dir_children_mut<'n>(
    root: &'n mut Node,
    path: &[&str],
) -> Option<&'n mut BTreeMap<String, Node>> {
    let mut node = root;
    for segment in path {
        node = match &mut node.kind {
            NodeKind::Dir(children) => children.get_mut(*segment)?,
            NodeKind::Leaf(_) => return None,
        };
    }
    match &mut node.kind {
        NodeKind::Dir(children) => Some(children),
        NodeKind::Leaf(_) => None,
    }
}
