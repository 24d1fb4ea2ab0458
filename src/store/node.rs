//! Tree values returned by the remote store.

use std::collections::BTreeMap;

use crate::store::key;

/// A location in the remote namespace: a leaf value or a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Full, normalized key.
    pub key: String,
    /// Store index at which this node was last modified.
    pub index: u64,
    pub kind: NodeKind,
}

/// Leaf or directory payload of a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Leaf(String),
    /// Children keyed by their last path segment.
    Dir(BTreeMap<String, Node>),
}

impl Node {
    pub fn leaf(key: &str, value: impl Into<String>, index: u64) -> Self {
        Self {
            key: key::normalize(key),
            index,
            kind: NodeKind::Leaf(value.into()),
        }
    }

    pub fn dir(key: &str, index: u64) -> Self {
        Self {
            key: key::normalize(key),
            index,
            kind: NodeKind::Dir(BTreeMap::new()),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }

    /// Leaf value, `None` for directories.
    pub fn value(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Leaf(value) => Some(value),
            NodeKind::Dir(_) => None,
        }
    }

    /// Name of this node within its parent.
    pub fn name(&self) -> &str {
        key::base_name(&self.key)
    }

    /// Direct children in name order; empty for leaves.
    pub fn children(&self) -> impl Iterator<Item = &Node> {
        let children = match &self.kind {
            NodeKind::Dir(children) => Some(children.values()),
            NodeKind::Leaf(_) => None,
        };
        children.into_iter().flatten()
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        match &self.kind {
            NodeKind::Dir(children) => children.get(name),
            NodeKind::Leaf(_) => None,
        }
    }

    /// Insert a child, replacing any previous child of the same name.
    /// Has no effect on leaves.
    pub fn insert_child(&mut self, child: Node) {
        if let NodeKind::Dir(children) = &mut self.kind {
            children.insert(child.name().to_string(), child);
        }
    }

    /// Walk down from this node to `key`.
    ///
    /// Returns `None` when `key` is not below this node, when a segment is
    /// missing, or when an intermediate segment is a leaf.
    pub fn find(&self, key: &str) -> Option<&Node> {
        let path = key::relative(key, &self.key)?;
        let mut node = self;
        for segment in path {
            node = node.child(segment)?;
        }
        Some(node)
    }
}

/// A leaf child returned by directory listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key: String,
    pub value: String,
}

impl Pair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Last segment of the pair's key.
    pub fn name(&self) -> &str {
        key::base_name(&self.key)
    }
}

/// A subtree fetched in one round-trip.
#[derive(Debug, Clone)]
pub struct Tree {
    /// `None` when the key does not exist.
    pub node: Option<Node>,
    /// Store-wide index at the time of the read, reported for absent keys too.
    pub index: u64,
}
