//! Topology subsystem: the typed mirror of the proxy namespace.
//!
//! # Data Flow
//! ```text
//! HierarchicalStore
//!     → layout.rs (key builders, change classification)
//!     → decode.rs (one typed decode per entity kind)
//!     → middleware.rs (kind lookup, config check)
//!     → Topology (owned by the reconciler, published read-only)
//! ```
//!
//! # Design Decisions
//! - Entities reference each other by id; children live in flat maps keyed
//!   by `(parent id, child id)`, so a listener change never rewrites its host
//! - Iteration order is deterministic everywhere (BTreeMap)
//! - Mutation is crate-private: only the reconciler and the routing table
//!   change a Topology

pub mod decode;
pub mod layout;
pub mod middleware;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::secret::{SecretBox, SecretError};

pub use decode::{FullRead, HostSpec, LocationRead, LocationSpec, UpstreamSpec};
pub use layout::{ChangeTarget, KeyLayout, Scope};
pub use middleware::MiddlewareRegistry;

/// Network address of a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// `tcp` or `unix`.
    pub network: String,
    pub address: String,
}

/// TLS material of a host, PEM encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub cert: String,
    pub key: String,
}

impl Certificate {
    /// JSON-encode and seal, producing the envelope text stored at a host's
    /// `cert` key.
    pub fn seal(&self, secrets: &SecretBox) -> Result<String, SecretError> {
        let plaintext = serde_json::to_vec(self).map_err(|_| SecretError::SealFailed)?;
        secrets.seal(&plaintext)?.to_json()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub id: String,
    pub certificate: Option<Certificate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub id: String,
    pub host_id: String,
    /// `http` or `https`.
    pub protocol: String,
    pub address: Address,
}

impl Listener {
    /// https listeners serve the host certificate.
    pub fn needs_certificate(&self) -> bool {
        self.protocol == "https"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub upstream_id: String,
    pub url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub id: String,
    pub host_id: String,
    pub path: String,
    pub upstream_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Middleware {
    pub id: String,
    pub location_id: String,
    pub kind: String,
    pub priority: i32,
    pub config: serde_json::Value,
}

/// Entity kinds, in the order they are applied on a full load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Host,
    Listener,
    Upstream,
    Endpoint,
    Location,
    Middleware,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Host => "host",
            EntityKind::Listener => "listener",
            EntityKind::Upstream => "upstream",
            EntityKind::Endpoint => "endpoint",
            EntityKind::Location => "location",
            EntityKind::Middleware => "middleware",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ChildMap<T> = BTreeMap<(String, String), T>;

/// Children of `parent`. The returned iterator borrows only `map`.
fn children_of<'m, T>(map: &'m ChildMap<T>, parent: &str) -> impl Iterator<Item = &'m T> + 'm {
    let parent = parent.to_string();
    map.range((parent.clone(), String::new())..)
        .take_while(move |((p, _), _)| *p == parent)
        .map(|(_, v)| v)
}

fn child_key(parent: &str, id: &str) -> (String, String) {
    (parent.to_string(), id.to_string())
}

/// In-memory mirror of the applied configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    hosts: BTreeMap<String, Host>,
    listeners: ChildMap<Listener>,
    upstreams: BTreeMap<String, Upstream>,
    endpoints: ChildMap<Endpoint>,
    locations: BTreeMap<String, Location>,
    middlewares: ChildMap<Middleware>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self, id: &str) -> Option<&Host> {
        self.hosts.get(id)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn listener(&self, host_id: &str, id: &str) -> Option<&Listener> {
        self.listeners.get(&child_key(host_id, id))
    }

    pub fn listeners(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.values()
    }

    pub fn listeners_of(&self, host_id: &str) -> impl Iterator<Item = &Listener> + '_ {
        children_of(&self.listeners, host_id)
    }

    pub fn upstream(&self, id: &str) -> Option<&Upstream> {
        self.upstreams.get(id)
    }

    pub fn upstreams(&self) -> impl Iterator<Item = &Upstream> {
        self.upstreams.values()
    }

    pub fn endpoint(&self, upstream_id: &str, id: &str) -> Option<&Endpoint> {
        self.endpoints.get(&child_key(upstream_id, id))
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn endpoints_of(&self, upstream_id: &str) -> impl Iterator<Item = &Endpoint> + '_ {
        children_of(&self.endpoints, upstream_id)
    }

    pub fn location(&self, id: &str) -> Option<&Location> {
        self.locations.get(id)
    }

    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.locations.values()
    }

    pub fn locations_on_host(&self, host_id: &str) -> impl Iterator<Item = &Location> + '_ {
        let host_id = host_id.to_string();
        self.locations.values().filter(move |l| l.host_id == host_id)
    }

    pub fn locations_routed_to(&self, upstream_id: &str) -> impl Iterator<Item = &Location> + '_ {
        let upstream_id = upstream_id.to_string();
        self.locations.values().filter(move |l| l.upstream_id == upstream_id)
    }

    pub fn middleware(&self, location_id: &str, id: &str) -> Option<&Middleware> {
        self.middlewares.get(&child_key(location_id, id))
    }

    pub fn middlewares(&self) -> impl Iterator<Item = &Middleware> {
        self.middlewares.values()
    }

    /// Middlewares of a location in execution order: priority, then id.
    pub fn middleware_chain(&self, location_id: &str) -> Vec<&Middleware> {
        let mut chain: Vec<&Middleware> = children_of(&self.middlewares, location_id).collect();
        chain.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        chain
    }

    /// Total number of entities of every kind.
    pub fn entity_count(&self) -> usize {
        self.hosts.len()
            + self.listeners.len()
            + self.upstreams.len()
            + self.endpoints.len()
            + self.locations.len()
            + self.middlewares.len()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Host => self.hosts.len(),
            EntityKind::Listener => self.listeners.len(),
            EntityKind::Upstream => self.upstreams.len(),
            EntityKind::Endpoint => self.endpoints.len(),
            EntityKind::Location => self.locations.len(),
            EntityKind::Middleware => self.middlewares.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0
    }

    pub(crate) fn insert_host(&mut self, host: Host) {
        self.hosts.insert(host.id.clone(), host);
    }

    pub(crate) fn remove_host(&mut self, id: &str) -> Option<Host> {
        self.hosts.remove(id)
    }

    pub(crate) fn insert_listener(&mut self, listener: Listener) {
        self.listeners.insert(child_key(&listener.host_id, &listener.id), listener);
    }

    pub(crate) fn remove_listener(&mut self, host_id: &str, id: &str) -> Option<Listener> {
        self.listeners.remove(&child_key(host_id, id))
    }

    pub(crate) fn insert_upstream(&mut self, upstream: Upstream) {
        self.upstreams.insert(upstream.id.clone(), upstream);
    }

    pub(crate) fn remove_upstream(&mut self, id: &str) -> Option<Upstream> {
        self.upstreams.remove(id)
    }

    pub(crate) fn insert_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoints.insert(child_key(&endpoint.upstream_id, &endpoint.id), endpoint);
    }

    pub(crate) fn remove_endpoint(&mut self, upstream_id: &str, id: &str) -> Option<Endpoint> {
        self.endpoints.remove(&child_key(upstream_id, id))
    }

    pub(crate) fn insert_location(&mut self, location: Location) {
        self.locations.insert(location.id.clone(), location);
    }

    pub(crate) fn remove_location(&mut self, id: &str) -> Option<Location> {
        self.locations.remove(id)
    }

    pub(crate) fn insert_middleware(&mut self, middleware: Middleware) {
        self.middlewares.insert(
            child_key(&middleware.location_id, &middleware.id),
            middleware,
        );
    }

    pub(crate) fn remove_middleware(&mut self, location_id: &str, id: &str) -> Option<Middleware> {
        self.middlewares.remove(&child_key(location_id, id))
    }
}
