//! Diff and apply: the sole writer of the topology.
//!
//! # Responsibilities
//! - Apply a full read in dependency order
//! - Re-read the root entity touched by a change and apply the difference
//! - Remove dependents before the entity they depend on
//! - Remember locations that cannot be applied yet and retry them
//! - Hold https listeners back until their host has a certificate
//!
//! # Design Decisions
//! - Every server call is preceded by a comparison with the mirror, so
//!   replaying an event or a whole load issues no redundant calls
//! - The change action is informational only; the current namespace state is
//!   always re-read, so replaying an event converges to the same topology

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;

use crate::observability::metrics;
use crate::resilience::RetryPolicy;
use crate::secret::SecretBox;
use crate::server::Server;
use crate::store::{Change, HierarchicalStore, KvBackend};
use crate::sync::SyncError;
use crate::topology::decode::{self, HostSpec, LocationRead, LocationSpec, UpstreamSpec};
use crate::topology::{
    Endpoint, Host, KeyLayout, Listener, Location, Middleware, MiddlewareRegistry, Scope, Topology,
    Upstream,
};

fn new_store<'s>(
    backend: &'s Arc<dyn KvBackend>,
    secrets: &'s Option<Arc<SecretBox>>,
    retry: &RetryPolicy,
) -> HierarchicalStore<'s> {
    HierarchicalStore::new(backend.as_ref())
        .with_secrets(secrets.as_deref())
        .with_retry(retry.clone())
}

pub struct Reconciler {
    backend: Arc<dyn KvBackend>,
    server: Arc<dyn Server>,
    layout: KeyLayout,
    secrets: Option<Arc<SecretBox>>,
    retry: RetryPolicy,
    registry: MiddlewareRegistry,
    topology: Topology,
    published: Arc<ArcSwap<Topology>>,
    /// Location id → index of the change that deferred it.
    deferred: BTreeMap<String, u64>,
    /// (host, listener) pairs waiting for the host certificate. The
    /// certificate lives under the host, so writing it re-reads the host.
    waiting: BTreeSet<(String, String)>,
}

/// An https listener cannot be applied to a host without a certificate.
fn waits_for_certificate(host: &Host, listener: &Listener) -> bool {
    listener.needs_certificate() && host.certificate.is_none()
}

impl Reconciler {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        server: Arc<dyn Server>,
        layout: KeyLayout,
        secrets: Option<Arc<SecretBox>>,
        retry: RetryPolicy,
        registry: MiddlewareRegistry,
        published: Arc<ArcSwap<Topology>>,
    ) -> Self {
        Self {
            backend,
            server,
            layout,
            secrets,
            retry,
            registry,
            topology: Topology::new(),
            published,
            deferred: BTreeMap::new(),
            waiting: BTreeSet::new(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Ids of deferred locations in deferral order.
    pub fn deferred(&self) -> Vec<String> {
        let mut pending: Vec<(u64, &String)> =
            self.deferred.iter().map(|(id, index)| (*index, id)).collect();
        pending.sort();
        pending.into_iter().map(|(_, id)| id.clone()).collect()
    }

    /// Read the whole namespace and apply it: hosts, listeners, upstreams,
    /// endpoints, locations, middlewares. Returns the store index the read
    /// reflects.
    pub async fn load(&mut self) -> Result<u64, SyncError> {
        let backend = Arc::clone(&self.backend);
        let secrets = self.secrets.clone();
        let mut store = new_store(&backend, &secrets, &self.retry)
            .prefetch(self.layout.root())
            .await?;
        let full = decode::read_all(&mut store, &self.layout, &self.registry).await?;
        let index = store.observed_index();

        for spec in &full.hosts {
            self.put_host(&spec.host).await?;
        }
        for spec in &full.hosts {
            for listener in &spec.listeners {
                if waits_for_certificate(&spec.host, listener) {
                    self.hold_listener(listener);
                    continue;
                }
                self.put_listener(listener).await?;
            }
        }
        for spec in &full.upstreams {
            self.put_upstream(&spec.upstream).await?;
        }
        for spec in &full.upstreams {
            for endpoint in &spec.endpoints {
                self.put_endpoint(endpoint).await?;
            }
        }

        let mut applied = Vec::with_capacity(full.locations.len());
        for spec in &full.locations {
            if let Some(reason) = self.missing_reference(&spec.location) {
                tracing::debug!(location = %spec.location.id, reason = %reason, "Deferring location");
                self.defer(&spec.location.id, index);
                continue;
            }
            self.put_location(&spec.location).await?;
            applied.push(spec);
        }
        for spec in applied {
            for middleware in &spec.middlewares {
                self.put_middleware(middleware).await?;
            }
        }
        for (id, field) in &full.incomplete {
            tracing::debug!(location = %id, field, "Location not fully written, deferring");
            self.defer(id, index);
        }

        self.publish();
        tracing::info!(
            entities = self.topology.entity_count(),
            deferred = self.deferred.len(),
            waiting_listeners = self.waiting.len(),
            round_trips = store.round_trips(),
            index,
            "Initial topology applied"
        );
        Ok(index)
    }

    /// Apply one change notification.
    pub async fn handle(&mut self, change: &Change) -> Result<(), SyncError> {
        let started = Instant::now();
        metrics::record_change(change.action.as_str());

        let Some(target) = self.layout.classify(&change.key) else {
            tracing::debug!(key = %change.key, index = change.index, "Ignoring unrelated change");
            return Ok(());
        };
        tracing::info!(
            key = %change.key,
            action = %change.action,
            index = change.index,
            target = ?target,
            "Applying change"
        );

        let scope = target.scope();
        let backend = Arc::clone(&self.backend);
        let secrets = self.secrets.clone();
        let mut store = new_store(&backend, &secrets, &self.retry)
            .prefetch(&self.scope_key(&scope))
            .await?;
        self.reconcile_scope(&mut store, &scope, change.index).await?;

        // Location scopes already re-read every location they can affect.
        if !matches!(scope, Scope::Location(_) | Scope::Locations) && !self.deferred.is_empty() {
            let mut store = new_store(&backend, &secrets, &self.retry)
                .prefetch(&self.layout.locations())
                .await?;
            for id in self.deferred() {
                self.reconcile_location(&mut store, &id, change.index).await?;
            }
        }

        self.publish();
        metrics::record_reconcile(started.elapsed());
        Ok(())
    }

    fn scope_key(&self, scope: &Scope) -> String {
        match scope {
            Scope::All => self.layout.root().to_string(),
            Scope::Hosts => self.layout.hosts(),
            Scope::Upstreams => self.layout.upstreams(),
            Scope::Locations => self.layout.locations(),
            Scope::Host(id) => self.layout.host(id),
            Scope::Upstream(id) => self.layout.upstream(id),
            Scope::Location(id) => self.layout.location(id),
        }
    }

    async fn reconcile_scope(
        &mut self,
        store: &mut HierarchicalStore<'_>,
        scope: &Scope,
        index: u64,
    ) -> Result<(), SyncError> {
        match scope {
            Scope::Host(id) => self.reconcile_host(store, id, index).await,
            Scope::Upstream(id) => self.reconcile_upstream(store, id, index).await,
            Scope::Location(id) => self.reconcile_location(store, id, index).await,
            Scope::Hosts => self.reconcile_hosts(store, index).await,
            Scope::Upstreams => self.reconcile_upstreams(store, index).await,
            Scope::Locations => self.reconcile_locations(store, index).await,
            Scope::All => {
                self.reconcile_hosts(store, index).await?;
                self.reconcile_upstreams(store, index).await?;
                self.reconcile_locations(store, index).await
            }
        }
    }

    async fn reconcile_hosts(
        &mut self,
        store: &mut HierarchicalStore<'_>,
        index: u64,
    ) -> Result<(), SyncError> {
        let mut ids: BTreeSet<String> = self.topology.hosts().map(|h| h.id.clone()).collect();
        ids.extend(decode::child_ids(store, &self.layout.hosts()).await?);
        for id in ids {
            self.reconcile_host(store, &id, index).await?;
        }
        Ok(())
    }

    async fn reconcile_upstreams(
        &mut self,
        store: &mut HierarchicalStore<'_>,
        index: u64,
    ) -> Result<(), SyncError> {
        let mut ids: BTreeSet<String> = self.topology.upstreams().map(|u| u.id.clone()).collect();
        ids.extend(decode::child_ids(store, &self.layout.upstreams()).await?);
        for id in ids {
            self.reconcile_upstream(store, &id, index).await?;
        }
        Ok(())
    }

    async fn reconcile_locations(
        &mut self,
        store: &mut HierarchicalStore<'_>,
        index: u64,
    ) -> Result<(), SyncError> {
        let mut ids: BTreeSet<String> = self.topology.locations().map(|l| l.id.clone()).collect();
        ids.extend(self.deferred.keys().cloned());
        ids.extend(decode::child_ids(store, &self.layout.locations()).await?);
        for id in ids {
            self.reconcile_location(store, &id, index).await?;
        }
        Ok(())
    }

    async fn reconcile_host(
        &mut self,
        store: &mut HierarchicalStore<'_>,
        id: &str,
        index: u64,
    ) -> Result<(), SyncError> {
        match decode::read_host(store, &self.layout, id).await? {
            Some(spec) => self.apply_host(spec).await,
            None => self.drop_host(id, index).await,
        }
    }

    async fn reconcile_upstream(
        &mut self,
        store: &mut HierarchicalStore<'_>,
        id: &str,
        index: u64,
    ) -> Result<(), SyncError> {
        match decode::read_upstream(store, &self.layout, id).await? {
            Some(spec) => self.apply_upstream(spec).await,
            None => self.drop_upstream(id, index).await,
        }
    }

    async fn reconcile_location(
        &mut self,
        store: &mut HierarchicalStore<'_>,
        id: &str,
        index: u64,
    ) -> Result<(), SyncError> {
        match decode::read_location(store, &self.layout, &self.registry, id).await? {
            LocationRead::Absent => {
                self.drop_location(id).await?;
                self.deferred.remove(id);
            }
            LocationRead::Incomplete(field) => {
                tracing::debug!(location = id, field, "Location not fully written, deferring");
                self.drop_location(id).await?;
                self.defer(id, index);
            }
            LocationRead::Ready(spec) => match self.missing_reference(&spec.location) {
                Some(reason) => {
                    tracing::debug!(location = id, reason = %reason, "Deferring location");
                    self.drop_location(id).await?;
                    self.defer(id, index);
                }
                None => {
                    self.apply_location(spec).await?;
                    if self.deferred.remove(id).is_some() {
                        tracing::info!(location = id, "Deferred location applied");
                    }
                }
            },
        }
        Ok(())
    }

    async fn apply_host(&mut self, spec: HostSpec) -> Result<(), SyncError> {
        let host_id = spec.host.id.as_str();
        let (ready, held): (Vec<&Listener>, Vec<&Listener>) = spec
            .listeners
            .iter()
            .partition(|l| !waits_for_certificate(&spec.host, l));

        // Stale listeners go before the host update: a host losing its
        // certificate must not keep an https listener.
        let wanted: BTreeSet<&str> = ready.iter().map(|l| l.id.as_str()).collect();
        let stale: Vec<String> = self
            .topology
            .listeners_of(host_id)
            .filter(|l| !wanted.contains(l.id.as_str()))
            .map(|l| l.id.clone())
            .collect();
        for listener_id in stale {
            self.server.delete_listener(host_id, &listener_id).await?;
            self.topology.remove_listener(host_id, &listener_id);
        }
        self.put_host(&spec.host).await?;

        for listener in ready {
            self.put_listener(listener).await?;
            if self.waiting.remove(&(listener.host_id.clone(), listener.id.clone())) {
                tracing::info!(host = host_id, listener = %listener.id, "Listener applied with certificate");
            }
        }
        self.waiting.retain(|(h, _)| h != host_id);
        for listener in held {
            self.hold_listener(listener);
        }
        Ok(())
    }

    async fn apply_upstream(&mut self, spec: UpstreamSpec) -> Result<(), SyncError> {
        let upstream_id = spec.upstream.id.as_str();
        self.put_upstream(&spec.upstream).await?;

        let wanted: BTreeSet<&str> = spec.endpoints.iter().map(|e| e.id.as_str()).collect();
        let stale: Vec<String> = self
            .topology
            .endpoints_of(upstream_id)
            .filter(|e| !wanted.contains(e.id.as_str()))
            .map(|e| e.id.clone())
            .collect();
        for endpoint_id in stale {
            self.server.delete_endpoint(upstream_id, &endpoint_id).await?;
            self.topology.remove_endpoint(upstream_id, &endpoint_id);
        }
        for endpoint in &spec.endpoints {
            self.put_endpoint(endpoint).await?;
        }
        Ok(())
    }

    async fn apply_location(&mut self, spec: LocationSpec) -> Result<(), SyncError> {
        let location_id = spec.location.id.as_str();
        self.put_location(&spec.location).await?;

        let wanted: BTreeSet<&str> = spec.middlewares.iter().map(|m| m.id.as_str()).collect();
        let stale: Vec<String> = self
            .topology
            .middleware_chain(location_id)
            .into_iter()
            .filter(|m| !wanted.contains(m.id.as_str()))
            .map(|m| m.id.clone())
            .collect();
        for middleware_id in stale {
            self.server.delete_middleware(location_id, &middleware_id).await?;
            self.topology.remove_middleware(location_id, &middleware_id);
        }
        for middleware in &spec.middlewares {
            self.put_middleware(middleware).await?;
        }
        Ok(())
    }

    /// Remove a host, first taking down the locations on it. Those locations
    /// are deferred so that re-creating the host restores them.
    async fn drop_host(&mut self, id: &str, index: u64) -> Result<(), SyncError> {
        self.waiting.retain(|(h, _)| h != id);
        if self.topology.host(id).is_none() {
            return Ok(());
        }

        let locations: Vec<String> = self.topology.locations_on_host(id).map(|l| l.id.clone()).collect();
        for location_id in locations {
            self.drop_location(&location_id).await?;
            self.defer(&location_id, index);
        }

        let listeners: Vec<String> = self.topology.listeners_of(id).map(|l| l.id.clone()).collect();
        for listener_id in listeners {
            self.server.delete_listener(id, &listener_id).await?;
            self.topology.remove_listener(id, &listener_id);
        }

        self.server.delete_host(id).await?;
        self.topology.remove_host(id);
        tracing::info!(host = id, "Host removed");
        Ok(())
    }

    /// Remove an upstream, first taking down the locations routed to it.
    async fn drop_upstream(&mut self, id: &str, index: u64) -> Result<(), SyncError> {
        if self.topology.upstream(id).is_none() {
            return Ok(());
        }

        let locations: Vec<String> =
            self.topology.locations_routed_to(id).map(|l| l.id.clone()).collect();
        for location_id in locations {
            self.drop_location(&location_id).await?;
            self.defer(&location_id, index);
        }

        let endpoints: Vec<String> = self.topology.endpoints_of(id).map(|e| e.id.clone()).collect();
        for endpoint_id in endpoints {
            self.server.delete_endpoint(id, &endpoint_id).await?;
            self.topology.remove_endpoint(id, &endpoint_id);
        }

        self.server.delete_upstream(id).await?;
        self.topology.remove_upstream(id);
        tracing::info!(upstream = id, "Upstream removed");
        Ok(())
    }

    async fn drop_location(&mut self, id: &str) -> Result<(), SyncError> {
        if self.topology.location(id).is_none() {
            return Ok(());
        }

        let chain: Vec<String> = self
            .topology
            .middleware_chain(id)
            .into_iter()
            .map(|m| m.id.clone())
            .collect();
        for middleware_id in chain {
            self.server.delete_middleware(id, &middleware_id).await?;
            self.topology.remove_middleware(id, &middleware_id);
        }

        self.server.delete_location(id).await?;
        self.topology.remove_location(id);
        tracing::info!(location = id, "Location removed");
        Ok(())
    }

    async fn put_host(&mut self, host: &Host) -> Result<(), SyncError> {
        if self.topology.host(&host.id) == Some(host) {
            return Ok(());
        }
        self.server.upsert_host(host).await?;
        self.topology.insert_host(host.clone());
        tracing::debug!(host = %host.id, "Host upserted");
        Ok(())
    }

    async fn put_listener(&mut self, listener: &Listener) -> Result<(), SyncError> {
        if self.topology.listener(&listener.host_id, &listener.id) == Some(listener) {
            return Ok(());
        }
        self.server.upsert_listener(listener).await?;
        self.topology.insert_listener(listener.clone());
        tracing::debug!(host = %listener.host_id, listener = %listener.id, "Listener upserted");
        Ok(())
    }

    async fn put_upstream(&mut self, upstream: &Upstream) -> Result<(), SyncError> {
        if self.topology.upstream(&upstream.id) == Some(upstream) {
            return Ok(());
        }
        self.server.upsert_upstream(upstream).await?;
        self.topology.insert_upstream(upstream.clone());
        tracing::debug!(upstream = %upstream.id, "Upstream upserted");
        Ok(())
    }

    async fn put_endpoint(&mut self, endpoint: &Endpoint) -> Result<(), SyncError> {
        if self.topology.endpoint(&endpoint.upstream_id, &endpoint.id) == Some(endpoint) {
            return Ok(());
        }
        self.server.upsert_endpoint(endpoint).await?;
        self.topology.insert_endpoint(endpoint.clone());
        tracing::debug!(upstream = %endpoint.upstream_id, endpoint = %endpoint.id, "Endpoint upserted");
        Ok(())
    }

    async fn put_location(&mut self, location: &Location) -> Result<(), SyncError> {
        if self.topology.location(&location.id) == Some(location) {
            return Ok(());
        }
        self.server.upsert_location(location).await?;
        self.topology.insert_location(location.clone());
        tracing::debug!(location = %location.id, "Location upserted");
        Ok(())
    }

    async fn put_middleware(&mut self, middleware: &Middleware) -> Result<(), SyncError> {
        if self.topology.middleware(&middleware.location_id, &middleware.id) == Some(middleware) {
            return Ok(());
        }
        self.server.upsert_middleware(middleware).await?;
        self.topology.insert_middleware(middleware.clone());
        tracing::debug!(
            location = %middleware.location_id,
            middleware = %middleware.id,
            "Middleware upserted"
        );
        Ok(())
    }

    fn missing_reference(&self, location: &Location) -> Option<String> {
        if self.topology.host(&location.host_id).is_none() {
            return Some(format!("host '{}' is not applied", location.host_id));
        }
        if self.topology.upstream(&location.upstream_id).is_none() {
            return Some(format!("upstream '{}' is not applied", location.upstream_id));
        }
        None
    }

    fn hold_listener(&mut self, listener: &Listener) {
        let key = (listener.host_id.clone(), listener.id.clone());
        if self.waiting.insert(key) {
            tracing::info!(
                host = %listener.host_id,
                listener = %listener.id,
                "https listener waits for the host certificate"
            );
        }
    }

    /// Remember a location. An already deferred location keeps its place.
    fn defer(&mut self, id: &str, index: u64) {
        self.deferred.entry(id.to_string()).or_insert(index);
    }

    fn publish(&self) {
        self.published.store(Arc::new(self.topology.clone()));
        metrics::set_topology_entities(self.topology.entity_count());
        metrics::set_deferred_locations(self.deferred.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::RoutingTable;
    use crate::store::MemoryBackend;

    struct Fixture {
        backend: MemoryBackend,
        table: Arc<RoutingTable>,
        reconciler: Reconciler,
        layout: KeyLayout,
    }

    fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        let table = Arc::new(RoutingTable::new(&ServerConfig::default()));
        let layout = KeyLayout::new("/proxy");
        let reconciler = Reconciler::new(
            Arc::new(backend.clone()),
            table.clone(),
            layout.clone(),
            None,
            RetryPolicy::none(),
            MiddlewareRegistry::default(),
            Arc::new(ArcSwap::from_pointee(Topology::new())),
        );
        Fixture {
            backend,
            table,
            reconciler,
            layout,
        }
    }

    /// Write `value` at `key` and hand the resulting change to the reconciler.
    async fn write(f: &mut Fixture, key: &str, value: &str) {
        let index = f.backend.set(key, value).unwrap();
        let change = Change {
            key: key.to_string(),
            action: crate::store::Action::Create,
            index,
        };
        f.reconciler.handle(&change).await.unwrap();
    }

    #[tokio::test]
    async fn location_waits_for_its_upstream() {
        let mut f = fixture();
        let l = f.layout.clone();
        write(&mut f, &l.listener("h1", "l1"), r#"{"protocol":"http","address":{"network":"tcp","address":"0.0.0.0:8080"}}"#).await;
        write(&mut f, &l.location_field("loc1", "host"), "h1").await;
        write(&mut f, &l.location_field("loc1", "path"), "/").await;
        write(&mut f, &l.location_field("loc1", "upstream"), "u1").await;

        assert_eq!(f.reconciler.deferred(), vec!["loc1"]);
        assert!(f.table.snapshot().topology.location("loc1").is_none());

        write(&mut f, &l.endpoint("u1", "e1"), "http://10.0.0.1:9000").await;
        assert!(f.reconciler.deferred().is_empty());
        assert!(f.table.snapshot().topology.location("loc1").is_some());
        assert_eq!(f.reconciler.topology(), &f.table.snapshot().topology);
    }

    #[tokio::test]
    async fn unrelated_keys_are_ignored() {
        let mut f = fixture();
        write(&mut f, "/proxy/frontends/f1", "x").await;
        write(&mut f, "/elsewhere", "x").await;
        assert!(f.reconciler.topology().is_empty());
        assert_eq!(f.table.snapshot().version, 0);
    }

    #[tokio::test]
    async fn replaying_a_change_is_a_no_op() {
        let mut f = fixture();
        let key = f.layout.endpoint("u1", "e1");
        write(&mut f, &key, "http://10.0.0.1:9000").await;
        let version = f.table.snapshot().version;

        let change = Change {
            key,
            action: crate::store::Action::Update,
            index: f.backend.index(),
        };
        f.reconciler.handle(&change).await.unwrap();
        assert_eq!(f.table.snapshot().version, version);
    }
}
