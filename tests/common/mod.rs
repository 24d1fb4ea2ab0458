//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use proxy_control::server::{ConnectionTracker, Server, ServerError};
use proxy_control::store::MemoryBackend;
use proxy_control::topology::{
    EntityKind, Endpoint, Host, KeyLayout, Listener, Location, Middleware, Upstream,
};

pub const ROOT: &str = "/proxy";

pub const HTTP_LISTENER: &str =
    r#"{"protocol":"http","address":{"network":"tcp","address":"0.0.0.0:8080"}}"#;
pub const HTTPS_LISTENER: &str =
    r#"{"protocol":"https","address":{"network":"tcp","address":"0.0.0.0:8443"}}"#;
pub const RATE_LIMIT: &str =
    r#"{"type":"ratelimit","priority":1,"config":{"requests":100,"period_secs":1}}"#;

pub fn layout() -> KeyLayout {
    KeyLayout::new(ROOT)
}

/// One call received by a [`RecordingServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCall {
    UpsertHost(String),
    DeleteHost(String),
    UpsertListener(String, String),
    DeleteListener(String, String),
    UpsertUpstream(String),
    DeleteUpstream(String),
    UpsertEndpoint(String, String),
    DeleteEndpoint(String, String),
    UpsertLocation(String),
    DeleteLocation(String),
    UpsertMiddleware(String, String),
    DeleteMiddleware(String, String),
    Stop { drain: bool },
}

impl ServerCall {
    pub fn upsert_host(id: &str) -> Self {
        ServerCall::UpsertHost(id.to_string())
    }
    pub fn upsert_listener(host: &str, id: &str) -> Self {
        ServerCall::UpsertListener(host.to_string(), id.to_string())
    }
    pub fn upsert_upstream(id: &str) -> Self {
        ServerCall::UpsertUpstream(id.to_string())
    }
    pub fn upsert_endpoint(upstream: &str, id: &str) -> Self {
        ServerCall::UpsertEndpoint(upstream.to_string(), id.to_string())
    }
    pub fn upsert_location(id: &str) -> Self {
        ServerCall::UpsertLocation(id.to_string())
    }
    pub fn upsert_middleware(location: &str, id: &str) -> Self {
        ServerCall::UpsertMiddleware(location.to_string(), id.to_string())
    }
}

/// Server double that records every call, keeps the hosts it was given and
/// can be told to reject an entity.
#[derive(Default)]
pub struct RecordingServer {
    calls: Mutex<Vec<ServerCall>>,
    hosts: Mutex<BTreeMap<String, Host>>,
    rejected: Mutex<BTreeSet<String>>,
    host_delay: Mutex<Duration>,
    host_entered: Notify,
    connections: ConnectionTracker,
}

impl RecordingServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ServerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn host(&self, id: &str) -> Option<Host> {
        self.hosts.lock().unwrap().get(id).cloned()
    }

    /// Make every later upsert of `id` fail.
    pub fn reject(&self, id: &str) {
        self.rejected.lock().unwrap().insert(id.to_string());
    }

    /// Make every later host upsert take `delay`.
    pub fn slow_hosts(&self, delay: Duration) {
        *self.host_delay.lock().unwrap() = delay;
    }

    /// Resolves once a host upsert has begun.
    pub async fn host_upsert_started(&self) {
        self.host_entered.notified().await;
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    fn record(&self, call: ServerCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, kind: EntityKind, id: &str) -> Result<(), ServerError> {
        if self.rejected.lock().unwrap().contains(id) {
            return Err(ServerError::rejected(kind, id, "rejected by test"));
        }
        Ok(())
    }
}

#[async_trait]
impl Server for RecordingServer {
    async fn upsert_host(&self, host: &Host) -> Result<(), ServerError> {
        self.host_entered.notify_one();
        let delay = *self.host_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(EntityKind::Host, &host.id)?;
        self.hosts.lock().unwrap().insert(host.id.clone(), host.clone());
        self.record(ServerCall::UpsertHost(host.id.clone()));
        Ok(())
    }

    async fn delete_host(&self, host_id: &str) -> Result<(), ServerError> {
        self.hosts.lock().unwrap().remove(host_id);
        self.record(ServerCall::DeleteHost(host_id.to_string()));
        Ok(())
    }

    async fn upsert_listener(&self, listener: &Listener) -> Result<(), ServerError> {
        self.check(EntityKind::Listener, &listener.id)?;
        self.record(ServerCall::UpsertListener(listener.host_id.clone(), listener.id.clone()));
        Ok(())
    }

    async fn delete_listener(&self, host_id: &str, listener_id: &str) -> Result<(), ServerError> {
        self.record(ServerCall::DeleteListener(host_id.to_string(), listener_id.to_string()));
        Ok(())
    }

    async fn upsert_upstream(&self, upstream: &Upstream) -> Result<(), ServerError> {
        self.check(EntityKind::Upstream, &upstream.id)?;
        self.record(ServerCall::UpsertUpstream(upstream.id.clone()));
        Ok(())
    }

    async fn delete_upstream(&self, upstream_id: &str) -> Result<(), ServerError> {
        self.record(ServerCall::DeleteUpstream(upstream_id.to_string()));
        Ok(())
    }

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<(), ServerError> {
        self.check(EntityKind::Endpoint, &endpoint.id)?;
        self.record(ServerCall::UpsertEndpoint(endpoint.upstream_id.clone(), endpoint.id.clone()));
        Ok(())
    }

    async fn delete_endpoint(&self, upstream_id: &str, endpoint_id: &str) -> Result<(), ServerError> {
        self.record(ServerCall::DeleteEndpoint(upstream_id.to_string(), endpoint_id.to_string()));
        Ok(())
    }

    async fn upsert_location(&self, location: &Location) -> Result<(), ServerError> {
        self.check(EntityKind::Location, &location.id)?;
        self.record(ServerCall::UpsertLocation(location.id.clone()));
        Ok(())
    }

    async fn delete_location(&self, location_id: &str) -> Result<(), ServerError> {
        self.record(ServerCall::DeleteLocation(location_id.to_string()));
        Ok(())
    }

    async fn upsert_middleware(&self, middleware: &Middleware) -> Result<(), ServerError> {
        self.check(EntityKind::Middleware, &middleware.id)?;
        self.record(ServerCall::UpsertMiddleware(
            middleware.location_id.clone(),
            middleware.id.clone(),
        ));
        Ok(())
    }

    async fn delete_middleware(&self, location_id: &str, middleware_id: &str) -> Result<(), ServerError> {
        self.record(ServerCall::DeleteMiddleware(location_id.to_string(), middleware_id.to_string()));
        Ok(())
    }

    async fn stop(&self, drain: bool) {
        if drain {
            let _ = tokio::time::timeout(Duration::from_secs(5), self.connections.wait_for_idle()).await;
        }
        self.record(ServerCall::Stop { drain });
    }
}

/// Write one host with listener `l1`, one upstream with endpoint `e1`, and
/// location `loc1` on `/` with a rate limit middleware.
pub fn seed_topology(backend: &MemoryBackend) {
    let l = layout();
    backend.set(&l.listener("h1", "l1"), HTTP_LISTENER).unwrap();
    backend.set(&l.endpoint("u1", "e1"), "http://10.0.0.1:9000").unwrap();
    write_location(backend, "loc1", "h1", "/", "u1");
    backend.set(&l.middleware("loc1", "m1"), RATE_LIMIT).unwrap();
}

pub fn write_location(backend: &MemoryBackend, id: &str, host: &str, path: &str, upstream: &str) {
    let l = layout();
    backend.set(&l.location_field(id, "host"), host).unwrap();
    backend.set(&l.location_field(id, "path"), path).unwrap();
    backend.set(&l.location_field(id, "upstream"), upstream).unwrap();
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Await `fut` for at most two seconds.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}
