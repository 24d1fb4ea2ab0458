//! Routing table: the in-process [`Server`] implementation.
//!
//! # Responsibilities
//! - Validate each mutation against the entities already applied
//! - Publish an immutable snapshot after every successful mutation
//! - Resolve a request's host and path to a location
//! - Drain connections on graceful stop
//!
//! # Design Decisions
//! - Writers serialize on a mutex; readers only ever load the published
//!   `Arc<RoutingSnapshot>`, so routing never blocks on reconfiguration
//! - Referential integrity is enforced here as well as in the reconciler,
//!   so a misbehaving caller cannot leave dangling routes

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::observability::metrics;
use crate::server::{ConnectionGuard, ConnectionTracker, Server, ServerError};
use crate::store::key;
use crate::topology::{
    Address, EntityKind, Endpoint, Host, Listener, Location, Middleware, Topology, Upstream,
};

/// Id of the listener installed from configuration.
pub const DEFAULT_LISTENER_ID: &str = "default";

/// Immutable view of the routing state at one version.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    /// Incremented on every successful mutation.
    pub version: u64,
    pub topology: Topology,
    /// Listener from configuration, not bound to any host.
    pub default_listener: Option<Listener>,
}

impl RoutingSnapshot {
    /// Location on `host_id` whose path is the longest segment prefix of
    /// `path`. `/api` covers `/api` and `/api/users` but not `/apix`.
    pub fn match_location(&self, host_id: &str, path: &str) -> Option<&Location> {
        self.topology
            .locations_on_host(host_id)
            .filter(|l| path_covers(&l.path, path))
            .max_by_key(|l| l.path.len())
    }
}

fn path_covers(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty() || key::is_within(path, prefix)
}

struct TableState {
    topology: Topology,
    version: u64,
}

pub struct RoutingTable {
    state: Mutex<TableState>,
    published: ArcSwap<RoutingSnapshot>,
    default_listener: Option<Listener>,
    connections: ConnectionTracker,
    drain_timeout: Duration,
    stopped: AtomicBool,
}

impl RoutingTable {
    pub fn new(config: &ServerConfig) -> Self {
        let default_listener = config.default_listener.then(|| Listener {
            id: DEFAULT_LISTENER_ID.to_string(),
            host_id: String::new(),
            protocol: "http".to_string(),
            address: Address {
                network: "tcp".to_string(),
                address: format!("{}:{}", config.interface, config.port),
            },
        });

        let snapshot = RoutingSnapshot {
            version: 0,
            topology: Topology::new(),
            default_listener: default_listener.clone(),
        };

        Self {
            state: Mutex::new(TableState {
                topology: Topology::new(),
                version: 0,
            }),
            published: ArcSwap::from_pointee(snapshot),
            default_listener,
            connections: ConnectionTracker::new(),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            stopped: AtomicBool::new(false),
        }
    }

    /// Current routing state.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.published.load_full()
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    /// Register a client connection for the lifetime of the guard.
    pub fn open_connection(&self) -> ConnectionGuard {
        self.connections.track()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` under the write lock and publish the result. `change`
    /// must validate before it mutates.
    fn mutate<F>(
        &self,
        kind: EntityKind,
        operation: &'static str,
        id: &str,
        change: F,
    ) -> Result<(), ServerError>
    where
        F: FnOnce(&mut Topology) -> Result<(), String>,
    {
        if self.is_stopped() {
            return Err(ServerError::Stopped);
        }

        let mut state = self.lock();
        if let Err(reason) = change(&mut state.topology) {
            metrics::record_server_call(kind.as_str(), operation, false);
            tracing::warn!(%kind, id, operation, reason = %reason, "Routing table rejected change");
            return Err(ServerError::rejected(kind, id, reason));
        }

        state.version += 1;
        self.published.store(Arc::new(RoutingSnapshot {
            version: state.version,
            topology: state.topology.clone(),
            default_listener: self.default_listener.clone(),
        }));
        metrics::record_server_call(kind.as_str(), operation, true);
        metrics::set_routing_version(state.version);
        tracing::debug!(%kind, id, operation, version = state.version, "Routing table updated");
        Ok(())
    }
}

fn check_address(address: &Address) -> Result<(), String> {
    match address.network.as_str() {
        "tcp" => address
            .address
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|e| format!("invalid tcp address '{}': {}", address.address, e)),
        "unix" if !address.address.is_empty() => Ok(()),
        "unix" => Err("unix socket path must not be empty".to_string()),
        other => Err(format!("unsupported network '{}'", other)),
    }
}

#[async_trait]
impl Server for RoutingTable {
    async fn upsert_host(&self, host: &Host) -> Result<(), ServerError> {
        self.mutate(EntityKind::Host, "upsert", &host.id, |t| {
            t.insert_host(host.clone());
            Ok(())
        })
    }

    async fn delete_host(&self, host_id: &str) -> Result<(), ServerError> {
        self.mutate(EntityKind::Host, "delete", host_id, |t| {
            if let Some(location) = t.locations_on_host(host_id).next() {
                return Err(format!("location '{}' still routes on this host", location.id));
            }
            let listeners: Vec<String> = t.listeners_of(host_id).map(|l| l.id.clone()).collect();
            for id in listeners {
                t.remove_listener(host_id, &id);
            }
            t.remove_host(host_id);
            Ok(())
        })
    }

    async fn upsert_listener(&self, listener: &Listener) -> Result<(), ServerError> {
        self.mutate(EntityKind::Listener, "upsert", &listener.id, |t| {
            let host = t
                .host(&listener.host_id)
                .ok_or_else(|| format!("unknown host '{}'", listener.host_id))?;
            if listener.needs_certificate() && host.certificate.is_none() {
                return Err(format!("host '{}' has no certificate for https", host.id));
            }
            check_address(&listener.address)?;
            t.insert_listener(listener.clone());
            Ok(())
        })
    }

    async fn delete_listener(&self, host_id: &str, listener_id: &str) -> Result<(), ServerError> {
        self.mutate(EntityKind::Listener, "delete", listener_id, |t| {
            t.remove_listener(host_id, listener_id);
            Ok(())
        })
    }

    async fn upsert_upstream(&self, upstream: &Upstream) -> Result<(), ServerError> {
        self.mutate(EntityKind::Upstream, "upsert", &upstream.id, |t| {
            t.insert_upstream(upstream.clone());
            Ok(())
        })
    }

    async fn delete_upstream(&self, upstream_id: &str) -> Result<(), ServerError> {
        self.mutate(EntityKind::Upstream, "delete", upstream_id, |t| {
            if let Some(location) = t.locations_routed_to(upstream_id).next() {
                return Err(format!("location '{}' still routes to this upstream", location.id));
            }
            let endpoints: Vec<String> = t.endpoints_of(upstream_id).map(|e| e.id.clone()).collect();
            for id in endpoints {
                t.remove_endpoint(upstream_id, &id);
            }
            t.remove_upstream(upstream_id);
            Ok(())
        })
    }

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<(), ServerError> {
        self.mutate(EntityKind::Endpoint, "upsert", &endpoint.id, |t| {
            if t.upstream(&endpoint.upstream_id).is_none() {
                return Err(format!("unknown upstream '{}'", endpoint.upstream_id));
            }
            t.insert_endpoint(endpoint.clone());
            Ok(())
        })
    }

    async fn delete_endpoint(
        &self,
        upstream_id: &str,
        endpoint_id: &str,
    ) -> Result<(), ServerError> {
        self.mutate(EntityKind::Endpoint, "delete", endpoint_id, |t| {
            t.remove_endpoint(upstream_id, endpoint_id);
            Ok(())
        })
    }

    async fn upsert_location(&self, location: &Location) -> Result<(), ServerError> {
        self.mutate(EntityKind::Location, "upsert", &location.id, |t| {
            if t.host(&location.host_id).is_none() {
                return Err(format!("unknown host '{}'", location.host_id));
            }
            if t.upstream(&location.upstream_id).is_none() {
                return Err(format!("unknown upstream '{}'", location.upstream_id));
            }
            t.insert_location(location.clone());
            Ok(())
        })
    }

    async fn delete_location(&self, location_id: &str) -> Result<(), ServerError> {
        self.mutate(EntityKind::Location, "delete", location_id, |t| {
            let chain: Vec<String> = t
                .middleware_chain(location_id)
                .into_iter()
                .map(|m| m.id.clone())
                .collect();
            for id in chain {
                t.remove_middleware(location_id, &id);
            }
            t.remove_location(location_id);
            Ok(())
        })
    }

    async fn upsert_middleware(&self, middleware: &Middleware) -> Result<(), ServerError> {
        self.mutate(EntityKind::Middleware, "upsert", &middleware.id, |t| {
            if t.location(&middleware.location_id).is_none() {
                return Err(format!("unknown location '{}'", middleware.location_id));
            }
            t.insert_middleware(middleware.clone());
            Ok(())
        })
    }

    async fn delete_middleware(
        &self,
        location_id: &str,
        middleware_id: &str,
    ) -> Result<(), ServerError> {
        self.mutate(EntityKind::Middleware, "delete", middleware_id, |t| {
            t.remove_middleware(location_id, middleware_id);
            Ok(())
        })
    }

    async fn stop(&self, drain: bool) {
        self.stopped.store(true, Ordering::SeqCst);
        if !drain {
            tracing::info!(
                active_connections = self.connections.active_count(),
                "Routing table stopped without draining"
            );
            return;
        }

        tracing::info!(
            active_connections = self.connections.active_count(),
            timeout = ?self.drain_timeout,
            "Draining connections"
        );
        match tokio::time::timeout(self.drain_timeout, self.connections.wait_for_idle()).await {
            Ok(()) => tracing::info!("All connections drained"),
            Err(_) => tracing::warn!(
                remaining = self.connections.active_count(),
                "Drain timeout elapsed with connections still open"
            ),
        }
    }
}
