//! Typed decoding of namespace subtrees into topology entities.
//!
//! One read function per root entity. Each reads through a
//! [`HierarchicalStore`] that has already fetched (or will lazily fetch) the
//! entity's subtree, so a whole host with its listeners costs one round-trip.

use serde::Deserialize;
use url::Url;

use crate::store::{key, HierarchicalStore, StoreError};
use crate::topology::{
    Address, Certificate, Endpoint, Host, KeyLayout, Listener, Location, Middleware,
    MiddlewareRegistry, Upstream,
};

const PROTOCOLS: [&str; 2] = ["http", "https"];

#[derive(Debug, Deserialize)]
struct ListenerDoc {
    protocol: String,
    address: Address,
}

#[derive(Debug, Deserialize)]
struct MiddlewareDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    config: serde_json::Value,
}

/// A host with its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub host: Host,
    pub listeners: Vec<Listener>,
}

/// An upstream with its endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSpec {
    pub upstream: Upstream,
    pub endpoints: Vec<Endpoint>,
}

/// A location with its middlewares.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSpec {
    pub location: Location,
    pub middlewares: Vec<Middleware>,
}

/// Outcome of reading one location.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationRead {
    /// The location directory does not exist.
    Absent,
    /// The location exists but the named field has not been written yet.
    Incomplete(&'static str),
    Ready(LocationSpec),
}

/// Every entity under the root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullRead {
    pub hosts: Vec<HostSpec>,
    pub upstreams: Vec<UpstreamSpec>,
    pub locations: Vec<LocationSpec>,
    /// Locations with a missing field, with the field name.
    pub incomplete: Vec<(String, &'static str)>,
}

/// Ids of the directory children of `dir`.
pub(crate) async fn child_ids(
    store: &mut HierarchicalStore<'_>,
    dir: &str,
) -> Result<Vec<String>, StoreError> {
    Ok(store
        .get_dirs(dir)
        .await?
        .iter()
        .map(|k| key::base_name(k).to_string())
        .collect())
}

/// `false` when `key` does not exist.
async fn exists(store: &mut HierarchicalStore<'_>, key: &str) -> Result<bool, StoreError> {
    match store.check_key_exists(key).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

async fn optional_val(
    store: &mut HierarchicalStore<'_>,
    key: &str,
) -> Result<Option<String>, StoreError> {
    match store.get_val(key).await {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read a host, its certificate and its listeners. `None` when the host
/// directory does not exist.
pub async fn read_host(
    store: &mut HierarchicalStore<'_>,
    layout: &KeyLayout,
    id: &str,
) -> Result<Option<HostSpec>, StoreError> {
    if !exists(store, &layout.host(id)).await? {
        return Ok(None);
    }

    let cert_key = layout.cert(id);
    let certificate = if exists(store, &cert_key).await? {
        let plaintext = store.get_sealed_val(&cert_key).await?;
        let certificate: Certificate =
            serde_json::from_slice(&plaintext).map_err(|e| StoreError::decode(&cert_key, e))?;
        Some(certificate)
    } else {
        None
    };

    let mut listeners = Vec::new();
    for pair in store.get_vals(&layout.listeners(id)).await? {
        let doc: ListenerDoc =
            serde_json::from_str(&pair.value).map_err(|e| StoreError::decode(&pair.key, e))?;
        if !PROTOCOLS.contains(&doc.protocol.as_str()) {
            return Err(StoreError::decode(
                &pair.key,
                format!("unsupported protocol '{}'", doc.protocol),
            ));
        }
        if doc.address.network.is_empty() || doc.address.address.is_empty() {
            return Err(StoreError::decode(&pair.key, "address needs a network and an address"));
        }
        listeners.push(Listener {
            id: pair.name().to_string(),
            host_id: id.to_string(),
            protocol: doc.protocol,
            address: doc.address,
        });
    }

    Ok(Some(HostSpec {
        host: Host {
            id: id.to_string(),
            certificate,
        },
        listeners,
    }))
}

/// Read an upstream and its endpoints. `None` when the upstream directory
/// does not exist.
pub async fn read_upstream(
    store: &mut HierarchicalStore<'_>,
    layout: &KeyLayout,
    id: &str,
) -> Result<Option<UpstreamSpec>, StoreError> {
    if !exists(store, &layout.upstream(id)).await? {
        return Ok(None);
    }

    let mut endpoints = Vec::new();
    for pair in store.get_vals(&layout.endpoints(id)).await? {
        let url = Url::parse(pair.value.trim()).map_err(|e| StoreError::decode(&pair.key, e))?;
        if url.host_str().is_none() {
            return Err(StoreError::decode(&pair.key, format!("URL '{}' has no host", url)));
        }
        endpoints.push(Endpoint {
            id: pair.name().to_string(),
            upstream_id: id.to_string(),
            url,
        });
    }

    Ok(Some(UpstreamSpec {
        upstream: Upstream { id: id.to_string() },
        endpoints,
    }))
}

/// Read a location's fields and middlewares.
pub async fn read_location(
    store: &mut HierarchicalStore<'_>,
    layout: &KeyLayout,
    registry: &MiddlewareRegistry,
    id: &str,
) -> Result<LocationRead, StoreError> {
    if !exists(store, &layout.location(id)).await? {
        return Ok(LocationRead::Absent);
    }

    let Some(host_id) = optional_val(store, &layout.location_field(id, "host")).await? else {
        return Ok(LocationRead::Incomplete("host"));
    };
    let path_key = layout.location_field(id, "path");
    let Some(path) = optional_val(store, &path_key).await? else {
        return Ok(LocationRead::Incomplete("path"));
    };
    let Some(upstream_id) = optional_val(store, &layout.location_field(id, "upstream")).await?
    else {
        return Ok(LocationRead::Incomplete("upstream"));
    };
    if path.is_empty() {
        return Err(StoreError::decode(&path_key, "path must not be empty"));
    }

    let mut middlewares = Vec::new();
    for pair in store.get_vals(&layout.middlewares(id)).await? {
        let doc: MiddlewareDoc =
            serde_json::from_str(&pair.value).map_err(|e| StoreError::decode(&pair.key, e))?;
        registry
            .validate(&doc.kind, &doc.config)
            .map_err(|reason| StoreError::decode(&pair.key, reason))?;
        middlewares.push(Middleware {
            id: pair.name().to_string(),
            location_id: id.to_string(),
            kind: doc.kind,
            priority: doc.priority,
            config: doc.config,
        });
    }

    Ok(LocationRead::Ready(LocationSpec {
        location: Location {
            id: id.to_string(),
            host_id,
            path,
            upstream_id,
        },
        middlewares,
    }))
}

/// Read every entity below the layout's root.
pub async fn read_all(
    store: &mut HierarchicalStore<'_>,
    layout: &KeyLayout,
    registry: &MiddlewareRegistry,
) -> Result<FullRead, StoreError> {
    let mut full = FullRead::default();

    for id in child_ids(store, &layout.hosts()).await? {
        if let Some(host) = read_host(store, layout, &id).await? {
            full.hosts.push(host);
        }
    }
    for id in child_ids(store, &layout.upstreams()).await? {
        if let Some(upstream) = read_upstream(store, layout, &id).await? {
            full.upstreams.push(upstream);
        }
    }
    for id in child_ids(store, &layout.locations()).await? {
        match read_location(store, layout, registry, &id).await? {
            LocationRead::Ready(location) => full.locations.push(location),
            LocationRead::Incomplete(field) => full.incomplete.push((id, field)),
            LocationRead::Absent => {}
        }
    }

    Ok(full)
}
