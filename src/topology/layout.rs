//! Key layout of the proxy namespace.
//!
//! ```text
//! <root>/hosts/<host>/cert                        sealed certificate
//! <root>/hosts/<host>/listeners/<listener>        listener JSON
//! <root>/upstreams/<upstream>/endpoints/<ep>      endpoint URL
//! <root>/locations/<loc>/host|path|upstream       location fields
//! <root>/locations/<loc>/middlewares/<mw>         middleware JSON
//! ```

use std::fmt;

use crate::store::key;

const HOSTS: &str = "hosts";
const UPSTREAMS: &str = "upstreams";
const LOCATIONS: &str = "locations";
const LISTENERS: &str = "listeners";
const ENDPOINTS: &str = "endpoints";
const MIDDLEWARES: &str = "middlewares";
const CERT: &str = "cert";

/// Leaf fields of a location directory.
pub const LOCATION_FIELDS: [&str; 3] = ["host", "path", "upstream"];

/// The entity a changed key belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeTarget {
    /// The root itself.
    Root,
    /// A whole collection directory (`hosts`, `upstreams`, `locations`).
    Hosts,
    Upstreams,
    Locations,
    Host(String),
    Listener { host: String, id: String },
    Upstream(String),
    Endpoint { upstream: String, id: String },
    Location(String),
    Middleware { location: String, id: String },
}

impl ChangeTarget {
    /// Root entity (or collection) whose subtree has to be re-read.
    pub fn scope(&self) -> Scope {
        match self {
            ChangeTarget::Root => Scope::All,
            ChangeTarget::Hosts => Scope::Hosts,
            ChangeTarget::Upstreams => Scope::Upstreams,
            ChangeTarget::Locations => Scope::Locations,
            ChangeTarget::Host(host) | ChangeTarget::Listener { host, .. } => {
                Scope::Host(host.clone())
            }
            ChangeTarget::Upstream(upstream) | ChangeTarget::Endpoint { upstream, .. } => {
                Scope::Upstream(upstream.clone())
            }
            ChangeTarget::Location(location) | ChangeTarget::Middleware { location, .. } => {
                Scope::Location(location.clone())
            }
        }
    }
}

/// Unit of re-reading after a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    All,
    Hosts,
    Upstreams,
    Locations,
    Host(String),
    Upstream(String),
    Location(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Hosts => write!(f, "hosts"),
            Scope::Upstreams => write!(f, "upstreams"),
            Scope::Locations => write!(f, "locations"),
            Scope::Host(id) => write!(f, "host {}", id),
            Scope::Upstream(id) => write!(f, "upstream {}", id),
            Scope::Location(id) => write!(f, "location {}", id),
        }
    }
}

/// Builds and classifies keys below one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(root: &str) -> Self {
        Self {
            root: key::normalize(root),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn at(&self, parts: &[&str]) -> String {
        key::join(&self.root, &parts.join("/"))
    }

    pub fn hosts(&self) -> String {
        self.at(&[HOSTS])
    }

    pub fn host(&self, host: &str) -> String {
        self.at(&[HOSTS, host])
    }

    pub fn cert(&self, host: &str) -> String {
        self.at(&[HOSTS, host, CERT])
    }

    pub fn listeners(&self, host: &str) -> String {
        self.at(&[HOSTS, host, LISTENERS])
    }

    pub fn listener(&self, host: &str, id: &str) -> String {
        self.at(&[HOSTS, host, LISTENERS, id])
    }

    pub fn upstreams(&self) -> String {
        self.at(&[UPSTREAMS])
    }

    pub fn upstream(&self, upstream: &str) -> String {
        self.at(&[UPSTREAMS, upstream])
    }

    pub fn endpoints(&self, upstream: &str) -> String {
        self.at(&[UPSTREAMS, upstream, ENDPOINTS])
    }

    pub fn endpoint(&self, upstream: &str, id: &str) -> String {
        self.at(&[UPSTREAMS, upstream, ENDPOINTS, id])
    }

    pub fn locations(&self) -> String {
        self.at(&[LOCATIONS])
    }

    pub fn location(&self, location: &str) -> String {
        self.at(&[LOCATIONS, location])
    }

    /// One of [`LOCATION_FIELDS`] of a location.
    pub fn location_field(&self, location: &str, field: &str) -> String {
        self.at(&[LOCATIONS, location, field])
    }

    pub fn middlewares(&self, location: &str) -> String {
        self.at(&[LOCATIONS, location, MIDDLEWARES])
    }

    pub fn middleware(&self, location: &str, id: &str) -> String {
        self.at(&[LOCATIONS, location, MIDDLEWARES, id])
    }

    /// Classify a changed key by its path shape. `None` for keys outside the
    /// root or not part of the layout.
    pub fn classify(&self, changed: &str) -> Option<ChangeTarget> {
        let changed = key::normalize(changed);
        let path = key::relative(&changed, &self.root)?;
        let target = match path.as_slice() {
            [] => ChangeTarget::Root,

            [HOSTS] => ChangeTarget::Hosts,
            [HOSTS, host] | [HOSTS, host, CERT] | [HOSTS, host, LISTENERS] => {
                ChangeTarget::Host(host.to_string())
            }
            [HOSTS, host, LISTENERS, id] => ChangeTarget::Listener {
                host: host.to_string(),
                id: id.to_string(),
            },

            [UPSTREAMS] => ChangeTarget::Upstreams,
            [UPSTREAMS, upstream] | [UPSTREAMS, upstream, ENDPOINTS] => {
                ChangeTarget::Upstream(upstream.to_string())
            }
            [UPSTREAMS, upstream, ENDPOINTS, id] => ChangeTarget::Endpoint {
                upstream: upstream.to_string(),
                id: id.to_string(),
            },

            [LOCATIONS] => ChangeTarget::Locations,
            [LOCATIONS, location] | [LOCATIONS, location, MIDDLEWARES] => {
                ChangeTarget::Location(location.to_string())
            }
            [LOCATIONS, location, field] if LOCATION_FIELDS.contains(field) => {
                ChangeTarget::Location(location.to_string())
            }
            [LOCATIONS, location, MIDDLEWARES, id] => ChangeTarget::Middleware {
                location: location.to_string(),
                id: id.to_string(),
            },

            _ => return None,
        };
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_keys_below_root() {
        let layout = KeyLayout::new("proxy/");
        assert_eq!(layout.root(), "/proxy");
        assert_eq!(layout.listener("h1", "l1"), "/proxy/hosts/h1/listeners/l1");
        assert_eq!(layout.endpoint("u1", "e1"), "/proxy/upstreams/u1/endpoints/e1");
        assert_eq!(layout.location_field("loc1", "path"), "/proxy/locations/loc1/path");
        assert_eq!(layout.middleware("loc1", "m1"), "/proxy/locations/loc1/middlewares/m1");
    }

    #[test]
    fn classifies_by_path_shape() {
        let layout = KeyLayout::new("/proxy");
        assert_eq!(layout.classify("/proxy"), Some(ChangeTarget::Root));
        assert_eq!(layout.classify("/proxy/hosts"), Some(ChangeTarget::Hosts));
        assert_eq!(
            layout.classify("/proxy/hosts/h1/cert"),
            Some(ChangeTarget::Host("h1".into()))
        );
        assert_eq!(
            layout.classify("/proxy/hosts/h1/listeners/l1"),
            Some(ChangeTarget::Listener { host: "h1".into(), id: "l1".into() })
        );
        assert_eq!(
            layout.classify("/proxy/upstreams/u1/endpoints/e1").map(|t| t.scope()),
            Some(Scope::Upstream("u1".into()))
        );
        assert_eq!(
            layout.classify("/proxy/locations/loc1/upstream"),
            Some(ChangeTarget::Location("loc1".into()))
        );
        assert_eq!(
            layout.classify("/proxy/locations/loc1/middlewares/m1").map(|t| t.scope()),
            Some(Scope::Location("loc1".into()))
        );
    }

    #[test]
    fn ignores_unrelated_keys() {
        let layout = KeyLayout::new("/proxy");
        assert_eq!(layout.classify("/other/hosts/h1"), None);
        assert_eq!(layout.classify("/proxyx/hosts/h1"), None);
        assert_eq!(layout.classify("/proxy/frontends/f1"), None);
        assert_eq!(layout.classify("/proxy/locations/loc1/options"), None);
        assert_eq!(layout.classify("/proxy/hosts/h1/listeners/l1/extra"), None);
    }
}
