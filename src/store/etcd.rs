//! etcd v2 keys API backend.
//!
//! # Responsibilities
//! - One recursive, sorted GET per subtree fetch
//! - Long-poll watch with `waitIndex` for the change feed
//! - Fail over across the configured members in order
//!
//! # Design Decisions
//! - The feed is lazy: no request is made until `next()` is polled, and the
//!   wait index only advances after an event has been decoded, so dropping a
//!   pending `next()` never loses an event
//! - Watch requests have no timeout; etcd answers an idle long-poll with an
//!   empty body, which the feed simply re-issues

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::config::{Consistency, StoreConfig};
use crate::observability::metrics;
use crate::store::{key, Action, Change, ChangeFeed, KvBackend, Node, StoreError, Tree};

/// etcd error code for a missing key.
const ERROR_KEY_NOT_FOUND: u64 = 100;
/// etcd error code for a wait index older than the retained history.
const ERROR_INDEX_CLEARED: u64 = 401;

/// Response header carrying the store-wide index.
const INDEX_HEADER: &str = "X-Etcd-Index";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdNode {
    /// Absent for the root node.
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(default)]
    modified_index: u64,
}

impl EtcdNode {
    fn into_node(self) -> Node {
        let key = self.key.unwrap_or_else(|| "/".to_string());
        if !self.dir {
            return Node::leaf(&key, self.value.unwrap_or_default(), self.modified_index);
        }
        let mut node = Node::dir(&key, self.modified_index);
        for child in self.nodes {
            node.insert_child(child.into_node());
        }
        node
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdResponse {
    action: String,
    node: EtcdNode,
    #[serde(default)]
    prev_node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl EtcdErrorBody {
    fn into_store_error(self, key: &str) -> StoreError {
        match self.error_code {
            ERROR_KEY_NOT_FOUND => StoreError::not_found(key),
            ERROR_INDEX_CLEARED => StoreError::Backend(format!("event index cleared: {}", self.cause)),
            code => StoreError::Backend(format!("etcd error {}: {} ({})", code, self.message, self.cause)),
        }
    }
}

/// Map an etcd action to a change action. `None` for actions that do not
/// mutate (`get`).
fn map_action(action: &str, has_prev_node: bool) -> Option<Action> {
    match action {
        "set" if has_prev_node => Some(Action::Update),
        "set" | "create" => Some(Action::Create),
        "update" | "compareAndSwap" => Some(Action::Update),
        "delete" | "compareAndDelete" => Some(Action::Delete),
        "expire" => Some(Action::Expire),
        _ => None,
    }
}

/// Decode one watch response into its index and, for mutations, a change.
fn decode_event(body: &str) -> Result<(u64, Option<Change>), StoreError> {
    let response: EtcdResponse = serde_json::from_str(body)
        .map_err(|e| StoreError::Backend(format!("malformed watch response: {}", e)))?;
    let index = response.node.modified_index;
    let key = key::normalize(response.node.key.as_deref().unwrap_or("/"));
    let change = map_action(&response.action, response.prev_node.is_some())
        .map(|action| Change { key, action, index });
    Ok((index, change))
}

/// Decode a GET response into a tree.
fn decode_tree(body: &str, index: u64) -> Result<Tree, StoreError> {
    let response: EtcdResponse = serde_json::from_str(body)
        .map_err(|e| StoreError::Backend(format!("malformed read response: {}", e)))?;
    let node = response.node.into_node();
    Ok(Tree {
        index: index.max(node.index),
        node: Some(node),
    })
}

struct Reply {
    index: u64,
    body: String,
}

/// A member's answer to a GET.
enum Answer {
    Found(Reply),
    /// The key does not exist; `index` is the store index the member reported.
    Missing { index: u64 },
}

/// Store backend over an etcd v2 cluster.
#[derive(Debug, Clone)]
pub struct EtcdBackend {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    consistency: Consistency,
    request_timeout: Duration,
}

impl EtcdBackend {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            let url = Url::parse(endpoint).map_err(|e| {
                StoreError::Backend(format!("invalid etcd endpoint '{}': {}", endpoint, e))
            })?;
            endpoints.push(url);
        }
        if endpoints.is_empty() {
            return Err(StoreError::Backend("no etcd endpoints configured".to_string()));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to build HTTP client: {}", e)))?;

        tracing::info!(
            endpoints = ?config.endpoints,
            consistency = ?config.consistency,
            "etcd backend initialized"
        );

        Ok(Self {
            client,
            endpoints,
            consistency: config.consistency,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn keys_url(endpoint: &Url, key: &str) -> String {
        format!("{}/v2/keys{}", endpoint.as_str().trim_end_matches('/'), key)
    }

    /// GET `key` with `query`, trying each member in turn. Members that cannot
    /// be reached or answer with a server error are skipped; an etcd error body
    /// is returned as is.
    async fn get(
        &self,
        key: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<Answer, StoreError> {
        let mut last_error = String::from("no etcd endpoints configured");

        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let mut request = self.client.get(Self::keys_url(endpoint, key)).query(query);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(endpoint_idx = i, error = %e, "etcd request failed, trying next endpoint");
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            let index = response
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(endpoint_idx = i, error = %e, "etcd response unreadable, trying next endpoint");
                    last_error = e.to_string();
                    continue;
                }
            };

            if status.is_success() {
                return Ok(Answer::Found(Reply { index, body }));
            }
            if let Ok(error) = serde_json::from_str::<EtcdErrorBody>(&body) {
                if error.error_code == ERROR_KEY_NOT_FOUND {
                    return Ok(Answer::Missing {
                        index: index.max(error.index),
                    });
                }
                return Err(error.into_store_error(key));
            }
            tracing::warn!(endpoint_idx = i, %status, "etcd returned an error status, trying next endpoint");
            last_error = format!("HTTP {}", status);
        }

        Err(StoreError::Backend(format!("all etcd endpoints failed: {}", last_error)))
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn fetch(&self, key: &str) -> Result<Tree, StoreError> {
        let key = key::normalize(key);
        let mut query = vec![("recursive", "true".to_string()), ("sorted", "true".to_string())];
        if self.consistency == Consistency::Strong {
            query.push(("quorum", "true".to_string()));
        }

        let started = Instant::now();
        let result = self.get(&key, &query, Some(self.request_timeout)).await;
        metrics::record_store_request("fetch", result.is_ok(), started.elapsed());

        match result? {
            Answer::Found(reply) => decode_tree(&reply.body, reply.index),
            Answer::Missing { index } => Ok(Tree { node: None, index }),
        }
    }

    async fn watch(
        &self,
        prefix: &str,
        after_index: u64,
    ) -> Result<Box<dyn ChangeFeed>, StoreError> {
        Ok(Box::new(EtcdFeed {
            backend: self.clone(),
            prefix: key::normalize(prefix),
            wait_index: after_index + 1,
        }))
    }
}

/// Long-polling change feed.
pub struct EtcdFeed {
    backend: EtcdBackend,
    prefix: String,
    wait_index: u64,
}

#[async_trait]
impl ChangeFeed for EtcdFeed {
    async fn next(&mut self) -> Result<Change, StoreError> {
        loop {
            let query = [
                ("wait", "true".to_string()),
                ("recursive", "true".to_string()),
                ("waitIndex", self.wait_index.to_string()),
            ];
            let reply = match self.backend.get(&self.prefix, &query, None).await? {
                Answer::Found(reply) => reply,
                Answer::Missing { .. } => return Err(StoreError::not_found(self.prefix.as_str())),
            };
            if reply.body.trim().is_empty() {
                continue;
            }

            let (index, change) = decode_event(&reply.body)?;
            self.wait_index = self.wait_index.max(index + 1);
            if let Some(change) = change {
                return Ok(change);
            }
        }
    }
}
