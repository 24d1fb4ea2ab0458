//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_control_store_requests_total` (counter): store requests by operation, outcome
//! - `proxy_control_store_request_duration_seconds` (histogram): store latency
//! - `proxy_control_changes_total` (counter): change notifications by action
//! - `proxy_control_server_calls_total` (counter): server mutations by kind, operation, outcome
//! - `proxy_control_reconcile_duration_seconds` (histogram): time to apply one change
//! - `proxy_control_topology_entities` (gauge): entities in the published topology
//! - `proxy_control_deferred_locations` (gauge): locations waiting for a dependency
//! - `proxy_control_routing_version` (gauge): routing table snapshot version
//! - `proxy_control_active_connections` (gauge): connections held by the routing table
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users
//!   and tests never need to initialize anything

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

fn describe_metrics() {
    describe_counter!("proxy_control_store_requests_total", "Requests issued to the remote store");
    describe_histogram!(
        "proxy_control_store_request_duration_seconds",
        "Remote store request latency in seconds"
    );
    describe_counter!("proxy_control_changes_total", "Change notifications received");
    describe_counter!("proxy_control_server_calls_total", "Mutations applied to the proxy server");
    describe_histogram!(
        "proxy_control_reconcile_duration_seconds",
        "Time spent applying one change notification"
    );
    describe_gauge!("proxy_control_topology_entities", "Entities in the published topology");
    describe_gauge!("proxy_control_deferred_locations", "Locations waiting for a host or upstream");
    describe_gauge!("proxy_control_routing_version", "Routing table snapshot version");
    describe_gauge!("proxy_control_active_connections", "Connections held by the routing table");
}

fn outcome(success: bool) -> &'static str {
    if success {
        "ok"
    } else {
        "error"
    }
}

/// Record one request against the remote store.
pub fn record_store_request(operation: &'static str, success: bool, duration: Duration) {
    counter!(
        "proxy_control_store_requests_total",
        "operation" => operation,
        "outcome" => outcome(success)
    )
    .increment(1);
    histogram!("proxy_control_store_request_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

pub fn record_change(action: &'static str) {
    counter!("proxy_control_changes_total", "action" => action).increment(1);
}

/// Record one upsert or delete issued to the proxy server.
pub fn record_server_call(kind: &'static str, operation: &'static str, success: bool) {
    counter!(
        "proxy_control_server_calls_total",
        "kind" => kind,
        "operation" => operation,
        "outcome" => outcome(success)
    )
    .increment(1);
}

pub fn record_reconcile(duration: Duration) {
    histogram!("proxy_control_reconcile_duration_seconds").record(duration.as_secs_f64());
}

pub fn set_topology_entities(count: usize) {
    gauge!("proxy_control_topology_entities").set(count as f64);
}

pub fn set_deferred_locations(count: usize) {
    gauge!("proxy_control_deferred_locations").set(count as f64);
}

pub fn set_routing_version(version: u64) {
    gauge!("proxy_control_routing_version").set(version as f64);
}

pub fn set_active_connections(count: u64) {
    gauge!("proxy_control_active_connections").set(count as f64);
}
