//! Metrics collection and exposition.
//!
//! # Metrics
//! - `cluster_client_requests_total` (counter): requests by server, outcome
//! - `cluster_client_request_duration_seconds` (histogram): latency per server
//! - `cluster_client_connections` (gauge): connections per server and state
//! - `cluster_client_pending_acquires` (gauge): queued acquirers per server
//! - `cluster_client_server_health` (gauge): 1=healthy, 0=unhealthy
//! - `cluster_client_correlation_mismatches_total` (counter)
//! - `cluster_client_connections_closed_total` (counter): by close reason
//! - `cluster_client_probes_total` (counter): by result

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::address::ServerAddress;
use crate::pool::PoolStats;

/// Install the Prometheus recorder with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> bool {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            tracing::info!(address = %addr, "Metrics exporter listening");
            true
        }
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter");
            false
        }
    }
}

/// Record a finished request.
pub fn record_request(server: &ServerAddress, outcome: &'static str, start: Instant) {
    let server = server.to_string();
    counter!("cluster_client_requests_total", "server" => server.clone(), "outcome" => outcome)
        .increment(1);
    histogram!("cluster_client_request_duration_seconds", "server" => server)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_connection_closed(server: &ServerAddress, reason: &'static str) {
    counter!(
        "cluster_client_connections_closed_total",
        "server" => server.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_mismatch(server: &ServerAddress) {
    counter!("cluster_client_correlation_mismatches_total", "server" => server.to_string())
        .increment(1);
}

pub fn record_pool(server: &ServerAddress, stats: &PoolStats) {
    let server = server.to_string();
    gauge!("cluster_client_connections", "server" => server.clone(), "state" => "active")
        .set(stats.active as f64);
    gauge!("cluster_client_connections", "server" => server.clone(), "state" => "idle")
        .set(stats.idle as f64);
    gauge!("cluster_client_pending_acquires", "server" => server).set(stats.waiting as f64);
}

pub fn record_server_health(server: &ServerAddress, healthy: bool) {
    gauge!("cluster_client_server_health", "server" => server.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_probe(server: &ServerAddress, success: bool) {
    counter!(
        "cluster_client_probes_total",
        "server" => server.to_string(),
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}
