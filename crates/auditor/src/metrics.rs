use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "auditor_api_requests_total",
        "Upstream HTTP attempts, by endpoint class and status."
    );
    describe_counter!(
        "auditor_api_errors_total",
        "Upstream calls that ended in a terminal error, by kind."
    );
    describe_histogram!(
        "auditor_api_latency_ms",
        "Upstream request latency in milliseconds."
    );
    describe_counter!(
        "auditor_circuit_open_total",
        "Times an endpoint circuit breaker opened."
    );
    describe_counter!(
        "auditor_proxy_degraded_total",
        "Times a proxy was benched for its cooldown."
    );
    describe_counter!(
        "auditor_wallets_audited_total",
        "Wallets processed by the audit pipeline, by outcome."
    );
    describe_counter!(
        "auditor_discovery_hits_total",
        "Discovery hits saved from token listings."
    );
    describe_gauge!(
        "auditor_pending_wallets",
        "Wallets waiting for an audit at the start of the last batch."
    );
    describe_histogram!(
        "auditor_db_query_latency_ms",
        "SQLite call latency in milliseconds, including writer queueing."
    );
    describe_counter!(
        "auditor_db_query_errors_total",
        "SQLite calls that returned an error."
    );
    describe_counter!("tracing_error_events", "ERROR-level log events.");
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}
