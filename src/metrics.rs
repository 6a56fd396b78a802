//! Prometheus metrics for the ingestion engine.

use anyhow::Result;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus exporter and describe the engine's metrics.
pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    describe_counter!("rpc_calls_total", "Total JSON-RPC round trips issued");
    describe_counter!("rpc_retries_total", "Total JSON-RPC retries");
    describe_counter!(
        "rpc_rate_limit_waits_total",
        "Rate-limit pauses that did not consume the retry budget"
    );
    describe_counter!("cache_memory_hits_total", "Day-bucket hits in the in-process tier");
    describe_counter!("cache_durable_hits_total", "Day-bucket hits in the durable tier");
    describe_counter!("cache_misses_total", "Day-bucket misses across both tiers");
    describe_counter!("rows_decoded_total", "Logs decoded into rows");
    describe_counter!("decode_failures_total", "Malformed logs dropped during decode");
    describe_counter!("days_built_total", "Day buckets built from source");
    describe_counter!("queries_total", "Top-level queries handled");
    describe_counter!("query_failures_total", "Top-level queries answered with ok=false");

    info!("metrics exporter listening on http://0.0.0.0:{}/metrics", port);
    Ok(())
}

/// Metrics helper functions. All are no-ops until a recorder is installed,
/// so library consumers and tests pay nothing.
pub struct Metrics;

impl Metrics {
    pub fn rpc_call() {
        counter!("rpc_calls_total").increment(1);
    }

    pub fn rpc_retry() {
        counter!("rpc_retries_total").increment(1);
    }

    pub fn rpc_rate_limit_wait() {
        counter!("rpc_rate_limit_waits_total").increment(1);
    }

    pub fn cache_memory_hit() {
        counter!("cache_memory_hits_total").increment(1);
    }

    pub fn cache_durable_hit() {
        counter!("cache_durable_hits_total").increment(1);
    }

    pub fn cache_miss() {
        counter!("cache_misses_total").increment(1);
    }

    pub fn row_decoded() {
        counter!("rows_decoded_total").increment(1);
    }

    pub fn decode_failure() {
        counter!("decode_failures_total").increment(1);
    }

    pub fn day_built() {
        counter!("days_built_total").increment(1);
    }

    pub fn query() {
        counter!("queries_total").increment(1);
    }

    pub fn query_failure() {
        counter!("query_failures_total").increment(1);
    }
}
