use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge,
    register_histogram,
};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("market_requests_total", "Total number of API requests").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "market_request_latency_seconds",
        "API request latency in seconds"
    )
    .unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("market_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("market_cache_misses_total", "Total cache misses").unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("market_cache_size", "Current number of items in cache").unwrap();
    pub static ref STALE_SERVED: Counter = register_counter!(
        "market_stale_responses_total",
        "Responses served from expired cache entries after an upstream failure"
    )
    .unwrap();
    pub static ref UPSTREAM_REQUESTS: Counter =
        register_counter!("market_upstream_requests_total", "Calls sent to the upstream API").unwrap();
    pub static ref UPSTREAM_RETRIES: Counter =
        register_counter!("market_upstream_retries_total", "Upstream calls retried after a transient failure").unwrap();
    pub static ref QUEUE_DEPTH: Gauge =
        register_gauge!("market_gateway_queue_depth", "Calls waiting for a rate limit slot").unwrap();
}

// Render every registered metric in the prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
