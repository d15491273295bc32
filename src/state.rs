use serde_json::Value;
use std::sync::Arc;

use crate::cache::TtlCache;
use crate::config::CacheConfig;
use crate::rate_limit::RateLimitedGateway;
use crate::upstream::UpstreamClient;

// app's shared state, one per process, built in main and handed to every handler
pub struct AppState {
    pub cache: TtlCache<Value>,
    pub gateway: Arc<RateLimitedGateway>,
    pub upstream: UpstreamClient,
    pub cache_config: CacheConfig,
}

impl AppState {
    pub fn new(cache_config: CacheConfig, upstream: UpstreamClient) -> Self {
        Self {
            cache: TtlCache::new(cache_config.default_ttl),
            gateway: Arc::clone(upstream.gateway()),
            upstream,
            cache_config,
        }
    }
}
