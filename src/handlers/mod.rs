mod health;
mod introspection;
pub(crate) mod market;
mod metrics;

use axum::{
    Router,
    routing::{delete, get},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use health::health_handler;
pub use introspection::{
    cache_items_handler, cache_stats_handler, clear_cache_handler, delete_cache_key_handler,
    rate_limit_stats_handler,
};
pub use market::{
    coin_handler, global_handler, markets_handler, search_handler, trending_handler,
    CACHE_STATUS_HEADER,
};
pub use metrics::metrics_handler;

// every route the gateway serves
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/coins/markets", get(markets_handler))
        .route("/api/coins/{id}", get(coin_handler))
        .route("/api/trending", get(trending_handler))
        .route("/api/global", get(global_handler))
        .route("/api/search", get(search_handler))
        .route("/api/cache/stats", get(cache_stats_handler))
        .route("/api/cache/items", get(cache_items_handler))
        .route("/api/cache", delete(clear_cache_handler))
        .route("/api/cache/{key}", delete(delete_cache_key_handler))
        .route("/api/rate-limit/stats", get(rate_limit_stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
