use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheStats;
use crate::rate_limit::GatewayStats;
use crate::state::AppState;

const NO_STORE: &str = "no-cache, no-store, must-revalidate";

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub cache: CacheStats,
    pub rate_limit: GatewayStats,
    pub in_flight: usize,
}

#[derive(Serialize, Debug)]
pub struct DeleteResponse {
    pub key: String,
    pub deleted: bool,
}

// introspection data is never cacheable by clients or proxies
fn uncached(status: StatusCode, body: impl Serialize) -> Response {
    (
        status,
        [
            (header::CACHE_CONTROL, NO_STORE),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        Json(body),
    )
        .into_response()
}

pub async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let body = StatsResponse {
        cache: state.cache.get_stats(),
        rate_limit: state.gateway.get_stats(),
        in_flight: state.cache.in_flight_count(),
    };
    uncached(StatusCode::OK, body)
}

pub async fn cache_items_handler(State(state): State<Arc<AppState>>) -> Response {
    uncached(StatusCode::OK, state.cache.get_cache_items())
}

pub async fn rate_limit_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    uncached(StatusCode::OK, state.gateway.get_stats())
}

pub async fn clear_cache_handler(State(state): State<Arc<AppState>>) -> Response {
    let removed = state.cache.len();
    state.cache.clear();
    info!(removed, "cache cleared");
    uncached(
        StatusCode::OK,
        serde_json::json!({ "cleared": true, "removed": removed }),
    )
}

pub async fn delete_cache_key_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    let deleted = state.cache.delete(&key);
    let status = if deleted {
        info!(key = %key, "cache entry deleted");
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    uncached(status, DeleteResponse { key, deleted })
}
