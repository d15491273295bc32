use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::cache::cache_key;
use crate::error::GatewayError;
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL, STALE_SERVED};
use crate::models::{ErrorBody, MarketsQuery, SearchQuery};
use crate::state::AppState;

/// HIT, MISS or STALE on every market response.
pub const CACHE_STATUS_HEADER: &str = "x-cache-status";

pub const COIN_TTL: Duration = Duration::from_secs(120);
pub const TRENDING_TTL: Duration = Duration::from_secs(300);
pub const GLOBAL_TTL: Duration = Duration::from_secs(120);
pub const SEARCH_TTL: Duration = Duration::from_secs(300);

// One upstream resource: where to fetch it, how to key and keep it
pub(crate) struct UpstreamRequest {
    pub key: String,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub ttl: Duration,
}

impl UpstreamRequest {
    pub fn new(kind: &str, path: &str, params: &[(&str, &str)], ttl: Duration) -> Self {
        Self {
            key: cache_key(kind, params),
            path: path.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ttl,
        }
    }

    pub fn global() -> Self {
        Self::new("global", "global", &[], GLOBAL_TTL)
    }

    pub fn trending() -> Self {
        Self::new("trending", "search/trending", &[], TRENDING_TTL)
    }
}

// Serve from cache, fetching through the gateway on a miss and falling
// back to stale data when the upstream fails
async fn serve_cached(state: &AppState, request: UpstreamRequest) -> Response {
    REQUEST_TOTAL.inc();
    let start_time = Instant::now();

    let UpstreamRequest {
        key,
        path,
        params,
        ttl,
    } = request;
    let cache_status = if state.cache.has(&key) { "HIT" } else { "MISS" };

    let upstream = state.upstream.clone();
    let result = state
        .cache
        .dedupe_request(
            &key,
            move || async move {
                let params: Vec<(&str, &str)> = params
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                upstream.get_json(&path, &params).await
            },
            ttl,
        )
        .await;

    let response = match result {
        Ok(value) => with_cache_status(Json(value), cache_status),
        Err(err) => match state.cache.get_stale(&key) {
            Some(stale) => {
                warn!(key = %key, error = %err, "upstream failed, serving stale data");
                STALE_SERVED.inc();
                with_cache_status(Json(stale), "STALE")
            }
            None => {
                warn!(key = %key, error = %err, "upstream failed, no cached data");
                error_response(&err)
            }
        },
    };

    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());
    response
}

fn with_cache_status(body: impl IntoResponse, status: &'static str) -> Response {
    (
        [(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            HeaderValue::from_static(status),
        )],
        body,
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message))).into_response()
}

// Map a failed fetch to what the client sees
pub(crate) fn error_response(err: &GatewayError) -> Response {
    let rate_limited = matches!(err, GatewayError::Capacity { .. }) || err.status() == Some(429);
    if err.status() == Some(404) {
        (StatusCode::NOT_FOUND, Json(ErrorBody::new("Resource not found"))).into_response()
    } else if rate_limited {
        let retry_after = err.retry_after().map(|d| d.as_secs().max(1)).unwrap_or(60);
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.to_string())],
            Json(ErrorBody::new("Rate limit exceeded. Please try again later.")),
        )
            .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new("Failed to fetch market data")),
        )
            .into_response()
    }
}

// coin ids are lowercase slugs like "bitcoin" or "usd-coin"
fn is_valid_coin_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 100
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub async fn markets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MarketsQuery>,
) -> Response {
    let query = query.normalized();
    let page = query.page.to_string();
    let per_page = query.per_page.to_string();
    let params = [
        ("vs_currency", query.vs_currency.as_str()),
        ("order", query.order.as_str()),
        ("page", page.as_str()),
        ("per_page", per_page.as_str()),
    ];
    let ttl = state.cache.default_ttl();
    serve_cached(&state, UpstreamRequest::new("coins", "coins/markets", &params, ttl)).await
}

pub async fn coin_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if !is_valid_coin_id(&id) {
        return bad_request("Invalid coin id");
    }
    let id = id.to_lowercase();
    let request = UpstreamRequest {
        key: cache_key("coin", &[("id", id.as_str())]),
        path: format!("coins/{}", id),
        params: vec![
            ("localization".into(), "false".into()),
            ("tickers".into(), "false".into()),
            ("community_data".into(), "false".into()),
            ("developer_data".into(), "false".into()),
        ],
        ttl: COIN_TTL,
    };
    serve_cached(&state, request).await
}

pub async fn trending_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_cached(&state, UpstreamRequest::trending()).await
}

pub async fn global_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_cached(&state, UpstreamRequest::global()).await
}

pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let term = query.query.trim().to_lowercase();
    if term.is_empty() {
        return bad_request("Query parameter 'query' is required");
    }
    serve_cached(
        &state,
        UpstreamRequest::new("search", "search", &[("query", term.as_str())], SEARCH_TTL),
    )
    .await
}
