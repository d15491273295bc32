use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::cache::{WarmEntry, WarmReport};
use crate::handlers::market::UpstreamRequest;
use crate::state::AppState;

/// Periodically drop entries that have been expired for longer than
/// `retention`. Entries younger than that stay around as stale fallbacks.
pub async fn cache_sweeper(state: Arc<AppState>, every: Duration, retention: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    info!(interval = ?every, retention = ?retention, "cache sweeper started");

    loop {
        ticker.tick().await;
        let removed = state.cache.evict_expired(retention);
        if removed > 0 {
            info!(removed, remaining = state.cache.len(), "swept expired cache entries");
        } else {
            debug!("cache sweep found nothing to remove");
        }
    }
}

fn warm_entry(state: &AppState, request: UpstreamRequest) -> WarmEntry<serde_json::Value> {
    let upstream = state.upstream.clone();
    let UpstreamRequest {
        key,
        path,
        params,
        ttl,
    } = request;
    WarmEntry::new(key, ttl, move || async move {
        let params: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        upstream.get_json(&path, &params).await
    })
}

// Populate the global and trending snapshots before the first client asks
pub async fn warm_up(state: &AppState) -> WarmReport {
    let entries = vec![
        warm_entry(state, UpstreamRequest::global()),
        warm_entry(state, UpstreamRequest::trending()),
    ];
    state.cache.warm_cache(entries).await
}
