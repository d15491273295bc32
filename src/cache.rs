//! In-memory TTL cache with single-flight request deduplication.
//!
//! Entries expire lazily: `get()` evicts an expired entry when it finds one,
//! while `get_stale()` still returns it so route handlers can fall back to old
//! data when the upstream is failing. The background sweeper in `worker.rs`
//! reclaims entries that have been expired for longer than the stale
//! retention window.
//!
//! `dedupe_request()` collapses concurrent misses for the same key into one
//! fetch. The fetch runs on its own task, so it completes and populates the
//! cache even if every caller waiting on it goes away.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::metrics::{CACHE_HITS, CACHE_MISSES, CACHE_SIZE};

// Cache entry with timestamps
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub size: usize, // serialized JSON length
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Hit/miss counters plus derived figures, as rendered by `/api/cache/stats`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub hit_rate_percentage: String,
    pub item_count: usize,
    pub size: usize,
}

/// One row of `/api/cache/items`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheItem {
    pub key: String,
    pub size: usize,
    #[serde(rename = "remainingTTL")]
    pub remaining_ttl: String,
}

/// Outcome of a `warm_cache` run.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct WarmReport {
    pub warmed: usize,
    pub failed: usize,
}

type Fetcher<V, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<V, E>> + Send>;

/// A key to populate ahead of traffic.
pub struct WarmEntry<V, E = GatewayError> {
    pub key: String,
    pub ttl: Duration,
    fetcher: Fetcher<V, E>,
}

impl<V, E> WarmEntry<V, E> {
    pub fn new<F, Fut>(key: impl Into<String>, ttl: Duration, fetcher: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        Self {
            key: key.into(),
            ttl,
            fetcher: Box::new(move || fetcher().boxed()),
        }
    }
}

type InFlight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// Removes the in-flight slot when the fetch task finishes, panics included.
struct InFlightGuard<V, E> {
    in_flight: Arc<DashMap<String, InFlight<V, E>>>,
    key: String,
}

impl<V, E> Drop for InFlightGuard<V, E> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Thread-safe TTL cache keyed by string.
///
/// `V` is the stored payload; it must serialize so the cache can report an
/// approximate byte size. `E` is the error type of the fetch functions passed
/// to `dedupe_request`, returned to callers unchanged.
pub struct TtlCache<V, E = GatewayError> {
    entries: Arc<DashMap<String, CacheEntry<V>>>,
    in_flight: Arc<DashMap<String, InFlight<V, E>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    default_ttl: Duration,
}

impl<V, E> TtlCache<V, E>
where
    V: Clone + Serialize + Send + Sync + 'static,
    E: Clone + Display + From<tokio::task::JoinError> + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get a live value. An expired entry is removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        self.lookup(key, true)
    }

    // Counted lookup. `dedupe_request` passes `evict = false` so an expired
    // entry survives a failed refresh for `get_stale`.
    fn lookup(&self, key: &str, evict: bool) -> Option<V> {
        let now = Instant::now();
        let found = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(entry) if evict => {
                drop(entry); // release read lock before removing
                // only evict if nobody refreshed the key in between
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                CACHE_SIZE.set(self.entries.len() as f64);
                None
            }
            _ => None,
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            CACHE_HITS.inc();
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            CACHE_MISSES.inc();
        }
        found
    }

    /// Get a value whether or not it has expired. Does not touch the counters.
    pub fn get_stale(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Present and not expired. Does not touch the counters.
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| !e.is_expired(Instant::now()))
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        insert_entry(&self.entries, key.into(), value, ttl);
    }

    pub fn set_default(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        CACHE_SIZE.set(self.entries.len() as f64);
        removed
    }

    /// Drop every entry and reset the hit/miss counters.
    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        CACHE_SIZE.set(0.0);
    }

    /// Number of entries, including ones that have logically expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of fetches currently running under `dedupe_request`.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Return the cached value for `key`, or run `fetch` once no matter how
    /// many callers ask for the same key concurrently.
    ///
    /// On success the value is stored with `ttl`. On failure nothing is
    /// stored and every waiter gets the same error; the next call fetches
    /// again. A panic inside `fetch` surfaces as `E::from(JoinError)`.
    pub async fn dedupe_request<F, Fut>(&self, key: &str, fetch: F, ttl: Duration) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        // The entry lock on the in-flight map makes check-then-register atomic
        // for this key. The live-entry check has to happen under it too, or a
        // fetch finishing in between would be started a second time.
        let shared = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(slot) => {
                if let Some(value) = self.lookup(key, false) {
                    return Ok(value);
                }
                debug!(key = %key, "joining in-flight fetch");
                slot.get().clone()
            }
            Entry::Vacant(slot) => {
                if let Some(value) = self.lookup(key, false) {
                    return Ok(value);
                }
                debug!(key = %key, "cache miss, starting fetch");
                let shared = self.spawn_fetch(key.to_string(), fetch, ttl);
                slot.insert(shared.clone());
                shared
            }
        };

        shared.await
    }

    fn spawn_fetch<F, Fut>(&self, key: String, fetch: F, ttl: Duration) -> InFlight<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.clone(),
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = fetch().await;
            match &result {
                Ok(value) => insert_entry(&entries, key, value.clone(), ttl),
                Err(e) => debug!(key = %key, error = %e, "fetch failed"),
            }
            result
            // _guard drops here: the slot goes away after the entry is stored
        });

        async move { handle.await.unwrap_or_else(|e| Err(E::from(e))) }
            .boxed()
            .shared()
    }

    /// Populate several keys concurrently. One failing fetcher does not stop
    /// the rest.
    pub async fn warm_cache(&self, entries: Vec<WarmEntry<V, E>>) -> WarmReport {
        let total = entries.len();
        let runs = entries.into_iter().map(|entry| async move {
            let WarmEntry { key, ttl, fetcher } = entry;
            match self.dedupe_request(&key, fetcher, ttl).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "cache warm-up failed");
                    false
                }
            }
        });

        let warmed = join_all(runs).await.into_iter().filter(|ok| *ok).count();
        let report = WarmReport {
            warmed,
            failed: total - warmed,
        };
        info!(warmed = report.warmed, failed = report.failed, "cache warm-up finished");
        report
    }

    /// All entries sorted by key, expired ones included (this view never evicts).
    pub fn get_cache_items(&self) -> Vec<CacheItem> {
        let now = Instant::now();
        let mut items: Vec<CacheItem> = self
            .entries
            .iter()
            .map(|e| CacheItem {
                key: e.key().clone(),
                size: e.size,
                remaining_ttl: format_remaining(e.expires_at, now),
            })
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    pub fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hit_rate = hit_rate(hits, misses);
        CacheStats {
            hits,
            misses,
            hit_rate,
            hit_rate_percentage: format!("{:.2}%", hit_rate * 100.0),
            item_count: self.entries.len(),
            size: self.entries.iter().map(|e| e.size).sum(),
        }
    }

    /// Remove entries that expired more than `retention` ago. Returns how many
    /// were dropped.
    pub fn evict_expired(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| match e.expires_at.checked_add(retention) {
            Some(deadline) => now < deadline,
            None => true,
        });
        CACHE_SIZE.set(self.entries.len() as f64);
        before.saturating_sub(self.entries.len())
    }
}

fn insert_entry<V: Serialize>(
    entries: &DashMap<String, CacheEntry<V>>,
    key: String,
    value: V,
    ttl: Duration,
) {
    let size = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(0);
    let now = Instant::now();
    entries.insert(
        key,
        CacheEntry {
            value,
            size,
            expires_at: now + ttl,
        },
    );
    CACHE_SIZE.set(entries.len() as f64);
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

// "42s" or "Expired"
fn format_remaining(expires_at: Instant, now: Instant) -> String {
    if expires_at <= now {
        "Expired".to_string()
    } else {
        format!("{}s", (expires_at - now).as_secs())
    }
}

/// Build a cache key: resource type, then `name=value` pairs sorted by name.
///
/// `cache_key("coins", &[("per_page", "20"), ("page", "1")])` gives
/// `"coins:page=1-per_page=20"`.
pub fn cache_key(kind: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return kind.to_string();
    }
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("-");
    format!("{}:{}", kind, joined)
}
