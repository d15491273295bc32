//! Outbound rate-limited gateway.
//!
//! Every call to the upstream API goes through `RateLimitedGateway::execute`.
//! Calls are admitted while the current fixed window has quota left; the rest
//! wait in a priority queue that a dispatcher task drains each time the window
//! rolls over. Transient failures (429, 5xx, transport errors) are retried
//! with exponential backoff, each retry going back through admission.
//!
//! Queue order is effective priority, then enqueue order. Effective priority
//! is the caller's priority plus one for every full window the call has
//! already waited, so a call can be overtaken by later calls with priority
//! `p + k` for at most `k` windows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult, UpstreamError};
use crate::metrics::{QUEUE_DEPTH, UPSTREAM_REQUESTS, UPSTREAM_RETRIES};

/// Gateway limits and retry policy.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_requests_per_window: u32,
    pub window: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Cap on a single backoff sleep, including `Retry-After` hints.
    pub max_backoff: Duration,
    /// `None` means the queue is unbounded.
    pub max_queue_size: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 30,
            window: Duration::from_secs(60),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_queue_size: Some(100),
        }
    }
}

// Rate limit window - calls admitted since window_start
#[derive(Debug)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: Instant,
    started_at: DateTime<Utc>,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            started_at: Utc::now(),
        }
    }

    fn is_elapsed(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.window_start) >= window
    }

    // window expired..? reset it
    fn roll(&mut self, now: Instant, window: Duration) {
        if self.is_elapsed(now, window) {
            self.count = 0;
            self.window_start = now;
            self.started_at = Utc::now();
        }
    }

    fn try_acquire(&mut self, now: Instant, window: Duration, limit: u32) -> bool {
        self.roll(now, window);
        if self.count < limit {
            self.count += 1;
            return true;
        }
        false
    }
}

/// Per-call options for `execute`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Higher is served first.
    pub priority: i32,
    /// Honored while queued and between attempts, never mid-call.
    pub cancel: Option<CancellationToken>,
    pub skip_retry: bool,
}

/// Options for `rate_limited_fetch`.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: reqwest::Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub priority: i32,
    pub cancel: Option<CancellationToken>,
    pub skip_retry: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: reqwest::Method::GET,
            headers: Vec::new(),
            body: None,
            priority: 0,
            cancel: None,
            skip_retry: false,
        }
    }
}

/// Load snapshot rendered by `/api/rate-limit/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub requests_in_window: u32,
    pub window_start: DateTime<Utc>,
    pub queue_size: usize,
    pub active_requests: usize,
    pub is_busy: bool,
}

struct QueuedCall {
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    grant: oneshot::Sender<()>,
}

impl QueuedCall {
    fn effective_priority(&self, now: Instant, window: Duration) -> i64 {
        let waited = now.duration_since(self.enqueued_at).as_nanos();
        let boost = waited / window.as_nanos().max(1);
        self.priority as i64 + boost.min(i64::MAX as u128) as i64
    }
}

struct GatewayState {
    window: RateWindow,
    queue: Vec<QueuedCall>,
    next_seq: u64,
    active: usize,
    dispatcher_running: bool,
}

impl GatewayState {
    /// Remove and return the call that should run next.
    fn pop_next(&mut self, now: Instant, window: Duration) -> Option<QueuedCall> {
        let idx = self
            .queue
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.effective_priority(now, window)
                    .cmp(&b.effective_priority(now, window))
                    .then_with(|| b.seq.cmp(&a.seq)) // earlier seq wins ties
            })
            .map(|(i, _)| i)?;
        Some(self.queue.remove(idx))
    }
}

fn lock(state: &Mutex<GatewayState>) -> MutexGuard<'_, GatewayState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// Takes a queued call back out of the queue if its waiter goes away before
// the grant arrives
struct QueuedSlot<'a> {
    state: &'a Mutex<GatewayState>,
    seq: u64,
    armed: bool,
}

impl Drop for QueuedSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = lock(self.state);
        state.queue.retain(|c| c.seq != self.seq);
        QUEUE_DEPTH.set(state.queue.len() as f64);
    }
}

// Counts a call as active for as long as it is executing
struct ActiveGuard<'a> {
    state: &'a Mutex<GatewayState>,
}

impl<'a> ActiveGuard<'a> {
    fn new(state: &'a Mutex<GatewayState>) -> Self {
        lock(state).active += 1;
        Self { state }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        state.active = state.active.saturating_sub(1);
    }
}

/// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
pub fn compute_backoff(config: &GatewayConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config.base_backoff.saturating_mul(factor).min(config.max_backoff)
}

/// Quota-enforcing wrapper around outbound calls. One instance per process.
pub struct RateLimitedGateway {
    config: GatewayConfig,
    client: reqwest::Client,
    state: Arc<Mutex<GatewayState>>,
}

impl RateLimitedGateway {
    pub fn new(config: GatewayConfig, client: reqwest::Client) -> Self {
        debug!(
            limit = config.max_requests_per_window,
            window_ms = config.window.as_millis() as u64,
            "rate-limited gateway initialized"
        );
        Self {
            config,
            client,
            state: Arc::new(Mutex::new(GatewayState {
                window: RateWindow::new(Instant::now()),
                queue: Vec::new(),
                next_seq: 0,
                active: 0,
                dispatcher_running: false,
            })),
        }
    }

    /// Run `op` under the rate limit, retrying transient failures.
    ///
    /// `op` is invoked once per attempt. Non-retryable errors return
    /// immediately; a retryable error on the last attempt comes back as
    /// `RetriesExhausted` wrapping it.
    pub async fn execute<F, Fut, T>(&self, mut op: F, options: ExecuteOptions) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(GatewayError::Cancelled("cancelled before execution".into()));
            }

            self.acquire(options.priority, options.cancel.as_ref()).await?;

            let result = {
                let _active = ActiveGuard::new(&self.state);
                UPSTREAM_REQUESTS.inc();
                op().await
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_retryable() || options.skip_retry {
                return Err(err);
            }
            if attempt >= self.config.max_retries {
                if attempt == 0 {
                    return Err(err);
                }
                warn!(attempts = attempt + 1, error = %err, "all retry attempts exhausted");
                return Err(GatewayError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            // a Retry-After hint is a floor, growth still applies
            let backoff = compute_backoff(&self.config, attempt);
            let delay = match err.retry_after() {
                Some(hint) => backoff.max(hint).min(self.config.max_backoff),
                None => backoff,
            };
            UPSTREAM_RETRIES.inc();
            debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );

            match &options.cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return Err(GatewayError::Cancelled("cancelled during backoff".into()));
                        }
                        _ = sleep(delay) => {}
                    }
                }
                None => sleep(delay).await,
            }
            attempt += 1;
        }
    }

    /// GET/POST `url` through `execute`. Non-2xx responses become
    /// `UpstreamError`s carrying the status.
    pub async fn rate_limited_fetch(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> GatewayResult<reqwest::Response> {
        self.fetch_with(url, options, |response| async move { Ok(response) })
            .await
    }

    /// `rate_limited_fetch` plus JSON decoding. The body is read inside each
    /// attempt, so a timeout while reading it is retried like any transport
    /// failure. Malformed JSON is a `Decode` error and is not retried.
    pub async fn rate_limited_fetch_json<T>(&self, url: &str, options: FetchOptions) -> GatewayResult<T>
    where
        T: DeserializeOwned,
    {
        self.fetch_with(url, options, read_json).await
    }

    async fn fetch_with<T, R, RFut>(
        &self,
        url: &str,
        options: FetchOptions,
        read: R,
    ) -> GatewayResult<T>
    where
        R: Fn(reqwest::Response) -> RFut,
        RFut: Future<Output = GatewayResult<T>>,
    {
        let FetchOptions {
            method,
            headers,
            body,
            priority,
            cancel,
            skip_retry,
        } = options;
        let execute_options = ExecuteOptions {
            priority,
            cancel,
            skip_retry,
        };

        self.execute(
            || {
                let mut request = self.client.request(method.clone(), url);
                for (name, value) in &headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                if let Some(body) = &body {
                    request = request.json(body);
                }
                let read = &read;
                async move {
                    let response = request.send().await.map_err(UpstreamError::from)?;
                    read(check_status(response).await?).await
                }
            },
            execute_options,
        )
        .await
    }

    // Wait for a slot in the window, queueing if it is full
    async fn acquire(&self, priority: i32, cancel: Option<&CancellationToken>) -> GatewayResult<()> {
        let (seq, granted) = {
            let mut state = lock(&self.state);
            let now = Instant::now();
            let limit = self.config.max_requests_per_window;

            // nobody waiting and quota left: run now
            if state.queue.is_empty() && state.window.try_acquire(now, self.config.window, limit) {
                return Ok(());
            }

            if let Some(capacity) = self.config.max_queue_size {
                if state.queue.len() >= capacity {
                    warn!(capacity, "gateway queue full, rejecting call");
                    return Err(GatewayError::Capacity { capacity });
                }
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueuedCall {
                priority,
                seq,
                enqueued_at: now,
                grant: tx,
            });
            QUEUE_DEPTH.set(state.queue.len() as f64);
            debug!(priority, queue_size = state.queue.len(), "window saturated, call queued");

            if !state.dispatcher_running {
                state.dispatcher_running = true;
                tokio::spawn(dispatch(
                    Arc::clone(&self.state),
                    self.config.window,
                    limit,
                ));
            }
            (seq, rx)
        };

        // dropped with this future unless the grant settles first
        let mut slot = QueuedSlot {
            state: &self.state,
            seq,
            armed: true,
        };
        let cleared = || GatewayError::Cancelled("queue cleared".into());
        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        Err(GatewayError::Cancelled("cancelled while queued".into()))
                    }
                    result = granted => {
                        slot.armed = false;
                        result.map_err(|_| cleared())
                    }
                }
            }
            None => {
                let result = granted.await;
                slot.armed = false;
                result.map_err(|_| cleared())
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.state).active
    }

    pub fn is_busy(&self) -> bool {
        let state = lock(&self.state);
        !state.queue.is_empty() || state.active > 0
    }

    /// Reject every queued call with `Cancelled`. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let mut state = lock(&self.state);
        let drained = state.queue.len();
        // dropping the senders wakes the waiters with an error
        state.queue.clear();
        QUEUE_DEPTH.set(0.0);
        if drained > 0 {
            debug!(drained, "gateway queue cleared");
        }
        drained
    }

    pub fn get_stats(&self) -> GatewayStats {
        let state = lock(&self.state);
        let requests_in_window = if state.window.is_elapsed(Instant::now(), self.config.window) {
            0
        } else {
            state.window.count
        };
        GatewayStats {
            requests_in_window,
            window_start: state.window.started_at,
            queue_size: state.queue.len(),
            active_requests: state.active,
            is_busy: !state.queue.is_empty() || state.active > 0,
        }
    }
}

// Drains the queue one window at a time; exits once it is empty
async fn dispatch(state: Arc<Mutex<GatewayState>>, window: Duration, limit: u32) {
    loop {
        let wake_at = lock(&state).window.window_start + window;
        sleep_until(wake_at).await;

        let mut guard = lock(&state);
        let now = Instant::now();
        guard.window.roll(now, window);
        while guard.window.count < limit {
            let Some(call) = guard.pop_next(now, window) else {
                break;
            };
            // a waiter that went away doesn't use up the slot
            if call.grant.send(()).is_ok() {
                guard.window.count += 1;
            }
        }
        QUEUE_DEPTH.set(guard.queue.len() as f64);
        if guard.queue.is_empty() {
            guard.dispatcher_running = false;
            return;
        }
    }
}

// Body read errors are transport failures; only a bad payload is `Decode`
async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
    let bytes = response.bytes().await.map_err(UpstreamError::from)?;
    serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()))
}

async fn check_status(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > 200 {
        let cut = (0..=200).rev().find(|i| message.is_char_boundary(*i)).unwrap_or(0);
        message.truncate(cut);
    }
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("error").to_string();
    }

    Err(UpstreamError::status(status.as_u16(), message)
        .with_retry_after(retry_after)
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(limit: u32, window_ms: u64) -> GatewayConfig {
        GatewayConfig {
            max_requests_per_window: limit,
            window: Duration::from_millis(window_ms),
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_queue_size: None,
        }
    }

    fn gateway(config: GatewayConfig) -> Arc<RateLimitedGateway> {
        Arc::new(RateLimitedGateway::new(config, reqwest::Client::new()))
    }

    async fn wait_for_queue(gw: &RateLimitedGateway, n: usize) {
        while gw.queue_size() < n {
            tokio::task::yield_now().await;
        }
    }

    fn upstream(status: u16) -> GatewayError {
        UpstreamError::status(status, "test").into()
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let config = config(1, 1000);
        assert_eq!(compute_backoff(&config, 0), Duration::from_millis(100));
        assert_eq!(compute_backoff(&config, 1), Duration::from_millis(200));
        assert_eq!(compute_backoff(&config, 2), Duration::from_millis(400));
        assert_eq!(compute_backoff(&config, 3), Duration::from_millis(800));
    }

    #[test]
    fn test_compute_backoff_capped() {
        let mut config = config(1, 1000);
        config.max_backoff = Duration::from_millis(500);
        assert_eq!(compute_backoff(&config, 3), Duration::from_millis(500));
        assert_eq!(compute_backoff(&config, 64), Duration::from_millis(500));
    }

    #[test]
    fn test_window_rolls_over() {
        let start = Instant::now();
        let window = Duration::from_secs(1);
        let mut w = RateWindow::new(start);
        assert!(w.try_acquire(start, window, 2));
        assert!(w.try_acquire(start, window, 2));
        assert!(!w.try_acquire(start, window, 2));
        let later = start + window;
        assert!(w.try_acquire(later, window, 2));
        assert_eq!(w.count, 1);
        assert_eq!(w.window_start, later);
    }

    #[test]
    fn test_pop_next_priority_then_fifo_with_age_boost() {
        let now = Instant::now();
        let window = Duration::from_secs(1);
        let mut state = GatewayState {
            window: RateWindow::new(now),
            queue: Vec::new(),
            next_seq: 0,
            active: 0,
            dispatcher_running: false,
        };
        let mut receivers = Vec::new();
        let mut push = |state: &mut GatewayState, priority: i32, seq: u64, enqueued_at: Instant| {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            state.queue.push(QueuedCall {
                priority,
                seq,
                enqueued_at,
                grant: tx,
            });
        };

        let later = now + Duration::from_secs(3);
        push(&mut state, 0, 0, now); // waited 3 windows -> effective 3
        push(&mut state, 2, 1, later);
        push(&mut state, 2, 2, later);
        push(&mut state, 5, 3, later);

        let order: Vec<u64> = std::iter::from_fn(|| state.pop_next(later, window))
            .map(|c| c.seq)
            .collect();
        assert_eq!(order, vec![3, 0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_enforcement() {
        let gw = gateway(config(2, 1000));
        let start = Instant::now();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let gw = gw.clone();
            let ran = ran.clone();
            handles.push(tokio::spawn(async move {
                gw.execute(
                    || {
                        let ran = ran.clone();
                        async move {
                            ran.lock().unwrap().push((i, Instant::now()));
                            Ok::<_, GatewayError>(i)
                        }
                    },
                    ExecuteOptions::default(),
                )
                .await
            }));
        }

        wait_for_queue(&gw, 1).await;
        tokio::task::yield_now().await;
        assert_eq!(ran.lock().unwrap().len(), 2);
        assert_eq!(gw.queue_size(), 1);
        assert_eq!(gw.get_stats().requests_in_window, 2);
        assert!(gw.is_busy());

        for h in handles {
            h.await.unwrap().unwrap();
        }
        let ran = ran.lock().unwrap();
        assert_eq!(ran.len(), 3);
        assert!(ran[2].1 >= start + Duration::from_millis(1000));
        assert_eq!(gw.queue_size(), 0);
        assert!(!gw.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_within_priority() {
        let gw = gateway(config(1, 1000));
        gw.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let gw2 = gw.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gw2.execute(
                    || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(i);
                            Ok::<_, GatewayError>(())
                        }
                    },
                    ExecuteOptions::default(),
                )
                .await
            }));
            wait_for_queue(&gw, i + 1).await;
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_served_first() {
        let gw = gateway(config(1, 1000));
        gw.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (n, priority) in [(0usize, 0i32), (1, 5)] {
            let gw2 = gw.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gw2.execute(
                    || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(priority);
                            Ok::<_, GatewayError>(())
                        }
                    },
                    ExecuteOptions {
                        priority,
                        ..Default::default()
                    },
                )
                .await
            }));
            wait_for_queue(&gw, n + 1).await;
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![5, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_429_with_growing_backoff() {
        let gw = gateway(config(100, 1000));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let result = gw
            .execute(
                || {
                    let calls = calls.clone();
                    async move {
                        let n = {
                            let mut calls = calls.lock().unwrap();
                            calls.push(Instant::now());
                            calls.len()
                        };
                        if n < 3 { Err(upstream(429)) } else { Ok("fresh") }
                    }
                },
                ExecuteOptions::default(),
            )
            .await;

        assert_eq!(result.unwrap(), "fresh");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap < second_gap);
        assert!(first_gap >= Duration::from_millis(100));
        assert!(second_gap >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_a_floor() {
        let gw = gateway(config(100, 1000));
        let calls = Arc::new(Mutex::new(Vec::new()));
        gw.execute(
            || {
                let calls = calls.clone();
                async move {
                    let n = {
                        let mut calls = calls.lock().unwrap();
                        calls.push(Instant::now());
                        calls.len()
                    };
                    if n < 2 {
                        Err(UpstreamError::status(429, "slow down")
                            .with_retry_after(Some(Duration::from_secs(2)))
                            .into())
                    } else {
                        Ok(())
                    }
                }
            },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
        let calls = calls.lock().unwrap();
        assert!(calls[1] - calls[0] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_retry_after_keeps_growing() {
        let gw = gateway(config(100, 1000));
        let calls = Arc::new(Mutex::new(Vec::new()));
        gw.execute(
            || {
                let calls = calls.clone();
                async move {
                    let n = {
                        let mut calls = calls.lock().unwrap();
                        calls.push(Instant::now());
                        calls.len()
                    };
                    if n < 3 {
                        Err(UpstreamError::status(429, "slow down")
                            .with_retry_after(Some(Duration::from_millis(150)))
                            .into())
                    } else {
                        Ok(())
                    }
                }
            },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        // max(100ms, 150ms) then max(200ms, 150ms)
        assert!(first_gap >= Duration::from_millis(150));
        assert!(second_gap >= Duration::from_millis(200));
        assert!(first_gap < second_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let mut cfg = config(100, 1000);
        cfg.max_retries = 2;
        let gw = gateway(cfg);
        let calls = Arc::new(AtomicU32::new(0));

        let err = gw
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(upstream(503)) }
                },
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, GatewayError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let gw = gateway(config(100, 1000));
        let calls = Arc::new(AtomicU32::new(0));

        let err = gw
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(upstream(404)) }
                },
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.status(), Some(404));
        assert!(matches!(err, GatewayError::Upstream(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_retry() {
        let gw = gateway(config(100, 1000));
        let calls = Arc::new(AtomicU32::new(0));

        let err = gw
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(upstream(429)) }
                },
                ExecuteOptions {
                    skip_retry: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.status(), Some(429));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued_never_runs() {
        let gw = gateway(config(1, 1000));
        gw.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
            .await
            .unwrap();

        let token = CancellationToken::new();
        let invoked = Arc::new(AtomicU32::new(0));
        let handle = {
            let gw = gw.clone();
            let invoked = invoked.clone();
            let token = token.clone();
            tokio::spawn(async move {
                gw.execute(
                    || {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<_, GatewayError>(()) }
                    },
                    ExecuteOptions {
                        cancel: Some(token),
                        ..Default::default()
                    },
                )
                .await
            })
        };

        wait_for_queue(&gw, 1).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(gw.queue_size(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiter_leaves_queue() {
        let mut cfg = config(1, 1000);
        cfg.max_queue_size = Some(1);
        let gw = gateway(cfg);
        gw.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
            .await
            .unwrap();

        let gave_up = tokio::time::timeout(
            Duration::from_millis(10),
            gw.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default()),
        )
        .await;
        assert!(gave_up.is_err());
        assert_eq!(gw.queue_size(), 0);
        assert!(!gw.is_busy());

        // the freed slot takes a new waiter instead of a Capacity error
        let queued = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(|| async { Ok::<_, GatewayError>(7) }, ExecuteOptions::default())
                    .await
            })
        };
        wait_for_queue(&gw, 1).await;
        assert_eq!(queued.await.unwrap().unwrap(), 7);
        assert_eq!(gw.queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let gw = gateway(config(100, 1000));
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };

        let err = gw
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(upstream(500)) }
                },
                ExecuteOptions {
                    cancel: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_rejects() {
        let mut cfg = config(1, 1000);
        cfg.max_queue_size = Some(1);
        let gw = gateway(cfg);
        gw.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
            .await
            .unwrap();

        let queued = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
                    .await
            })
        };
        wait_for_queue(&gw, 1).await;

        let err = gw
            .execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Capacity { capacity: 1 }));

        queued.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_rejects_waiters() {
        let gw = gateway(config(1, 1000));
        gw.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..2 {
            let gw2 = gw.clone();
            handles.push(tokio::spawn(async move {
                gw2.execute(|| async { Ok::<_, GatewayError>(()) }, ExecuteOptions::default())
                    .await
            }));
            wait_for_queue(&gw, i + 1).await;
        }

        assert_eq!(gw.clear_queue(), 2);
        for h in handles {
            assert!(h.await.unwrap().unwrap_err().is_cancelled());
        }
        assert!(!gw.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_count_tracks_executing_calls() {
        let gw = gateway(config(10, 1000));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let handle = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(
                    || {
                        let release_rx = release_rx.clone();
                        async move {
                            if let Some(rx) = release_rx.lock().await.take() {
                                let _ = rx.await;
                            }
                            Ok::<_, GatewayError>(())
                        }
                    },
                    ExecuteOptions::default(),
                )
                .await
            })
        };

        while gw.active_count() == 0 {
            tokio::task::yield_now().await;
        }
        let stats = gw.get_stats();
        assert_eq!(stats.active_requests, 1);
        assert!(stats.is_busy);

        release_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(gw.active_count(), 0);
        assert!(!gw.is_busy());
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let gw = RateLimitedGateway::new(config(5, 1000), reqwest::Client::new());
        let v = serde_json::to_value(gw.get_stats()).unwrap();
        for field in ["requestsInWindow", "windowStart", "queueSize", "activeRequests", "isBusy"] {
            assert!(v.get(field).is_some(), "missing {field}");
        }
    }
}
