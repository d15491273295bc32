//! Caching, rate-limited edge gateway for crypto market data.
//!
//! Requests are answered from a TTL cache ([`cache::TtlCache`]) that collapses
//! concurrent misses into one upstream call. Upstream calls go through
//! [`rate_limit::RateLimitedGateway`], which holds them to a fixed request
//! budget per window and retries transient failures with backoff.

pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod state;
pub mod telemetry;
pub mod upstream;
pub mod worker;
