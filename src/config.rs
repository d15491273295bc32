use clap::Parser;
use std::time::Duration;

use crate::rate_limit::GatewayConfig;

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "market-gateway")]
#[command(about = "Caching, rate-limited edge for a crypto market-data API")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "MARKET_GATEWAY_PORT", default_value_t = 8080)]
    pub port: u16,

    // Upstream market-data API base url
    #[arg(short, long, env = "UPSTREAM_URL", default_value = "https://api.coingecko.com/api/v3")]
    pub upstream_url: String,

    // API key, sent as x-cg-demo-api-key when set
    #[arg(long, env = "UPSTREAM_API_KEY")]
    pub api_key: Option<String>,

    // Default cache TTL in seconds
    #[arg(short, long, env = "CACHE_TTL", default_value_t = 60)]
    pub cache_ttl: u64,

    // Rate limit max upstream requests per window
    #[arg(long, env = "RATE_LIMIT", default_value_t = 30)]
    pub rate_limit: u32,

    // Rate limit window in seconds
    #[arg(long, env = "RATE_WINDOW", default_value_t = 60)]
    pub rate_window: u64,

    // Retries after the first upstream attempt
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    // Base backoff in milliseconds, doubled each retry
    #[arg(long, env = "BACKOFF_MS", default_value_t = 1000)]
    pub backoff_ms: u64,

    // Longest single backoff in milliseconds
    #[arg(long, env = "MAX_BACKOFF_MS", default_value_t = 30_000)]
    pub max_backoff_ms: u64,

    // Max queued upstream calls, 0 = unbounded
    #[arg(long, env = "MAX_QUEUE", default_value_t = 100)]
    pub max_queue: usize,

    // Upstream request timeout in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value_t = 10)]
    pub upstream_timeout: u64,

    // Expired-entry sweep interval in seconds, 0 = disabled
    #[arg(long, env = "SWEEP_INTERVAL", default_value_t = 300)]
    pub sweep_interval: u64,

    // How long expired entries stay around for stale fallback, in seconds
    #[arg(long, env = "STALE_RETENTION", default_value_t = 3600)]
    pub stale_retention: u64,

    // Populate global + trending before serving
    #[arg(long, env = "WARM_ON_START", default_value_t = false)]
    pub warm_on_start: bool,

    // Log as JSON lines
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// Cache-side settings derived from `Args`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    /// `None` disables the sweeper.
    pub sweep_interval: Option<Duration>,
    pub stale_retention: Duration,
}

impl Args {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_requests_per_window: self.rate_limit.max(1),
            window: Duration::from_secs(self.rate_window.max(1)),
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_queue_size: (self.max_queue > 0).then_some(self.max_queue),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.cache_ttl),
            sweep_interval: (self.sweep_interval > 0)
                .then(|| Duration::from_secs(self.sweep_interval)),
            stale_retention: Duration::from_secs(self.stale_retention),
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["market-gateway"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.rate_limit, 30);
        let gw = args.gateway_config();
        assert_eq!(gw.window, Duration::from_secs(60));
        assert_eq!(gw.max_queue_size, Some(100));
        assert_eq!(gw.base_backoff, Duration::from_millis(1000));
        let cache = args.cache_config();
        assert_eq!(cache.default_ttl, Duration::from_secs(60));
        assert_eq!(cache.sweep_interval, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_zero_disables_queue_bound_and_sweeper() {
        let args = Args::parse_from([
            "market-gateway",
            "--max-queue",
            "0",
            "--sweep-interval",
            "0",
            "--rate-limit",
            "5",
        ]);
        assert_eq!(args.gateway_config().max_queue_size, None);
        assert_eq!(args.gateway_config().max_requests_per_window, 5);
        assert_eq!(args.cache_config().sweep_interval, None);
    }
}
