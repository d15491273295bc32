use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use market_gateway::config::Args;
use market_gateway::handlers;
use market_gateway::rate_limit::RateLimitedGateway;
use market_gateway::state::AppState;
use market_gateway::telemetry;
use market_gateway::upstream::UpstreamClient;
use market_gateway::worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.log_json);

    let client = reqwest::Client::builder()
        .timeout(args.upstream_timeout())
        .build()
        .context("failed to build upstream HTTP client")?;

    let gateway = Arc::new(RateLimitedGateway::new(args.gateway_config(), client));
    let upstream = UpstreamClient::new(&args.upstream_url, args.api_key.clone(), gateway.clone());
    let state = Arc::new(AppState::new(args.cache_config(), upstream));

    // spawn the expired-entry sweeper
    if let Some(every) = state.cache_config.sweep_interval {
        let retention = state.cache_config.stale_retention;
        tokio::spawn(worker::cache_sweeper(state.clone(), every, retention));
    }

    if args.warm_on_start {
        worker::warm_up(&state).await;
    }

    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(addr = %addr, upstream = %args.upstream_url, "gateway listening");
    info!(
        cache_ttl_secs = args.cache_ttl,
        rate_limit = args.rate_limit,
        rate_window_secs = args.rate_window,
        "limits configured"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let dropped = gateway.clear_queue();
    info!(dropped, "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
