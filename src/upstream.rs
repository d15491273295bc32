//! Client for the upstream market-data API. All calls go through the gateway.

use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{GatewayError, GatewayResult};
use crate::rate_limit::{FetchOptions, RateLimitedGateway};

const API_KEY_HEADER: &str = "x-cg-demo-api-key";

#[derive(Clone)]
pub struct UpstreamClient {
    base_url: String,
    api_key: Option<String>,
    gateway: Arc<RateLimitedGateway>,
}

impl UpstreamClient {
    pub fn new(base_url: &str, api_key: Option<String>, gateway: Arc<RateLimitedGateway>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            gateway,
        }
    }

    pub fn gateway(&self) -> &Arc<RateLimitedGateway> {
        &self.gateway
    }

    // Join base url + path and append the query string
    pub fn url(&self, path: &str, params: &[(&str, &str)]) -> GatewayResult<Url> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        // parse_with_params leaves a bare '?' behind when there are no params
        let parsed = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        };
        parsed.map_err(|e| GatewayError::InvalidUrl(e.to_string()))
    }

    /// GET `path` and decode the body as JSON.
    pub async fn get_json(&self, path: &str, params: &[(&str, &str)]) -> GatewayResult<Value> {
        let url = self.url(path, params)?;
        let mut options = FetchOptions::default();
        if let Some(key) = &self.api_key {
            options.headers.push((API_KEY_HEADER.to_string(), key.clone()));
        }

        self.gateway
            .rate_limited_fetch_json(url.as_str(), options)
            .await
    }
}
