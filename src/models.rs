use serde::{Deserialize, Serialize};

fn default_currency() -> String {
    "usd".to_string()
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

fn default_order() -> String {
    "market_cap_desc".to_string()
}

// Query for /api/coins/markets
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MarketsQuery {
    #[serde(default = "default_currency")]
    pub vs_currency: String,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_order")]
    pub order: String,
}

impl MarketsQuery {
    pub const MAX_PER_PAGE: u32 = 250;

    // clamp paging into what the upstream accepts
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.per_page = self.per_page.clamp(1, Self::MAX_PER_PAGE);
        self.vs_currency = self.vs_currency.to_lowercase();
        self
    }
}

// Query for /api/search
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct SearchQuery {
    #[serde(default)]
    pub query: String,
}

// Error payload for every non-2xx response
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markets_query_defaults() {
        let q: MarketsQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.vs_currency, "usd");
        assert_eq!(q.page, 1);
        assert_eq!(q.per_page, 20);
        assert_eq!(q.order, "market_cap_desc");
    }

    #[test]
    fn test_markets_query_normalized() {
        let q = MarketsQuery {
            vs_currency: "EUR".into(),
            page: 0,
            per_page: 1000,
            order: "volume_desc".into(),
        }
        .normalized();
        assert_eq!(q.vs_currency, "eur");
        assert_eq!(q.page, 1);
        assert_eq!(q.per_page, 250);
    }
}
