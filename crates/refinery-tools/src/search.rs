use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, warn};

use refinery_core::config::WebSearchConfig;
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::SearchOracle;
use refinery_core::types::SearchHit;

const TAVILY_URL: &str = "https://api.tavily.com/search";

/// Keyword search over the Tavily API.
pub struct TavilySearch {
    api_key: String,
    max_results: usize,
    endpoint: String,
    http: reqwest::Client,
}

impl TavilySearch {
    pub fn new(api_key: &str, max_results: usize) -> Self {
        Self {
            api_key: api_key.to_string(),
            max_results,
            endpoint: TAVILY_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Point at a different search endpoint (proxies, self-hosted gateways).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn from_config(config: &WebSearchConfig) -> Self {
        Self::new(&config.api_key, config.max_results)
    }

    async fn query(&self, query: &str) -> Result<Vec<SearchHit>> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": self.max_results,
            }))
            .send()
            .await
            .map_err(|e| RefineryError::Search(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RefineryError::Search(format!("HTTP {}", status.as_u16())));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RefineryError::Search(e.to_string()))?;
        Ok(parse_results(&body))
    }
}

fn parse_results(body: &serde_json::Value) -> Vec<SearchHit> {
    body["results"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .map(|r| SearchHit {
                    title: r["title"].as_str().unwrap_or("").to_string(),
                    link: r["url"].as_str().unwrap_or("").to_string(),
                    snippet: r["content"].as_str().unwrap_or("").to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

impl SearchOracle for TavilySearch {
    fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Vec<SearchHit>> {
        Box::pin(async move {
            match self.query(query).await {
                Ok(hits) => {
                    debug!(query, hits = hits.len(), "Search completed");
                    hits
                }
                Err(e) => {
                    warn!(query, error = %e, "Search failed, returning no hits");
                    vec![]
                }
            }
        })
    }
}
