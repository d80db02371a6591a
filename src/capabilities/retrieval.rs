/// Semantic search capability
///
/// Embedding and indexing live in the knowledge service; the engine only asks
/// it for the best chunks of a namespace.
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub namespace_id: String,
    pub text: String,
    pub limit: usize,
    pub re_rank: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Value,
}

#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>>;
}

/// Knowledge service reached over HTTP
///
/// `POST {endpoint}` with `{namespaceId, queryText, limit, reRank}` returning a
/// JSON array of hits.
#[derive(Debug, Clone)]
pub struct HttpVectorSearch {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpVectorSearch {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl VectorSearch for HttpVectorSearch {
    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>> {
        tracing::debug!(
            "🔍 Searching namespace {} for \"{}\" (limit {})",
            query.namespace_id,
            query.text,
            query.limit
        );

        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({
                "namespaceId": query.namespace_id,
                "queryText": query.text,
                "limit": query.limit,
                "reRank": query.re_rank,
            }))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Knowledge search request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Knowledge search failed ({}): {}", status, body));
        }

        response
            .json::<Vec<SearchHit>>()
            .await
            .map_err(|e| anyhow::anyhow!("Unreadable knowledge search response: {}", e))
    }
}
