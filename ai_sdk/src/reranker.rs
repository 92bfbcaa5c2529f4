use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::AiError;

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
  model: &'a str,
  query: &'a str,
  documents: &'a [String],
  return_documents: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  top_n: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
  #[serde(default)]
  results: Vec<RerankResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RerankResult {
  pub index: usize,
  pub relevance_score: f32,
  #[serde(default)]
  pub document: Option<String>,
}

/// Cross-encoder reranker client (`/v1/rerank`).
#[derive(Debug, Clone)]
pub struct RerankerClient {
  client: Client,
  base_url: String,
  model: String,
}

impl RerankerClient {
  pub fn new(
    base_url: impl Into<String>,
    model: impl Into<String>,
    timeout: Duration,
  ) -> Result<Self, AiError> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| AiError::Upstream(format!("failed to build http client: {e}")))?;
    Ok(Self {
      client,
      base_url: base_url.into().trim_end_matches('/').to_string(),
      model: model.into(),
    })
  }

  /// Scores (query, document) pairs; results come back sorted by
  /// `relevance_score` descending.
  pub async fn rerank(
    &self,
    query: &str,
    documents: &[String],
    top_n: Option<usize>,
    return_documents: bool,
  ) -> Result<Vec<RerankResult>, AiError> {
    if documents.is_empty() {
      warn!("rerank called with empty documents");
      return Ok(Vec::new());
    }

    let request = RerankRequest {
      model: &self.model,
      query,
      documents,
      return_documents,
      top_n,
    };

    debug!(count = documents.len(), "reranking documents");
    let response = self
      .client
      .post(format!("{}/v1/rerank", self.base_url))
      .json(&request)
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status().as_u16();
      let body = response.text().await.unwrap_or_default();
      return Err(AiError::Http { status, body });
    }

    let rerank_response: RerankResponse = response
      .json()
      .await
      .map_err(|e| AiError::Parse(e.to_string()))?;

    Ok(rerank_response.results)
  }

  /// Fallback variant: timeouts, HTTP errors and network errors all collapse
  /// to `None` so the orchestrator can degrade to vector-only ordering.
  pub async fn rerank_with_fallback(
    &self,
    query: &str,
    documents: &[String],
    top_n: Option<usize>,
    return_documents: bool,
  ) -> Option<Vec<RerankResult>> {
    match self.rerank(query, documents, top_n, return_documents).await {
      Ok(results) => Some(results),
      Err(e) => {
        warn!("reranking failed, using fallback: {e}");
        None
      }
    }
  }
}
