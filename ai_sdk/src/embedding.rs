use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::AiError;

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
  model: String,
  input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
  data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
  embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint.
///
/// No retry logic lives here; callers retry at the stage boundary.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
  client: Client,
  base_url: String,
  model: String,
  dimension: usize,
}

impl EmbeddingClient {
  pub fn new(
    base_url: impl Into<String>,
    model: impl Into<String>,
    dimension: usize,
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
      dimension,
    })
  }

  pub fn dimension(&self) -> usize {
    self.dimension
  }

  pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError> {
    let request = EmbeddingRequest {
      model: self.model.clone(),
      input: texts,
    };

    let response = self
      .client
      .post(format!("{}/v1/embeddings", self.base_url))
      .json(&request)
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status().as_u16();
      let body = response.text().await.unwrap_or_default();
      return Err(AiError::Http { status, body });
    }

    let embedding_response: EmbeddingResponse = response
      .json()
      .await
      .map_err(|e| AiError::Parse(e.to_string()))?;

    let vectors: Vec<Vec<f32>> = embedding_response
      .data
      .into_iter()
      .map(|d| d.embedding)
      .collect();

    for vector in &vectors {
      if vector.len() != self.dimension {
        return Err(AiError::ShapeMismatch {
          expected: self.dimension,
          actual: vector.len(),
        });
      }
    }

    Ok(vectors)
  }

  pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, AiError> {
    let embeddings = self.embed(vec![text.to_string()]).await?;
    embeddings
      .into_iter()
      .next()
      .ok_or_else(|| AiError::Parse("empty embedding response".to_string()))
  }
}
