//! REST client for a Qdrant-style vector engine.
//!
//! Cosine is the primary distance; `score_threshold` prunes server-side.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use docchat_core::{kst, CollectionInfo, CoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
  Cosine,
  Euclid,
  Dot,
}

impl Distance {
  pub const fn as_str(&self) -> &'static str {
    match self {
      Self::Cosine => "Cosine",
      Self::Euclid => "Euclid",
      Self::Dot => "Dot",
    }
  }
}

/// One scored point. `score` is the engine-native similarity; higher is
/// better for cosine and dot.
#[derive(Debug, Clone, Deserialize)]
pub struct Hit {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(default)]
  pub score: f32,
  #[serde(default)]
  pub payload: Value,
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let value = Value::deserialize(deserializer)?;
  Ok(match value {
    Value::String(s) => s,
    other => other.to_string(),
  })
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
  vector: &'a [f32],
  limit: usize,
  with_payload: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  score_threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
  #[serde(default)]
  result: Vec<Hit>,
}

#[derive(Debug, Serialize)]
struct ScrollRequest {
  limit: usize,
  with_payload: bool,
  with_vector: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  offset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ScrollResponse {
  result: ScrollResult,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
  #[serde(default)]
  points: Vec<Hit>,
  #[serde(default)]
  next_page_offset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CollectionsResponse {
  result: CollectionsResult,
}

#[derive(Debug, Deserialize)]
struct CollectionsResult {
  #[serde(default)]
  collections: Vec<CollectionName>,
}

#[derive(Debug, Deserialize)]
struct CollectionName {
  name: String,
}

#[derive(Debug, Deserialize)]
struct CollectionDetailResponse {
  result: CollectionDetail,
}

#[derive(Debug, Default, Deserialize)]
struct CollectionDetail {
  #[serde(default)]
  points_count: Option<u64>,
  #[serde(default)]
  config: Option<CollectionConfig>,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
  params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
  vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
  #[serde(default)]
  size: u64,
  #[serde(default)]
  distance: Option<String>,
}

pub struct VectorStoreClient {
  client: Client,
  base_url: String,
  api_key: Option<String>,
}

impl VectorStoreClient {
  pub fn new(
    base_url: impl Into<String>,
    api_key: Option<String>,
    timeout: Duration,
  ) -> Result<Self, CoreError> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| CoreError::Internal(format!("failed to build http client: {e}")))?;
    Ok(Self {
      client,
      base_url: base_url.into().trim_end_matches('/').to_string(),
      api_key,
    })
  }

  fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
    let mut builder = self
      .client
      .request(method, format!("{}{}", self.base_url, path));
    if let Some(key) = &self.api_key {
      builder = builder.header("api-key", key);
    }
    builder
  }

  async fn check(&self, response: reqwest::Response, context: &str) -> Result<reqwest::Response, CoreError> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
      return Err(CoreError::NotFound(format!("{context}: {body}")));
    }
    Err(CoreError::UpstreamUnavailable(format!(
      "{context}: {status} {body}"
    )))
  }

  pub async fn collection_exists(&self, name: &str) -> Result<bool, CoreError> {
    let response = self
      .request(reqwest::Method::GET, &format!("/collections/{name}/exists"))
      .send()
      .await
      .map_err(CoreError::upstream)?;
    if !response.status().is_success() {
      return Ok(false);
    }
    let body: Value = response.json().await.map_err(CoreError::upstream)?;
    Ok(
      body
        .pointer("/result/exists")
        .and_then(Value::as_bool)
        .unwrap_or(false),
    )
  }

  pub async fn create_collection(
    &self,
    name: &str,
    dimension: usize,
    distance: Distance,
  ) -> Result<(), CoreError> {
    validate_collection_name(name)?;
    if self.collection_exists(name).await? {
      return Err(CoreError::AlreadyExists(format!("collection '{name}'")));
    }
    let body = serde_json::json!({
      "vectors": { "size": dimension, "distance": distance.as_str() }
    });
    let response = self
      .request(reqwest::Method::PUT, &format!("/collections/{name}"))
      .json(&body)
      .send()
      .await
      .map_err(CoreError::upstream)?;
    self.check(response, "create collection").await?;
    info!("created collection '{name}' (dim {dimension}, {})", distance.as_str());
    Ok(())
  }

  pub async fn delete_collection(&self, name: &str) -> Result<(), CoreError> {
    if !self.collection_exists(name).await? {
      return Err(CoreError::NotFound(format!("collection '{name}'")));
    }
    let response = self
      .request(reqwest::Method::DELETE, &format!("/collections/{name}"))
      .send()
      .await
      .map_err(CoreError::upstream)?;
    self.check(response, "delete collection").await?;
    info!("deleted collection '{name}'");
    Ok(())
  }

  /// Upserts points. Every vector must match the collection dimension; the
  /// engine enforces this, and the upload path validates before calling.
  pub async fn upsert(
    &self,
    name: &str,
    points: Vec<(String, Vec<f32>, Value)>,
  ) -> Result<(), CoreError> {
    let wire_points: Vec<Value> = points
      .into_iter()
      .map(|(id, vector, payload)| {
        serde_json::json!({ "id": id, "vector": vector, "payload": payload })
      })
      .collect();
    let body = serde_json::json!({ "points": wire_points });
    let response = self
      .request(
        reqwest::Method::PUT,
        &format!("/collections/{name}/points?wait=true"),
      )
      .json(&body)
      .send()
      .await
      .map_err(CoreError::upstream)?;
    self.check(response, "upsert points").await?;
    Ok(())
  }

  pub async fn search(
    &self,
    name: &str,
    query_vector: &[f32],
    limit: usize,
    score_threshold: Option<f32>,
  ) -> Result<Vec<Hit>, CoreError> {
    let request = SearchRequest {
      vector: query_vector,
      limit,
      with_payload: true,
      score_threshold,
    };
    let response = self
      .request(
        reqwest::Method::POST,
        &format!("/collections/{name}/points/search"),
      )
      .json(&request)
      .send()
      .await
      .map_err(CoreError::upstream)?;
    let response = self.check(response, "vector search").await?;
    let parsed: SearchResponse = response
      .json()
      .await
      .map_err(|e| CoreError::Parse(e.to_string()))?;
    Ok(parsed.result)
  }

  /// Pages through a collection. `fields` trims payloads to the listed keys.
  pub async fn scroll(
    &self,
    name: &str,
    limit: usize,
    offset: Option<Value>,
    fields: Option<&[&str]>,
  ) -> Result<(Vec<Hit>, Option<Value>), CoreError> {
    let mut body = serde_json::to_value(ScrollRequest {
      limit,
      with_payload: true,
      with_vector: false,
      offset,
    })
    .map_err(|e| CoreError::Internal(e.to_string()))?;
    if let Some(fields) = fields {
      body["with_payload"] = serde_json::json!({ "include": fields });
    }
    let response = self
      .request(
        reqwest::Method::POST,
        &format!("/collections/{name}/points/scroll"),
      )
      .json(&body)
      .send()
      .await
      .map_err(CoreError::upstream)?;
    let response = self.check(response, "scroll").await?;
    let parsed: ScrollResponse = response
      .json()
      .await
      .map_err(|e| CoreError::Parse(e.to_string()))?;
    Ok((parsed.result.points, parsed.result.next_page_offset))
  }

  pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>, CoreError> {
    let response = self
      .request(reqwest::Method::GET, "/collections")
      .send()
      .await
      .map_err(CoreError::upstream)?;
    let response = self.check(response, "list collections").await?;
    let parsed: CollectionsResponse = response
      .json()
      .await
      .map_err(|e| CoreError::Parse(e.to_string()))?;

    let mut infos = Vec::with_capacity(parsed.result.collections.len());
    for collection in parsed.result.collections {
      let detail = self.collection_detail(&collection.name).await?;
      let (size, distance) = detail
        .config
        .as_ref()
        .map(|c| {
          (
            c.params.vectors.size,
            c.params
              .vectors
              .distance
              .clone()
              .unwrap_or_else(|| "Unknown".to_string()),
          )
        })
        .unwrap_or((0, "Unknown".to_string()));
      let points = detail.points_count.unwrap_or(0);
      infos.push(CollectionInfo {
        name: collection.name,
        documents_count: points,
        points_count: points,
        vector_size: size,
        distance,
        visibility: "public".to_string(),
        owner_id: None,
        is_owner: false,
      });
    }
    Ok(infos)
  }

  async fn collection_detail(&self, name: &str) -> Result<CollectionDetail, CoreError> {
    let response = self
      .request(reqwest::Method::GET, &format!("/collections/{name}"))
      .send()
      .await
      .map_err(CoreError::upstream)?;
    if !response.status().is_success() {
      return Ok(CollectionDetail::default());
    }
    response
      .json::<CollectionDetailResponse>()
      .await
      .map(|r| r.result)
      .map_err(|e| CoreError::Parse(e.to_string()))
  }

  /// Deletes `temp_{session}_{unix_ts}` collections whose timestamp suffix
  /// is older than the TTL. Returns the deleted names.
  pub async fn cleanup_expired_temp_collections(
    &self,
    ttl_minutes: i64,
  ) -> Result<Vec<String>, CoreError> {
    let collections = self.list_collections().await?;
    let cutoff = kst::unix_ts() - ttl_minutes * 60;
    let mut deleted = Vec::new();
    for info in collections {
      let Some(ts) = temp_collection_ts(&info.name) else {
        continue;
      };
      if ts < cutoff {
        match self.delete_collection(&info.name).await {
          Ok(()) => deleted.push(info.name),
          Err(e) => warn!("failed to delete expired temp collection '{}': {e}", info.name),
        }
      }
    }
    if !deleted.is_empty() {
      info!("cleaned up {} expired temp collections", deleted.len());
    }
    Ok(deleted)
  }
}

/// Parses the unix-timestamp suffix of a `temp_{session}_{unix_ts}` name.
pub fn temp_collection_ts(name: &str) -> Option<i64> {
  let rest = name.strip_prefix("temp_")?;
  let (_, ts) = rest.rsplit_once('_')?;
  ts.parse().ok()
}

/// `collection_name` must be non-empty `[A-Za-z0-9_-]+`.
pub fn validate_collection_name(name: &str) -> Result<(), CoreError> {
  if name.is_empty()
    || !name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
  {
    return Err(CoreError::Validation(format!(
      "invalid collection name: '{name}'"
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn temp_collection_ts_parsing() {
    assert_eq!(temp_collection_ts("temp_abc123_1735000000"), Some(1735000000));
    assert_eq!(temp_collection_ts("temp_a_b_1735000000"), Some(1735000000));
    assert_eq!(temp_collection_ts("documents"), None);
    assert_eq!(temp_collection_ts("temp_nounderscore"), None);
    assert_eq!(temp_collection_ts("temp_s_notanumber"), None);
  }

  #[test]
  fn collection_name_validation() {
    assert!(validate_collection_name("my_collection-1").is_ok());
    assert!(validate_collection_name("").is_err());
    assert!(validate_collection_name("한글이름").is_err());
    assert!(validate_collection_name("has space").is_err());
  }

  #[test]
  fn hit_id_accepts_numbers_and_strings() {
    let hit: Hit = serde_json::from_value(serde_json::json!({
      "id": 42, "score": 0.9, "payload": {"text": "t"}
    }))
    .unwrap();
    assert_eq!(hit.id, "42");
    let hit: Hit = serde_json::from_value(serde_json::json!({
      "id": "uuid-1", "score": 0.9, "payload": {}
    }))
    .unwrap();
    assert_eq!(hit.id, "uuid-1");
  }
}
