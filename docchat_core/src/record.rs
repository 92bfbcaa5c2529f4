//! Interaction-log line shapes.
//!
//! One `InteractionRecord` per JSONL line; user and assistant turns of the
//! same exchange share a `session_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::kst;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
  User,
  Assistant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalInfo {
  #[serde(default)]
  pub retrieved_count: usize,
  #[serde(default)]
  pub top_scores: Vec<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retrieval_time_ms: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reranking_used: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Performance {
  #[serde(default)]
  pub response_time_ms: i64,
  #[serde(default)]
  pub token_count: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retrieval_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
  pub error_type: String,
  pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
  pub log_id: String,
  pub session_id: String,
  pub collection_name: String,
  pub message_type: MessageType,
  pub message_content: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reasoning_level: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub llm_model: Option<String>,
  #[serde(default)]
  pub llm_params: Value,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retrieval_info: Option<RetrievalInfo>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub performance: Option<Performance>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_info: Option<ErrorInfo>,
  /// Naive KST or KST ISO-8601; the aggregator normalizes both.
  pub created_at: String,
}

impl InteractionRecord {
  pub fn new(
    session_id: impl Into<String>,
    collection_name: impl Into<String>,
    message_type: MessageType,
    message_content: impl Into<String>,
  ) -> Self {
    Self {
      log_id: Uuid::new_v4().to_string(),
      session_id: session_id.into(),
      collection_name: collection_name.into(),
      message_type,
      message_content: message_content.into(),
      reasoning_level: None,
      llm_model: None,
      llm_params: Value::Null,
      retrieval_info: None,
      performance: None,
      error_info: None,
      created_at: kst::now_iso(),
    }
  }
}

/// One per-turn diff applied to the `chat_sessions` row by the session
/// batcher. Each diff represents exactly one user + assistant pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdate {
  pub session_id: String,
  pub collection_name: String,
  pub model: String,
  pub reasoning_level: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub response_time_ms: Option<i64>,
  #[serde(default)]
  pub top_scores: Vec<f32>,
  #[serde(default)]
  pub has_error: bool,
  pub queued_at: String,
}

impl SessionUpdate {
  pub fn new(
    session_id: impl Into<String>,
    collection_name: impl Into<String>,
    model: impl Into<String>,
    reasoning_level: impl Into<String>,
  ) -> Self {
    Self {
      session_id: session_id.into(),
      collection_name: collection_name.into(),
      model: model.into(),
      reasoning_level: reasoning_level.into(),
      response_time_ms: None,
      top_scores: Vec::new(),
      has_error: false,
      queued_at: kst::now_iso(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_serializes_korean_unescaped() {
    let mut record =
      InteractionRecord::new("s1", "policies", MessageType::User, "환불 규정이 뭔가요?");
    record.reasoning_level = Some("medium".to_string());
    let line = serde_json::to_string(&record).unwrap();
    assert!(line.contains("환불 규정이 뭔가요?"));
    assert!(line.contains("\"message_type\":\"user\""));
    assert!(!line.contains("\\u"));
  }

  #[test]
  fn record_roundtrip() {
    let mut record = InteractionRecord::new("s1", "policies", MessageType::Assistant, "답변");
    record.retrieval_info = Some(RetrievalInfo {
      retrieved_count: 3,
      top_scores: vec![0.82, 0.71],
      retrieval_time_ms: Some(120),
      reranking_used: Some(true),
    });
    record.performance = Some(Performance {
      response_time_ms: 1200,
      token_count: 256,
      retrieval_time_ms: Some(120),
    });
    let line = serde_json::to_string(&record).unwrap();
    let back: InteractionRecord = serde_json::from_str(&line).unwrap();
    assert_eq!(back.retrieval_info.unwrap().top_scores, vec![0.82, 0.71]);
    assert_eq!(back.performance.unwrap().response_time_ms, 1200);
  }
}
