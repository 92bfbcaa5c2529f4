//! Wire types for the chat and analytics endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use docchat_core::models::ReasoningLevel;
use docchat_core::{ChatMessage, RetrievedDoc, Usage};

fn default_model() -> String {
  "gpt-oss-20b".to_string()
}
fn default_temperature() -> f32 {
  0.7
}
fn default_max_tokens() -> u32 {
  2000
}
fn default_top_p() -> f32 {
  0.9
}
fn default_top_k() -> usize {
  5
}
fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
  #[serde(default)]
  pub conversation_id: Option<String>,
  #[serde(default)]
  pub collection_name: Option<String>,
  #[serde(default)]
  pub temp_collection_name: Option<String>,
  pub message: String,
  #[serde(default = "default_model")]
  pub model: String,
  #[serde(default)]
  pub reasoning_level: ReasoningLevel,
  #[serde(default = "default_temperature")]
  pub temperature: f32,
  #[serde(default = "default_max_tokens")]
  pub max_tokens: u32,
  #[serde(default = "default_top_p")]
  pub top_p: f32,
  #[serde(default)]
  pub frequency_penalty: f32,
  #[serde(default)]
  pub presence_penalty: f32,
  #[serde(default = "default_top_k")]
  pub top_k: usize,
  #[serde(default)]
  pub score_threshold: Option<f32>,
  #[serde(default)]
  pub chat_history: Option<Vec<ChatMessage>>,
  #[serde(default)]
  pub use_reranking: bool,
  #[serde(default = "default_true")]
  pub use_hybrid: bool,
}

/// Flattened document view returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
  pub id: String,
  pub score: f32,
  pub text: String,
  #[serde(default)]
  pub metadata: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub keywords: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cited_phrases: Option<Vec<String>>,
}

impl From<&RetrievedDoc> for RetrievedDocument {
  fn from(doc: &RetrievedDoc) -> Self {
    let metadata = match &doc.payload {
      Value::Object(map) => {
        let mut rest = map.clone();
        rest.remove("text");
        Value::Object(rest)
      }
      _ => Value::Object(Default::default()),
    };
    Self {
      id: doc.id.clone(),
      score: doc.score,
      text: doc.text().to_string(),
      metadata,
      keywords: doc.keywords.clone(),
      cited_phrases: doc.cited_phrases.clone(),
    }
  }
}

impl RetrievedDocument {
  /// Rebuilds the internal document shape: text back into the payload,
  /// metadata merged alongside.
  pub fn into_internal(self) -> RetrievedDoc {
    let mut payload = serde_json::Map::new();
    payload.insert("text".to_string(), Value::String(self.text));
    if let Value::Object(map) = self.metadata {
      for (key, value) in map {
        payload.insert(key, value);
      }
    }
    RetrievedDoc::new(self.id, self.score, Value::Object(payload))
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub conversation_id: Option<String>,
  pub answer: String,
  pub retrieved_docs: Vec<RetrievedDocument>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub usage: Option<Usage>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegenerateRequest {
  pub query: String,
  #[serde(default)]
  pub collection_name: Option<String>,
  #[serde(default)]
  pub conversation_id: Option<String>,
  #[serde(default)]
  pub retrieved_docs: Vec<RetrievedDocument>,
  #[serde(default = "default_model")]
  pub model: String,
  #[serde(default)]
  pub reasoning_level: ReasoningLevel,
  #[serde(default = "default_temperature")]
  pub temperature: f32,
  #[serde(default = "default_max_tokens")]
  pub max_tokens: u32,
  #[serde(default = "default_top_p")]
  pub top_p: f32,
  #[serde(default)]
  pub frequency_penalty: f32,
  #[serde(default)]
  pub presence_penalty: f32,
  #[serde(default)]
  pub chat_history: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefaultSettingsResponse {
  pub model: String,
  pub reasoning_level: String,
  pub temperature: f32,
  pub max_tokens: u32,
  pub top_p: f32,
  pub top_k: usize,
  pub use_reranking: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn chat_request_defaults_apply() {
    let request: ChatRequest = serde_json::from_value(json!({
      "message": "환불 규정 알려줘"
    }))
    .unwrap();
    assert_eq!(request.model, "gpt-oss-20b");
    assert_eq!(request.top_k, 5);
    assert_eq!(request.temperature, 0.7);
    assert!(request.use_hybrid);
    assert!(!request.use_reranking);
    assert_eq!(request.reasoning_level, ReasoningLevel::Medium);
  }

  #[test]
  fn retrieved_document_roundtrips_to_internal() {
    let doc = RetrievedDoc::new(
      "d1",
      0.7,
      json!({"text": "본문", "filename": "a.pdf", "page_number": 3}),
    );
    let dto = RetrievedDocument::from(&doc);
    assert_eq!(dto.text, "본문");
    assert_eq!(dto.metadata["filename"], "a.pdf");

    let back = dto.into_internal();
    assert_eq!(back.text(), "본문");
    assert_eq!(back.payload["page_number"], 3);
    assert_eq!(back.score, 0.7);
  }
}
