use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reasoning depth requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
  Low,
  #[default]
  Medium,
  High,
}

impl ReasoningLevel {
  pub fn parse(s: &str) -> Self {
    match s.to_lowercase().as_str() {
      "low" => Self::Low,
      "high" => Self::High,
      _ => Self::Medium,
    }
  }

  pub const fn as_str(&self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Medium => "medium",
      Self::High => "high",
    }
  }
}

impl fmt::Display for ReasoningLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Model families with divergent prompting and post-processing behavior.
///
/// The dispatch lives here and nowhere else: `GptOss` takes the literal
/// `Reasoning: <level>` instruction, `Exaone` is the deep-reasoning family
/// (no system prompt, emits a `<thought>` block that must be stripped),
/// everything else is `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
  GptOss,
  Exaone,
  Generic,
}

impl ModelFamily {
  pub fn of_key(model_key: &str) -> Self {
    let key = model_key.to_lowercase();
    if key.contains("gpt-oss") {
      Self::GptOss
    } else if key.contains("exaone") {
      Self::Exaone
    } else {
      Self::Generic
    }
  }

  /// Whether responses carry a `<thought>` prelude that must be removed.
  pub const fn strips_thought(&self) -> bool {
    matches!(self, Self::Exaone)
  }

  /// Whether the family rejects system prompts (instructions go into the
  /// user message instead).
  pub const fn user_prompt_only(&self) -> bool {
    matches!(self, Self::Exaone)
  }
}

/// One turn of chat history as received from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
  pub role: String,
  pub content: String,
}

/// Token accounting reported by the LLM endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
  #[serde(default)]
  pub prompt_tokens: u64,
  #[serde(default)]
  pub completion_tokens: u64,
  #[serde(default)]
  pub total_tokens: u64,
}

/// A document returned by retrieval. `score` is the primary score for the
/// *current* pipeline stage (vector similarity, RRF, or rerank score) and is
/// overwritten as the document moves through the stages; `vector_score` and
/// `bm25_score` are diagnostics frozen at fusion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDoc {
  pub id: String,
  pub score: f32,
  #[serde(default)]
  pub payload: Value,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_collection: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub vector_score: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bm25_score: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub keywords: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cited_phrases: Option<Vec<String>>,
}

impl RetrievedDoc {
  pub fn new(id: impl Into<String>, score: f32, payload: Value) -> Self {
    Self {
      id: id.into(),
      score,
      payload,
      source_collection: None,
      vector_score: None,
      bm25_score: None,
      keywords: None,
      cited_phrases: None,
    }
  }

  /// The chunk body, empty when the payload carries no `text` field.
  pub fn text(&self) -> &str {
    self.payload.get("text").and_then(Value::as_str).unwrap_or("")
  }

  pub fn filename(&self) -> Option<&str> {
    self.payload.get("filename").and_then(Value::as_str)
  }

  /// Ordered headings; index 0 is usually the source file, index 1 a
  /// page/section label.
  pub fn headings(&self) -> Vec<String> {
    self
      .payload
      .get("headings")
      .and_then(Value::as_array)
      .map(|a| {
        a.iter()
          .filter_map(|v| v.as_str().map(str::to_string))
          .collect()
      })
      .unwrap_or_default()
  }

  /// Document name for logging: filename > document_name > source > Unknown.
  pub fn document_name(&self) -> String {
    for key in ["filename", "document_name", "source"] {
      if let Some(name) = self.payload.get(key).and_then(Value::as_str) {
        if !name.is_empty() {
          return name.to_string();
        }
      }
    }
    "Unknown".to_string()
  }

  /// Page number: `headings[1]` as "페이지 N" or a number, else the
  /// `page_number` / `page` payload fields, else 0.
  pub fn page_number(&self) -> i64 {
    if let Some(headings) = self.payload.get("headings").and_then(Value::as_array) {
      if let Some(second) = headings.get(1) {
        if let Some(s) = second.as_str() {
          if s.contains("페이지") {
            if let Ok(n) = s.replace("페이지", "").trim().parse::<i64>() {
              return n;
            }
          }
        } else if let Some(n) = second.as_i64() {
          return n;
        }
      }
    }
    for key in ["page_number", "page"] {
      if let Some(n) = self.payload.get(key).and_then(Value::as_i64) {
        return n;
      }
    }
    0
  }
}

/// Frontend-facing view of a retrieved document: the text is lifted out of
/// the payload, everything else becomes `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceData {
  pub id: String,
  pub score: f32,
  pub text: String,
  pub metadata: Value,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub keywords: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cited_phrases: Option<Vec<String>>,
}

impl From<&RetrievedDoc> for SourceData {
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

pub fn convert_docs_to_sources(docs: &[RetrievedDoc]) -> Vec<SourceData> {
  docs.iter().map(SourceData::from).collect()
}

/// Collection listing entry served by `GET /api/chat/collections`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
  pub name: String,
  pub documents_count: u64,
  pub points_count: u64,
  pub vector_size: u64,
  pub distance: String,
  #[serde(default = "default_visibility")]
  pub visibility: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub owner_id: Option<String>,
  #[serde(default)]
  pub is_owner: bool,
}

fn default_visibility() -> String {
  "public".to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn model_family_dispatch() {
    assert_eq!(ModelFamily::of_key("gpt-oss-20b"), ModelFamily::GptOss);
    assert_eq!(ModelFamily::of_key("exaone-deep-7.8b"), ModelFamily::Exaone);
    assert_eq!(ModelFamily::of_key("EXAONE-4.0-32B"), ModelFamily::Exaone);
    assert_eq!(ModelFamily::of_key("llama-3"), ModelFamily::Generic);
    assert!(ModelFamily::Exaone.strips_thought());
    assert!(!ModelFamily::GptOss.user_prompt_only());
  }

  #[test]
  fn reasoning_level_parse() {
    assert_eq!(ReasoningLevel::parse("low"), ReasoningLevel::Low);
    assert_eq!(ReasoningLevel::parse("HIGH"), ReasoningLevel::High);
    assert_eq!(ReasoningLevel::parse("unknown"), ReasoningLevel::Medium);
    assert_eq!(format!("{}", ReasoningLevel::High), "high");
  }

  #[test]
  fn doc_text_and_headings() {
    let doc = RetrievedDoc::new(
      "d1",
      0.8,
      json!({"text": "본문", "filename": "a.pdf", "headings": ["a.pdf", "페이지 3"]}),
    );
    assert_eq!(doc.text(), "본문");
    assert_eq!(doc.filename(), Some("a.pdf"));
    assert_eq!(doc.headings(), vec!["a.pdf", "페이지 3"]);
    assert_eq!(doc.page_number(), 3);
    assert_eq!(doc.document_name(), "a.pdf");
  }

  #[test]
  fn doc_without_payload_fields() {
    let doc = RetrievedDoc::new("d2", 0.1, json!({}));
    assert_eq!(doc.text(), "");
    assert_eq!(doc.page_number(), 0);
    assert_eq!(doc.document_name(), "Unknown");
  }

  #[test]
  fn source_data_splits_text_from_metadata() {
    let doc = RetrievedDoc::new("d3", 0.5, json!({"text": "body", "filename": "f.pdf"}));
    let source = SourceData::from(&doc);
    assert_eq!(source.text, "body");
    assert_eq!(source.metadata["filename"], "f.pdf");
    assert!(source.metadata.get("text").is_none());
  }
}
