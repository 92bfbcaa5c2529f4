//! Per-conversation turn log with sampling policy and compressed archival.

use std::path::PathBuf;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use docchat_core::{kst, logpath, ErrorInfo, RetrievedDoc};

use crate::retention;

const LONG_CONVERSATION_TURNS: usize = 5;
const LOW_SCORE_THRESHOLD: f32 = 0.5;
const ERROR_SCORE_THRESHOLD: f32 = 0.3;
const SUMMARY_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
  pub role: String,
  pub content: String,
  pub timestamp: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retrieved_docs: Option<Vec<RetrievedDoc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_info: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
  pub conversation_id: String,
  pub collection_name: String,
  pub messages: Vec<ConversationMessage>,
  #[serde(default)]
  pub metadata: Value,
  #[serde(default)]
  pub has_error: bool,
  #[serde(default)]
  pub has_regeneration: bool,
  #[serde(default)]
  pub turn_count: usize,
  #[serde(default = "default_min_score")]
  pub min_score: f32,
  pub started_at: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ended_at: Option<String>,
}

fn default_min_score() -> f32 {
  1.0
}

impl Conversation {
  fn new(conversation_id: String, collection_name: String) -> Self {
    Self {
      conversation_id,
      collection_name,
      messages: Vec::new(),
      metadata: Value::Null,
      has_error: false,
      has_regeneration: false,
      turn_count: 0,
      min_score: 1.0,
      started_at: kst::now_iso(),
      ended_at: None,
    }
  }

  fn add_message(
    &mut self,
    role: &str,
    content: &str,
    retrieved_docs: Option<Vec<RetrievedDoc>>,
    error_info: Option<ErrorInfo>,
  ) {
    if let Some(docs) = &retrieved_docs {
      for doc in docs {
        self.min_score = self.min_score.min(doc.score);
      }
    }
    if error_info.is_some() {
      self.has_error = true;
    }
    if role == "user" {
      self.turn_count += 1;
    }
    self.messages.push(ConversationMessage {
      role: role.to_string(),
      content: content.to_string(),
      timestamp: kst::now_iso(),
      retrieved_docs,
      error_info,
    });
  }

  fn finalize(&mut self) {
    let ended = kst::now_iso();
    let duration_seconds = match (
      kst::parse_created_at(&self.started_at),
      kst::parse_created_at(&ended),
    ) {
      (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
      _ => 0.0,
    };
    self.ended_at = Some(ended);
    self.metadata = serde_json::json!({
      "total_turns": self.turn_count,
      "has_error": self.has_error,
      "has_regeneration": self.has_regeneration,
      "min_retrieval_score": if self.min_score < 1.0 { Some(self.min_score) } else { None },
      "duration_seconds": duration_seconds,
    });
  }

  /// high: error, very low score, regeneration or a long conversation;
  /// medium: ≥3 turns or a low score; low otherwise.
  fn retention_priority(&self) -> &'static str {
    if self.has_error
      || self.min_score < ERROR_SCORE_THRESHOLD
      || self.has_regeneration
      || self.turn_count >= LONG_CONVERSATION_TURNS
    {
      "high"
    } else if self.turn_count >= 3 || self.min_score < LOW_SCORE_THRESHOLD {
      "medium"
    } else {
      "low"
    }
  }

  /// First user message truncated to 100 chars.
  fn summary(&self) -> Option<String> {
    self
      .messages
      .iter()
      .find(|m| m.role == "user")
      .map(|m| {
        let chars: Vec<char> = m.content.chars().collect();
        if chars.len() > SUMMARY_MAX_CHARS {
          format!("{}...", chars[..SUMMARY_MAX_CHARS].iter().collect::<String>())
        } else {
          m.content.clone()
        }
      })
  }
}

pub struct ConversationStore {
  conv_dir: PathBuf,
  active: DashMap<String, Conversation>,
  sample_rate: f64,
  retention_days: i64,
  compress_after_days: i64,
}

impl ConversationStore {
  pub fn new(
    conv_dir: impl Into<PathBuf>,
    sample_rate: f64,
    retention_days: i64,
    compress_after_days: i64,
  ) -> Self {
    let conv_dir = conv_dir.into();
    std::fs::create_dir_all(&conv_dir).ok();
    info!(
      "conversation store: sample_rate={:.0}%, retention={retention_days}d, compress after {compress_after_days}d",
      sample_rate * 100.0
    );
    Self {
      conv_dir,
      active: DashMap::new(),
      sample_rate,
      retention_days,
      compress_after_days,
    }
  }

  /// Registers a conversation if it is not already active; returns its id.
  pub fn start_conversation(
    &self,
    conversation_id: Option<String>,
    collection_name: &str,
  ) -> String {
    let conversation_id = conversation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    self
      .active
      .entry(conversation_id.clone())
      .or_insert_with(|| {
        debug!("new conversation: {conversation_id}");
        Conversation::new(conversation_id.clone(), collection_name.to_string())
      });
    conversation_id
  }

  pub fn add_message(
    &self,
    conversation_id: &str,
    role: &str,
    content: &str,
    retrieved_docs: Option<Vec<RetrievedDoc>>,
    error_info: Option<ErrorInfo>,
  ) {
    match self.active.get_mut(conversation_id) {
      Some(mut conversation) => {
        conversation.add_message(role, content, retrieved_docs, error_info);
      }
      None => warn!("unknown conversation: {conversation_id}"),
    }
  }

  pub fn set_regeneration(&self, conversation_id: &str) {
    if let Some(mut conversation) = self.active.get_mut(conversation_id) {
      conversation.has_regeneration = true;
    }
  }

  pub fn active_count(&self) -> usize {
    self.active.len()
  }

  /// Finalizes and, if the sampling policy selects it, persists the
  /// conversation. Returns whether it was persisted.
  pub async fn end_conversation(&self, conversation_id: &str) -> bool {
    let Some((_, mut conversation)) = self.active.remove(conversation_id) else {
      warn!("attempted to end unknown conversation: {conversation_id}");
      return false;
    };
    conversation.finalize();

    if !self.should_save(&conversation) {
      debug!("conversation sampled out: {conversation_id}");
      return false;
    }
    self.save(&conversation).await;
    info!("conversation saved: {conversation_id}");
    true
  }

  /// Always persists error / regeneration / long / low-score conversations,
  /// otherwise samples at the configured rate.
  fn should_save(&self, conversation: &Conversation) -> bool {
    if conversation.has_error
      || conversation.has_regeneration
      || conversation.turn_count >= LONG_CONVERSATION_TURNS
      || conversation.min_score < LOW_SCORE_THRESHOLD
    {
      return true;
    }
    rand::random::<f64>() < self.sample_rate
  }

  async fn save(&self, conversation: &Conversation) {
    let today = kst::today();
    let result = async {
      let dir = logpath::ensure_date_directory(&self.conv_dir, today)?;
      let path = dir.join(format!("{}.jsonl", kst::format_date(today)));

      let mut line = serde_json::to_value(conversation).map_err(std::io::Error::other)?;
      line["is_sampled"] = Value::Bool(true);
      line["retention_priority"] = Value::String(conversation.retention_priority().to_string());
      line["summary"] = conversation
        .summary()
        .map(Value::String)
        .unwrap_or(Value::Null);

      let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .await?;
      file
        .write_all(format!("{line}\n").as_bytes())
        .await?;
      Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
      error!("failed to save conversation: {e}");
    }
  }

  /// Reads persisted conversations in a date range, plain or gzipped.
  pub fn read_conversations(
    &self,
    start_date: Option<chrono::NaiveDate>,
    end_date: Option<chrono::NaiveDate>,
    collection_name: Option<&str>,
    limit: Option<usize>,
  ) -> Vec<Value> {
    let mut conversations = Vec::new();
    for path in logpath::iter_all_files(&self.conv_dir) {
      let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      let Some(file_date) = logpath::parse_date_from_filename(name) else {
        continue;
      };
      if start_date.is_some_and(|d| file_date < d) || end_date.is_some_and(|d| file_date > d) {
        continue;
      }

      let Ok(lines) = retention::read_lines(&path) else {
        continue;
      };
      for line in lines {
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
          continue;
        };
        if let Some(filter) = collection_name {
          if value.get("collection_name").and_then(Value::as_str) != Some(filter) {
            continue;
          }
        }
        conversations.push(value);
        if limit.is_some_and(|l| conversations.len() >= l) {
          return conversations;
        }
      }
    }
    conversations
  }

  /// Retention hook for the scheduler: gzip old files, then delete expired
  /// ones. Returns the number of deleted files.
  pub fn cleanup(&self) -> usize {
    let compressed = retention::compress_older_than(&self.conv_dir, self.compress_after_days);
    if compressed > 0 {
      info!("compressed {compressed} conversation files");
    }
    let deleted = retention::delete_older_than(&self.conv_dir, self.retention_days);
    info!("conversation cleanup: {deleted} files deleted");
    deleted
  }

}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::tempdir;

  fn doc(score: f32) -> RetrievedDoc {
    RetrievedDoc::new("d", score, json!({"text": "t"}))
  }

  fn store(dir: &std::path::Path, sample_rate: f64) -> ConversationStore {
    ConversationStore::new(dir, sample_rate, 30, 7)
  }

  #[tokio::test]
  async fn error_conversations_always_persist() {
    let tmp = tempdir().unwrap();
    let store = store(tmp.path(), 0.0);
    let id = store.start_conversation(None, "policies");
    store.add_message(&id, "user", "질문", None, None);
    store.add_message(
      &id,
      "assistant",
      "",
      None,
      Some(ErrorInfo {
        error_type: "UpstreamUnavailable".to_string(),
        error_message: "timeout".to_string(),
      }),
    );
    assert!(store.end_conversation(&id).await);

    let saved = store.read_conversations(None, None, None, None);
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0]["retention_priority"], "high");
    assert_eq!(saved[0]["is_sampled"], true);
  }

  #[tokio::test]
  async fn short_clean_conversations_sample_out_at_zero_rate() {
    let tmp = tempdir().unwrap();
    let store = store(tmp.path(), 0.0);
    let id = store.start_conversation(None, "policies");
    store.add_message(&id, "user", "질문", None, None);
    store.add_message(&id, "assistant", "답변", Some(vec![doc(0.9)]), None);
    assert!(!store.end_conversation(&id).await);
    assert!(store.read_conversations(None, None, None, None).is_empty());
  }

  #[tokio::test]
  async fn low_score_forces_persistence_with_priority() {
    let tmp = tempdir().unwrap();
    let store = store(tmp.path(), 0.0);
    let id = store.start_conversation(None, "policies");
    store.add_message(&id, "user", "질문", None, None);
    store.add_message(&id, "assistant", "답변", Some(vec![doc(0.2)]), None);
    assert!(store.end_conversation(&id).await);
    let saved = store.read_conversations(None, None, None, None);
    // min_score 0.2 < 0.3 → high priority.
    assert_eq!(saved[0]["retention_priority"], "high");
    assert_eq!(saved[0]["metadata"]["min_retrieval_score"], 0.2f32 as f64);
  }

  #[tokio::test]
  async fn summary_truncates_first_user_message() {
    let tmp = tempdir().unwrap();
    let store = store(tmp.path(), 1.0);
    let id = store.start_conversation(Some("c1".to_string()), "policies");
    let long = "가".repeat(150);
    store.add_message(&id, "user", &long, None, None);
    store.end_conversation(&id).await;
    let saved = store.read_conversations(None, None, None, None);
    let summary = saved[0]["summary"].as_str().unwrap();
    assert_eq!(summary.chars().count(), 103);
    assert!(summary.ends_with("..."));
  }

  #[tokio::test]
  async fn regeneration_marks_and_persists() {
    let tmp = tempdir().unwrap();
    let store = store(tmp.path(), 0.0);
    let id = store.start_conversation(None, "policies");
    store.add_message(&id, "user", "질문", None, None);
    store.set_regeneration(&id);
    assert!(store.end_conversation(&id).await);
    let saved = store.read_conversations(None, None, None, None);
    assert_eq!(saved[0]["has_regeneration"], true);
    assert_eq!(saved[0]["retention_priority"], "high");
  }

  #[tokio::test]
  async fn ending_unknown_conversation_is_false() {
    let tmp = tempdir().unwrap();
    let store = store(tmp.path(), 1.0);
    assert!(!store.end_conversation("missing").await);
  }
}
