mod embedding;
mod llm;
mod reranker;
mod sse;

pub use embedding::EmbeddingClient;
pub use llm::{ChatCompletion, LlmClient, ModelEndpoint, Usage as LlmUsage};
pub use reranker::{RerankResult, RerankerClient};
pub use sse::{content_chunk, extract_content_from_sse, ThoughtStripper};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AiError {
  #[error("upstream request failed: {0}")]
  Upstream(String),

  #[error("upstream returned {status}: {body}")]
  Http { status: u16, body: String },

  #[error("embedding shape mismatch: expected dim {expected}, got {actual}")]
  ShapeMismatch { expected: usize, actual: usize },

  #[error("failed to parse upstream response: {0}")]
  Parse(String),
}

impl From<reqwest::Error> for AiError {
  fn from(err: reqwest::Error) -> Self {
    Self::Upstream(err.to_string())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  User,
  Assistant,
  System,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Role::User => write!(f, "user"),
      Role::Assistant => write!(f, "assistant"),
      Role::System => write!(f, "system"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Message {
  pub role: Role,
  pub content: String,
}

impl Message {
  pub fn new(role: Role, content: impl Into<String>) -> Self {
    Self {
      role,
      content: content.into(),
    }
  }

  pub fn user(content: impl Into<String>) -> Self {
    Self::new(Role::User, content)
  }

  pub fn assistant(content: impl Into<String>) -> Self {
    Self::new(Role::Assistant, content)
  }

  pub fn system(content: impl Into<String>) -> Self {
    Self::new(Role::System, content)
  }

  /// Raw role/content pair, for history entries arriving from the client.
  pub fn raw(role: &str, content: impl Into<String>) -> Self {
    let role = match role {
      "assistant" => Role::Assistant,
      "system" => Role::System,
      _ => Role::User,
    };
    Self::new(role, content)
  }
}

/// Sampling parameters forwarded to `/v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
  pub temperature: f32,
  pub top_p: f32,
  pub max_tokens: u32,
  pub frequency_penalty: f32,
  pub presence_penalty: f32,
}

impl Default for SamplingParams {
  fn default() -> Self {
    Self {
      temperature: 0.7,
      top_p: 0.9,
      max_tokens: 2000,
      frequency_penalty: 0.0,
      presence_penalty: 0.0,
    }
  }
}

impl SamplingParams {
  /// Clamps every knob into its API-legal range.
  pub fn clamped(mut self) -> Self {
    self.temperature = self.temperature.clamp(0.0, 2.0);
    self.top_p = self.top_p.clamp(0.0, 1.0);
    self.frequency_penalty = self.frequency_penalty.clamp(-2.0, 2.0);
    self.presence_penalty = self.presence_penalty.clamp(-2.0, 2.0);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_constructors() {
    let m = Message::user("hello");
    assert_eq!(m.role.to_string(), "user");
    let m = Message::raw("assistant", "hi");
    assert_eq!(m.role, Role::Assistant);
    let m = Message::raw("weird", "hi");
    assert_eq!(m.role, Role::User);
  }

  #[test]
  fn sampling_params_clamp() {
    let p = SamplingParams {
      temperature: 9.0,
      top_p: -1.0,
      max_tokens: 100,
      frequency_penalty: 5.0,
      presence_penalty: -5.0,
    }
    .clamped();
    assert_eq!(p.temperature, 2.0);
    assert_eq!(p.top_p, 0.0);
    assert_eq!(p.frequency_penalty, 2.0);
    assert_eq!(p.presence_penalty, -2.0);
  }
}
