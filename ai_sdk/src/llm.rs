use std::collections::HashMap;
use std::time::Duration;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sse::{content_chunk, extract_content_from_sse, strip_thought_block, ThoughtStripper};
use crate::{AiError, Message, SamplingParams};

/// One OpenAI-compatible endpoint with its served model and default knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
  pub base_url: String,
  pub model: String,
  pub temperature: f32,
  pub top_p: f32,
  pub max_tokens: u32,
  /// Deep-reasoning family: responses open with a `<thought>` block that is
  /// stripped before anything reaches the client.
  #[serde(default)]
  pub deep_reasoning: bool,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
  model: &'a str,
  messages: Vec<WireMessage>,
  temperature: f32,
  max_tokens: u32,
  top_p: f32,
  frequency_penalty: f32,
  presence_penalty: f32,
  stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
  role: String,
  content: String,
}

impl From<&Message> for WireMessage {
  fn from(message: &Message) -> Self {
    Self {
      role: message.role.to_string(),
      content: message.content.clone(),
    }
  }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
  #[serde(default)]
  choices: Vec<Choice>,
  #[serde(default)]
  usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
  message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
  #[serde(default)]
  content: String,
  #[serde(default)]
  reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
  #[serde(default)]
  pub prompt_tokens: u64,
  #[serde(default)]
  pub completion_tokens: u64,
  #[serde(default)]
  pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
  pub content: String,
  pub reasoning_content: Option<String>,
  pub usage: Option<Usage>,
}

/// Chat-completion client over a registry of model endpoints.
///
/// The model *key* requested by the client resolves to an endpoint; unknown
/// keys fall back to the default endpoint.
pub struct LlmClient {
  client: Client,
  stream_client: Client,
  default: ModelEndpoint,
  overrides: HashMap<String, ModelEndpoint>,
}

impl LlmClient {
  pub fn new(
    default: ModelEndpoint,
    overrides: HashMap<String, ModelEndpoint>,
    timeout: Duration,
    stream_timeout: Duration,
  ) -> Result<Self, AiError> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| AiError::Upstream(format!("failed to build http client: {e}")))?;
    let stream_client = Client::builder()
      .timeout(stream_timeout)
      .build()
      .map_err(|e| AiError::Upstream(format!("failed to build http client: {e}")))?;
    Ok(Self {
      client,
      stream_client,
      default,
      overrides,
    })
  }

  pub fn resolve(&self, model_key: &str) -> &ModelEndpoint {
    self.overrides.get(model_key).unwrap_or(&self.default)
  }

  pub fn endpoints(&self) -> impl Iterator<Item = (&String, &ModelEndpoint)> {
    self.overrides.iter()
  }

  fn build_request<'a>(
    endpoint: &'a ModelEndpoint,
    messages: &[Message],
    params: &SamplingParams,
    stream: bool,
  ) -> CompletionRequest<'a> {
    CompletionRequest {
      model: &endpoint.model,
      messages: messages.iter().map(WireMessage::from).collect(),
      temperature: params.temperature,
      max_tokens: params.max_tokens,
      top_p: params.top_p,
      frequency_penalty: params.frequency_penalty,
      presence_penalty: params.presence_penalty,
      stream,
    }
  }

  /// Non-streaming chat completion with model-specific post-processing.
  pub async fn chat(
    &self,
    messages: &[Message],
    model_key: &str,
    params: &SamplingParams,
  ) -> Result<ChatCompletion, AiError> {
    let endpoint = self.resolve(model_key);
    let params = params.clone().clamped();
    let request = Self::build_request(endpoint, messages, &params, false);
    let url = format!("{}/v1/chat/completions", endpoint.base_url.trim_end_matches('/'));

    info!(model_key, model = %endpoint.model, url = %url, "llm completion");
    let response = self.client.post(&url).json(&request).send().await?;

    if !response.status().is_success() {
      let status = response.status().as_u16();
      let body = response.text().await.unwrap_or_default();
      return Err(AiError::Http { status, body });
    }

    let mut completion: CompletionResponse = response
      .json()
      .await
      .map_err(|e| AiError::Parse(e.to_string()))?;

    let choice = completion
      .choices
      .drain(..)
      .next()
      .ok_or_else(|| AiError::Parse("no choices in completion".to_string()))?;

    let content = if endpoint.deep_reasoning {
      strip_thought_block(&choice.message.content)
    } else {
      choice.message.content.trim().to_string()
    };

    if let Some(usage) = &completion.usage {
      debug!(total_tokens = usage.total_tokens, "completion finished");
    }

    Ok(ChatCompletion {
      content,
      reasoning_content: choice.message.reasoning_content,
      usage: completion.usage,
    })
  }

  /// Streaming chat completion.
  ///
  /// Yields SSE frames. For pass-through models every upstream `data:` line
  /// (including `[DONE]`) is forwarded; for the deep-reasoning family,
  /// content deltas are run through [`ThoughtStripper`] and re-framed, while
  /// non-content lines pass through untouched.
  pub fn chat_stream(
    &self,
    messages: &[Message],
    model_key: &str,
    params: &SamplingParams,
  ) -> impl Stream<Item = Result<String, AiError>> + Send + 'static {
    let endpoint = self.resolve(model_key).clone();
    let params = params.clone().clamped();
    let request_body = serde_json::to_value(Self::build_request(&endpoint, messages, &params, true));
    let client = self.stream_client.clone();
    let model_key = model_key.to_string();

    try_stream! {
      let body = request_body.map_err(|e| AiError::Parse(e.to_string()))?;
      let url = format!("{}/v1/chat/completions", endpoint.base_url.trim_end_matches('/'));
      info!(model_key = %model_key, model = %endpoint.model, url = %url, "llm stream");

      let response = client.post(&url).json(&body).send().await?;
      if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err::<(), AiError>(AiError::Http { status, body })?;
      } else {
        let mut stripper = endpoint.deep_reasoning.then(ThoughtStripper::new);
        let mut buffer = String::new();
        let mut byte_stream = response.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
          let chunk = chunk?;
          buffer.push_str(&String::from_utf8_lossy(&chunk));

          while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            let line = line.trim_end();
            if line.is_empty() {
              continue;
            }
            if let Some(frame) = process_line(line, &mut stripper) {
              yield frame;
            }
          }
        }

        // Trailing data without a final newline.
        let rest = buffer.trim();
        if !rest.is_empty() {
          if let Some(frame) = process_line(rest, &mut stripper) {
            yield frame;
          }
        }

        debug!("llm stream completed");
      }
    }
  }
}

fn process_line(line: &str, stripper: &mut Option<ThoughtStripper>) -> Option<String> {
  match stripper {
    None => {
      // Pass-through model: forward data lines as complete SSE frames.
      line.starts_with("data:").then(|| format!("{line}\n\n"))
    }
    Some(stripper) => match extract_content_from_sse(line) {
      Some(content) => stripper.push(&content).map(|cleaned| content_chunk(&cleaned)),
      // [DONE] and other non-delta data lines pass through.
      None => line.starts_with("data:").then(|| format!("{line}\n\n")),
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn endpoint(deep: bool) -> ModelEndpoint {
    ModelEndpoint {
      base_url: "http://localhost:8080".to_string(),
      model: "m".to_string(),
      temperature: 0.7,
      top_p: 0.9,
      max_tokens: 2000,
      deep_reasoning: deep,
    }
  }

  #[test]
  fn resolve_falls_back_to_default() {
    let mut overrides = HashMap::new();
    overrides.insert("special".to_string(), endpoint(true));
    let client = LlmClient::new(
      endpoint(false),
      overrides,
      Duration::from_secs(180),
      Duration::from_secs(300),
    )
    .unwrap();
    assert!(client.resolve("special").deep_reasoning);
    assert!(!client.resolve("unknown-key").deep_reasoning);
  }

  #[test]
  fn passthrough_forwards_data_lines_only() {
    let mut stripper = None;
    assert_eq!(
      process_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#, &mut stripper),
      Some("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n".to_string())
    );
    assert_eq!(
      process_line("data: [DONE]", &mut stripper),
      Some("data: [DONE]\n\n".to_string())
    );
    assert_eq!(process_line(": comment", &mut stripper), None);
  }

  #[test]
  fn deep_reasoning_stream_emits_only_post_thought_content() {
    // Scenario: "<thought>solve", " in english</thought>안녕", "하세요."
    let mut stripper = Some(ThoughtStripper::new());
    let lines = [
      r#"data: {"choices":[{"delta":{"content":"<thought>solve"}}]}"#,
      r#"data: {"choices":[{"delta":{"content":" in english</thought>안녕"}}]}"#,
      r#"data: {"choices":[{"delta":{"content":"하세요."}}]}"#,
      "data: [DONE]",
    ];
    let emitted: Vec<String> = lines
      .iter()
      .filter_map(|l| process_line(l, &mut stripper))
      .collect();
    assert_eq!(emitted.len(), 3);
    assert_eq!(extract_content_from_sse(emitted[0].trim_end()).as_deref(), Some("안녕"));
    assert_eq!(
      extract_content_from_sse(emitted[1].trim_end()).as_deref(),
      Some("하세요.")
    );
    assert_eq!(emitted[2], "data: [DONE]\n\n");
  }
}
