//! Chat endpoints: non-streaming, SSE streaming, regenerate, collections.
//!
//! Logging never blocks the response path: after responding (or failing),
//! the interaction records and the session diff are enqueued from a spawned
//! task using the pipeline's non-blocking `log`/`queue_session_update`.

use std::convert::Infallible;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use ai_sdk::SamplingParams;
use docchat_core::record::{ErrorInfo, MessageType, Performance, RetrievalInfo};
use docchat_core::{CoreError, InteractionRecord, RetrievedDoc, SessionUpdate};

use crate::dtos::{ChatRequest, ChatResponse, DefaultSettingsResponse, RegenerateRequest, RetrievedDocument};
use crate::error::{safe_error_message, AppError};
use crate::services::rag::{ChatParams, StreamSummary};
use crate::AppState;

fn chat_params(state: &AppState, request: &ChatRequest) -> ChatParams {
  ChatParams {
    collection_name: request.collection_name.clone(),
    temp_collection_name: request.temp_collection_name.clone(),
    query: request.message.clone(),
    model_key: request.model.clone(),
    reasoning_level: request.reasoning_level,
    sampling: SamplingParams {
      temperature: request.temperature,
      top_p: request.top_p,
      max_tokens: request.max_tokens,
      frequency_penalty: request.frequency_penalty,
      presence_penalty: request.presence_penalty,
    },
    top_k: request.top_k,
    score_threshold: request
      .score_threshold
      .or(state.config.rag.default_score_threshold),
    chat_history: request.chat_history.clone().unwrap_or_default(),
    use_reranking: request.use_reranking,
    use_hybrid: request.use_hybrid,
  }
}

fn llm_params_json(request: &ChatRequest) -> serde_json::Value {
  json!({
    "temperature": request.temperature,
    "max_tokens": request.max_tokens,
    "top_p": request.top_p,
  })
}

/// Maps an orchestrator error onto an HTTP error, hiding details outside
/// debug mode while keeping the status class.
fn to_http_error(error: CoreError, context: &'static str, debug: bool) -> AppError {
  let app: AppError = error.into();
  match app {
    AppError::NotFound(_) | AppError::InvalidInput(_) | AppError::Conflict(_) => app,
    other => {
      let message = safe_error_message(&other, context, debug);
      AppError::AnyError(anyhow::anyhow!(message))
    }
  }
}

#[allow(clippy::too_many_arguments)]
async fn log_chat_interaction(
  state: AppState,
  session_id: String,
  conversation_id: String,
  collection_name: String,
  message: String,
  answer: String,
  retrieved_docs: Vec<RetrievedDoc>,
  reasoning_level: String,
  model: String,
  llm_params: serde_json::Value,
  response_time_ms: i64,
  token_count: i64,
  error_info: Option<ErrorInfo>,
) {
  let performance = Performance {
    response_time_ms,
    token_count,
    retrieval_time_ms: None,
  };

  let mut user_record = InteractionRecord::new(
    &session_id,
    &collection_name,
    MessageType::User,
    &message,
  );
  user_record.reasoning_level = Some(reasoning_level.clone());
  user_record.llm_model = Some(model.clone());
  user_record.llm_params = llm_params.clone();
  user_record.performance = Some(performance.clone());
  user_record.error_info = error_info.clone();
  state.logging.log(user_record).await;

  let top_scores: Vec<f32> = retrieved_docs.iter().take(3).map(|d| d.score).collect();
  let mut assistant_record = InteractionRecord::new(
    &session_id,
    &collection_name,
    MessageType::Assistant,
    &answer,
  );
  assistant_record.reasoning_level = Some(reasoning_level.clone());
  assistant_record.llm_model = Some(model.clone());
  assistant_record.llm_params = llm_params;
  assistant_record.retrieval_info = Some(RetrievalInfo {
    retrieved_count: retrieved_docs.len(),
    top_scores: top_scores.clone(),
    retrieval_time_ms: None,
    reranking_used: None,
  });
  assistant_record.performance = Some(performance);
  assistant_record.error_info = error_info.clone();
  state.logging.log(assistant_record).await;

  state
    .conversations
    .add_message(&conversation_id, "user", &message, None, None);
  state.conversations.add_message(
    &conversation_id,
    "assistant",
    &answer,
    (!retrieved_docs.is_empty()).then_some(retrieved_docs),
    error_info.clone(),
  );
  state.conversations.end_conversation(&conversation_id).await;

  let mut update = SessionUpdate::new(session_id, collection_name, model, reasoning_level);
  update.response_time_ms = Some(response_time_ms);
  update.top_scores = top_scores;
  update.has_error = error_info.is_some();
  state.logging.queue_session_update(update).await;
}

pub async fn chat_handler(
  State(state): State<AppState>,
  Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
  info!(
    "[CHAT API] model={}, collection={:?}, message={:.50}",
    request.model, request.collection_name, request.message
  );

  let conversation_id = request
    .conversation_id
    .clone()
    .unwrap_or_else(|| Uuid::new_v4().to_string());
  let session_id = Uuid::new_v4().to_string();
  let collection = request.collection_name.clone().unwrap_or_default();
  let conversation_id = state
    .conversations
    .start_conversation(Some(conversation_id), &collection);

  let started = Instant::now();
  let params = chat_params(&state, &request);

  match state.rag.chat(params).await {
    Ok(outcome) => {
      let response_time_ms = started.elapsed().as_millis() as i64;
      let retrieved_docs: Vec<RetrievedDocument> =
        outcome.retrieved_docs.iter().map(RetrievedDocument::from).collect();
      let token_count = outcome
        .usage
        .as_ref()
        .map(|u| u.total_tokens as i64)
        .unwrap_or(0);

      tokio::spawn(log_chat_interaction(
        state.clone(),
        session_id,
        conversation_id.clone(),
        collection,
        request.message.clone(),
        outcome.answer.clone(),
        outcome.retrieved_docs.clone(),
        request.reasoning_level.to_string(),
        request.model.clone(),
        llm_params_json(&request),
        response_time_ms,
        token_count,
        None,
      ));

      Ok(Json(ChatResponse {
        conversation_id: Some(conversation_id),
        answer: outcome.answer,
        retrieved_docs,
        usage: outcome.usage,
        reasoning_content: outcome.reasoning_content,
      }))
    }
    Err(e) => {
      error!("[CHAT API] chat failed: {e}");
      let error_info = ErrorInfo {
        error_type: error_kind(&e),
        error_message: e.to_string(),
      };
      tokio::spawn(log_chat_interaction(
        state.clone(),
        session_id,
        conversation_id,
        collection,
        request.message.clone(),
        String::new(),
        Vec::new(),
        request.reasoning_level.to_string(),
        request.model.clone(),
        llm_params_json(&request),
        started.elapsed().as_millis() as i64,
        0,
        Some(error_info),
      ));
      Err(to_http_error(e, "chat", state.config.server.debug))
    }
  }
}

fn error_kind(error: &CoreError) -> String {
  match error {
    CoreError::UpstreamUnavailable(_) => "UpstreamUnavailable",
    CoreError::ShapeMismatch { .. } => "ShapeMismatch",
    CoreError::NotFound(_) => "NotFound",
    CoreError::AlreadyExists(_) => "AlreadyExists",
    CoreError::Validation(_) => "Validation",
    CoreError::Parse(_) => "ParseFailure",
    _ => "Internal",
  }
  .to_string()
}

pub async fn chat_stream_handler(
  State(state): State<AppState>,
  Json(request): Json<ChatRequest>,
) -> Response {
  info!(
    "[CHAT API] stream: model={}, collection={:?}, message={:.50}",
    request.model, request.collection_name, request.message
  );

  let conversation_id = request
    .conversation_id
    .clone()
    .unwrap_or_else(|| Uuid::new_v4().to_string());
  let session_id = Uuid::new_v4().to_string();
  let collection = request.collection_name.clone().unwrap_or_default();
  let conversation_id = state
    .conversations
    .start_conversation(Some(conversation_id), &collection);

  let started = Instant::now();
  let params = chat_params(&state, &request);
  let (summary_tx, summary_rx) = tokio::sync::oneshot::channel::<StreamSummary>();

  // The logging hand-off fires once the stream finishes (or dies).
  {
    let state = state.clone();
    let request = request.clone();
    tokio::spawn(async move {
      // A dropped sender means the client went away mid-stream; the partial
      // turn is still logged, as an error record.
      let summary = summary_rx.await.unwrap_or_else(|_| StreamSummary {
        answer: String::new(),
        retrieved_docs: Vec::new(),
        error: Some("stream cancelled by client".to_string()),
      });
      let error_info = summary.error.map(|message| ErrorInfo {
        error_type: "StreamError".to_string(),
        error_message: message,
      });
      log_chat_interaction(
        state,
        session_id,
        conversation_id,
        collection,
        request.message.clone(),
        summary.answer,
        summary.retrieved_docs,
        request.reasoning_level.to_string(),
        request.model.clone(),
        llm_params_json(&request),
        started.elapsed().as_millis() as i64,
        0,
        error_info,
      )
      .await;
    });
  }

  let stream = state
    .rag
    .clone()
    .chat_stream(params, Some(summary_tx))
    .map(Ok::<_, Infallible>);

  Response::builder()
    .status(StatusCode::OK)
    .header(header::CONTENT_TYPE, "text/event-stream")
    .header(header::CACHE_CONTROL, "no-cache")
    .header(header::CONNECTION, "keep-alive")
    .header("X-Accel-Buffering", "no")
    .body(Body::from_stream(stream))
    .unwrap_or_else(|e| {
      error!("failed to build stream response: {e}");
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

pub async fn regenerate_handler(
  State(state): State<AppState>,
  Json(request): Json<RegenerateRequest>,
) -> Result<Json<ChatResponse>, AppError> {
  if let Some(conversation_id) = &request.conversation_id {
    state.conversations.set_regeneration(conversation_id);
  }

  let retrieved_docs: Vec<RetrievedDoc> = request
    .retrieved_docs
    .iter()
    .cloned()
    .map(RetrievedDocument::into_internal)
    .collect();

  let params = ChatParams {
    collection_name: request.collection_name.clone(),
    temp_collection_name: None,
    query: request.query.clone(),
    model_key: request.model.clone(),
    reasoning_level: request.reasoning_level,
    sampling: SamplingParams {
      temperature: request.temperature,
      top_p: request.top_p,
      max_tokens: request.max_tokens,
      frequency_penalty: request.frequency_penalty,
      presence_penalty: request.presence_penalty,
    },
    top_k: request.retrieved_docs.len().max(1),
    score_threshold: None,
    chat_history: request.chat_history.clone().unwrap_or_default(),
    use_reranking: false,
    use_hybrid: false,
  };

  let outcome = state
    .rag
    .regenerate(params, retrieved_docs)
    .await
    .map_err(|e| {
      error!("regenerate failed: {e}");
      to_http_error(e, "regenerate", state.config.server.debug)
    })?;

  // Retrieval was skipped; the client's documents come back unchanged.
  Ok(Json(ChatResponse {
    conversation_id: request.conversation_id,
    answer: outcome.answer,
    retrieved_docs: request.retrieved_docs,
    usage: outcome.usage,
    reasoning_content: outcome.reasoning_content,
  }))
}

pub async fn collections_handler(
  State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
  let collections = state.vector.list_collections().await.map_err(|e| {
    error!("collection listing failed: {e}");
    to_http_error(e, "collection", state.config.server.debug)
  })?;
  Ok(Json(json!({ "collections": collections })))
}

pub async fn default_settings_handler(State(state): State<AppState>) -> Json<DefaultSettingsResponse> {
  Json(DefaultSettingsResponse {
    model: state.config.llm.model.clone(),
    reasoning_level: state.config.rag.default_reasoning_level.clone(),
    temperature: state.config.llm.temperature,
    max_tokens: state.config.llm.max_tokens,
    top_p: state.config.llm.top_p,
    top_k: state.config.rag.default_top_k,
    use_reranking: state.config.reranker.enabled,
  })
}
