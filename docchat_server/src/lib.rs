pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, ErrorOutput};

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tower_http::{
  compression::CompressionLayer,
  cors::{self, CorsLayer},
  trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use ai_sdk::{EmbeddingClient, LlmClient, RerankerClient};
use analytics_server::{
  ConversationStore, LoggingConfig, LoggingPipeline, SessionStore, StatisticsService,
};

use handlers::{analytics, chat};
use services::hybrid::HybridSearchEngine;
use services::prompt::PromptLoader;
use services::rag::RagService;
use services::vector_db::VectorStoreClient;

#[derive(Clone)]
pub struct AppState {
  inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
  pub config: AppConfig,
  pub rag: Arc<RagService>,
  pub vector: Arc<VectorStoreClient>,
  pub logging: Arc<LoggingPipeline>,
  pub conversations: Arc<ConversationStore>,
  pub sessions: SessionStore,
  pub stats: Arc<StatisticsService>,
}

impl Deref for AppState {
  type Target = AppStateInner;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl fmt::Debug for AppState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AppState")
      .field("config", &self.config.summary())
      .finish()
  }
}

impl AppState {
  pub async fn try_new(config: AppConfig) -> Result<Self, AppError> {
    let embedder = Arc::new(EmbeddingClient::new(
      &config.embedding.url,
      &config.embedding.model,
      config.embedding.dimension,
      Duration::from_secs(config.embedding.timeout_seconds),
    )?);

    let llm = Arc::new(LlmClient::new(
      config.llm.default_endpoint(),
      config.llm.endpoint_overrides(),
      Duration::from_secs(config.llm.timeout_seconds),
      Duration::from_secs(config.llm.stream_timeout_seconds),
    )?);

    let reranker = if config.reranker.enabled {
      Some(Arc::new(RerankerClient::new(
        &config.reranker.url,
        &config.reranker.model,
        Duration::from_secs(config.reranker.timeout_seconds),
      )?))
    } else {
      None
    };

    let vector = Arc::new(VectorStoreClient::new(
      &config.vector_store.url,
      config.vector_store.api_key.clone(),
      Duration::from_secs(config.vector_store.timeout_seconds),
    )?);

    let hybrid = Arc::new(HybridSearchEngine::new(
      vector.clone(),
      config.hybrid.clone(),
    ));
    let prompts = Arc::new(PromptLoader::new(&config.prompts.dir));

    let rag = Arc::new(RagService::new(
      embedder,
      vector.clone(),
      llm,
      reranker,
      hybrid,
      prompts,
      config.hybrid.enabled,
      config.reranker.clone(),
      config.rag.clone(),
    ));

    let sessions = SessionStore::connect(&config.server.db_url)
      .await
      .map_err(|e| AppError::AnyError(anyhow::anyhow!("session store init failed: {e}")))?;

    let logging = LoggingPipeline::new(
      LoggingConfig {
        queue_size: config.logging.queue_size,
        session_queue_size: config.logging.session_queue_size,
        batch_size: config.logging.batch_size,
        session_batch_size: config.logging.session_batch_size,
        flush_interval: Duration::from_secs(config.logging.flush_interval_seconds),
        data_dir: config.logs_data_dir(),
        overflow_dir: config.logs_overflow_dir(),
      },
      sessions.clone(),
    );

    let conversations = Arc::new(ConversationStore::new(
      config.logs_conversation_dir(),
      config.retention.conversation_sample_rate,
      config.retention.retention_days,
      config.retention.compress_after_days,
    ));

    let stats = Arc::new(StatisticsService::new(
      config.logs_data_dir(),
      sessions.clone(),
      config.stats.chunk_size,
      config.stats.large_file_threshold,
    ));

    Ok(Self {
      inner: Arc::new(AppStateInner {
        config,
        rag,
        vector,
        logging,
        conversations,
        sessions,
        stats,
      }),
    })
  }
}

pub fn get_router(state: AppState) -> Router {
  let cors = CorsLayer::new()
    .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
    .allow_origin(cors::Any)
    .allow_headers(cors::Any)
    .max_age(Duration::from_secs(3600));

  let trace_layer = TraceLayer::new_for_http()
    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
    .on_request(DefaultOnRequest::new().level(Level::INFO))
    .on_response(DefaultOnResponse::new().level(Level::INFO));

  let chat_api = Router::new()
    .route("/", post(chat::chat_handler))
    .route("/stream", post(chat::chat_stream_handler))
    .route("/regenerate", post(chat::regenerate_handler))
    .route("/collections", get(chat::collections_handler))
    .route("/default-settings", get(chat::default_settings_handler));

  let analytics_api = Router::new()
    .route("/summary", get(analytics::summary_handler))
    .route("/timeline", get(analytics::timeline_handler))
    .route("/report", get(analytics::report_handler))
    .route("/aggregate", post(analytics::aggregate_handler))
    .route("/logging-stats", get(analytics::logging_stats_handler));

  Router::new()
    .nest("/api/chat", chat_api)
    .nest("/api/analytics", analytics_api)
    .route("/health", get(health_handler))
    .layer(CompressionLayer::new())
    .layer(trace_layer)
    .layer(cors)
    .with_state(state)
    .fallback(not_found_handler)
}

async fn health_handler() -> Json<serde_json::Value> {
  Json(serde_json::json!({
    "status": "alive",
    "timestamp": docchat_core::kst::now_iso(),
  }))
}

async fn not_found_handler() -> (StatusCode, Json<serde_json::Value>) {
  (
    StatusCode::NOT_FOUND,
    Json(serde_json::json!({
      "error": "Not Found",
      "message": "The requested resource was not found"
    })),
  )
}
