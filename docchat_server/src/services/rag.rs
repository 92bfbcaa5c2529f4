//! RAG orchestrator: embed → retrieve → fuse → rerank → prompt-assemble →
//! LLM → citations, in single-shot and SSE-streaming modes.

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::{pin_mut, Stream, StreamExt};
use serde_json::json;
use tracing::{error, info, warn};

use ai_sdk::{
  extract_content_from_sse, ChatCompletion, EmbeddingClient, LlmClient, Message, RerankResult,
  RerankerClient, SamplingParams,
};
use docchat_core::models::{convert_docs_to_sources, ModelFamily, ReasoningLevel};
use docchat_core::{ChatMessage, CoreError, RetrievedDoc, Usage};

use crate::config::{RagConfig, RerankerConfig};
use crate::services::citation::extract_citations_for_sources;
use crate::services::hybrid::HybridSearchEngine;
use crate::services::keyword::extract_keywords_for_documents;
use crate::services::prompt::PromptLoader;
use crate::services::vector_db::VectorStoreClient;

const NO_DOCS_ANSWER: &str = "관련된 문서를 찾을 수 없습니다. 다른 질문을 시도해보세요.";
const STREAM_NO_DOCS_ERROR: &str = "관련된 문서를 찾을 수 없습니다.";
const STREAM_FAILURE_ERROR: &str = "스트리밍 처리 중 오류가 발생했습니다.";

#[derive(Debug, Clone)]
pub struct ChatParams {
  pub collection_name: Option<String>,
  pub temp_collection_name: Option<String>,
  pub query: String,
  pub model_key: String,
  pub reasoning_level: ReasoningLevel,
  pub sampling: SamplingParams,
  pub top_k: usize,
  pub score_threshold: Option<f32>,
  pub chat_history: Vec<ChatMessage>,
  pub use_reranking: bool,
  pub use_hybrid: bool,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
  pub answer: String,
  pub retrieved_docs: Vec<RetrievedDoc>,
  pub usage: Option<Usage>,
  pub reasoning_content: Option<String>,
  pub retrieval_time_ms: Option<i64>,
}

pub struct RagService {
  embedder: Arc<EmbeddingClient>,
  vector: Arc<VectorStoreClient>,
  llm: Arc<LlmClient>,
  reranker: Option<Arc<RerankerClient>>,
  hybrid: Arc<HybridSearchEngine>,
  prompts: Arc<PromptLoader>,
  hybrid_enabled: bool,
  rerank_config: RerankerConfig,
  rag_config: RagConfig,
}

impl RagService {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    embedder: Arc<EmbeddingClient>,
    vector: Arc<VectorStoreClient>,
    llm: Arc<LlmClient>,
    reranker: Option<Arc<RerankerClient>>,
    hybrid: Arc<HybridSearchEngine>,
    prompts: Arc<PromptLoader>,
    hybrid_enabled: bool,
    rerank_config: RerankerConfig,
    rag_config: RagConfig,
  ) -> Self {
    Self {
      embedder,
      vector,
      llm,
      reranker,
      hybrid,
      prompts,
      hybrid_enabled,
      rerank_config,
      rag_config,
    }
  }

  pub fn hybrid_engine(&self) -> Arc<HybridSearchEngine> {
    self.hybrid.clone()
  }

  /// Retrieves similar passages from one collection, hybrid or vector-only.
  pub async fn retrieve(
    &self,
    collection_name: &str,
    query: &str,
    top_k: usize,
    score_threshold: Option<f32>,
    use_hybrid: bool,
  ) -> Result<Vec<RetrievedDoc>, CoreError> {
    info!("[RAG] embedding query: {:.100}", query);
    let query_vector = self
      .embedder
      .embed_one(query)
      .await
      .map_err(|e| CoreError::UpstreamUnavailable(e.to_string()))?;

    if use_hybrid && self.hybrid_enabled {
      info!("[RAG] hybrid search in '{collection_name}' with top_k={top_k}");
      return self
        .hybrid
        .hybrid_search(collection_name, query, &query_vector, top_k, score_threshold)
        .await;
    }

    info!("[RAG] vector search in '{collection_name}' with top_k={top_k}");
    let hits = self
      .vector
      .search(collection_name, &query_vector, top_k, score_threshold)
      .await?;
    Ok(
      hits
        .into_iter()
        .map(|hit| {
          let mut doc = RetrievedDoc::new(hit.id, hit.score, hit.payload);
          doc.vector_score = Some(doc.score);
          doc
        })
        .collect(),
    )
  }

  /// Searches several collections and merges by score descending; every
  /// document is tagged with its origin collection. A failing collection is
  /// skipped, not fatal.
  pub async fn retrieve_from_multiple(
    &self,
    collection_names: &[String],
    query: &str,
    top_k: usize,
    score_threshold: Option<f32>,
    use_hybrid: bool,
  ) -> Vec<RetrievedDoc> {
    let mut all_results = Vec::new();
    for collection_name in collection_names {
      match self
        .retrieve(collection_name, query, top_k, score_threshold, use_hybrid)
        .await
      {
        Ok(mut results) => {
          for doc in &mut results {
            doc.source_collection = Some(collection_name.clone());
          }
          info!("[RAG] retrieved {} docs from '{collection_name}'", results.len());
          all_results.extend(results);
        }
        Err(e) => {
          warn!("[RAG] failed to retrieve from '{collection_name}': {e}");
        }
      }
    }
    all_results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    info!("[RAG] total merged results: {} documents", all_results.len());
    all_results
  }

  async fn retrieve_for_targets(
    &self,
    targets: &[String],
    query: &str,
    top_k: usize,
    score_threshold: Option<f32>,
    use_hybrid: bool,
  ) -> Result<Vec<RetrievedDoc>, CoreError> {
    if targets.len() == 1 {
      self
        .retrieve(&targets[0], query, top_k, score_threshold, use_hybrid)
        .await
    } else {
      info!("[RAG] merged search across {} collections: {targets:?}", targets.len());
      Ok(
        self
          .retrieve_from_multiple(targets, query, top_k, score_threshold, use_hybrid)
          .await,
      )
    }
  }

  fn initial_top_k(&self, top_k: usize, use_reranking: bool) -> usize {
    if use_reranking && self.reranker.is_some() {
      let expanded = top_k * self.rerank_config.top_k_multiplier;
      info!("reranking enabled: expanding top_k from {top_k} to {expanded}");
      expanded
    } else {
      top_k
    }
  }

  async fn apply_reranking(
    &self,
    query: &str,
    retrieved_docs: Vec<RetrievedDoc>,
    top_k: usize,
  ) -> Vec<RetrievedDoc> {
    let Some(reranker) = &self.reranker else {
      return retrieved_docs;
    };
    if retrieved_docs.is_empty() {
      return retrieved_docs;
    }

    info!("reranking {} documents", retrieved_docs.len());
    let inputs = build_rerank_inputs(&retrieved_docs);
    match reranker
      .rerank_with_fallback(query, &inputs, Some(top_k), false)
      .await
    {
      Some(results) if !results.is_empty() => apply_rerank_results(
        &retrieved_docs,
        &results,
        self.rerank_config.score_threshold,
        top_k,
      ),
      _ => {
        warn!("reranking failed, using original retrieval order");
        let mut docs = retrieved_docs;
        docs.truncate(top_k);
        docs
      }
    }
  }

  /// Builds the LLM message list. The deep-reasoning family takes no system
  /// prompt; its instructions ride in the user message.
  pub fn build_rag_messages(
    &self,
    query: &str,
    retrieved_docs: &[RetrievedDoc],
    reasoning_level: ReasoningLevel,
    chat_history: &[ChatMessage],
    collection_name: Option<&str>,
    model_key: &str,
  ) -> Vec<Message> {
    let system_content =
      self
        .prompts
        .get_system_prompt(collection_name, reasoning_level, Some(model_key));
    let family = ModelFamily::of_key(model_key);
    let is_casual = collection_name.is_none() || retrieved_docs.is_empty();

    let context = if is_casual {
      String::new()
    } else {
      build_document_context(retrieved_docs)
    };

    let mut messages = Vec::new();
    if family.user_prompt_only() {
      for turn in chat_history {
        messages.push(Message::raw(&turn.role, turn.content.clone()));
      }
      let user_content = if is_casual {
        format!(
          "[지시사항]\n{system_content}\n\n[질문]\n{query}\n\n위 지시사항에 따라 질문에 답변해주세요. 반드시 한국어로 답변하세요."
        )
      } else {
        format!(
          "[지시사항]\n{system_content}\n\n[참고 문서]\n{context}\n\n[질문]\n{query}\n\n위 문서를 기반으로 질문에 답변해주세요. 반드시 한국어로 답변하세요. 문서에 없는 내용은 추측하지 마세요."
        )
      };
      messages.push(Message::user(user_content));
    } else {
      messages.push(Message::system(system_content));
      for turn in chat_history {
        messages.push(Message::raw(&turn.role, turn.content.clone()));
      }
      if is_casual {
        messages.push(Message::user(query.to_string()));
      } else {
        messages.push(Message::user(format!(
          "다음 문서들을 참고하여 질문에 답변해주세요.\n\n{context}\n\n질문: {query}"
        )));
      }
    }
    messages
  }

  async fn generate(
    &self,
    query: &str,
    retrieved_docs: &[RetrievedDoc],
    params: &ChatParams,
  ) -> Result<ChatCompletion, CoreError> {
    let messages = self.build_rag_messages(
      query,
      retrieved_docs,
      params.reasoning_level,
      &params.chat_history,
      params.collection_name.as_deref(),
      &params.model_key,
    );
    info!(
      "[RAG] generating answer with model={}, reasoning_level={}",
      params.model_key, params.reasoning_level
    );
    self
      .llm
      .chat(&messages, &params.model_key, &params.sampling)
      .await
      .map_err(|e| CoreError::UpstreamUnavailable(e.to_string()))
  }

  /// Non-streaming chat: retrieve, optionally rerank, generate.
  pub async fn chat(&self, params: ChatParams) -> Result<ChatOutcome, CoreError> {
    let targets = target_collections(&params);
    let mut retrieval_time_ms = None;

    let retrieved_docs = if targets.is_empty() {
      info!("[RAG] casual mode - skipping retrieval");
      Vec::new()
    } else {
      let initial_top_k = self.initial_top_k(params.top_k, params.use_reranking);
      let started = Instant::now();
      let docs = self
        .retrieve_for_targets(
          &targets,
          &params.query,
          initial_top_k,
          params.score_threshold,
          params.use_hybrid,
        )
        .await?;
      retrieval_time_ms = Some(started.elapsed().as_millis() as i64);

      if docs.is_empty() {
        return Ok(ChatOutcome {
          answer: NO_DOCS_ANSWER.to_string(),
          retrieved_docs: Vec::new(),
          usage: None,
          reasoning_content: None,
          retrieval_time_ms,
        });
      }
      docs
    };

    let retrieved_docs = if params.use_reranking && !retrieved_docs.is_empty() {
      self
        .apply_reranking(&params.query, retrieved_docs, params.top_k)
        .await
    } else {
      retrieved_docs
    };

    let completion = self.generate(&params.query, &retrieved_docs, &params).await?;

    Ok(ChatOutcome {
      answer: completion.content,
      retrieved_docs,
      usage: completion.usage.map(convert_usage),
      reasoning_content: completion
        .reasoning_content
        .filter(|content| !content.is_empty()),
      retrieval_time_ms,
    })
  }

  /// Regenerate: retrieval and reranking are skipped entirely; the client's
  /// previously-retrieved documents feed a fresh prompt.
  pub async fn regenerate(
    &self,
    params: ChatParams,
    retrieved_docs: Vec<RetrievedDoc>,
  ) -> Result<ChatOutcome, CoreError> {
    let completion = self.generate(&params.query, &retrieved_docs, &params).await?;
    Ok(ChatOutcome {
      answer: completion.content,
      retrieved_docs,
      usage: completion.usage.map(convert_usage),
      reasoning_content: completion
        .reasoning_content
        .filter(|content| !content.is_empty()),
      retrieval_time_ms: None,
    })
  }

  /// Streaming chat. Event order is fixed: stage markers, one `sources`
  /// frame, token deltas in emission order, an optional `sources_update`,
  /// with `[DONE]` passed through. A mid-stream failure becomes a single
  /// `{"error": ...}` line instead of a broken stream. The full answer text
  /// is handed to `on_complete` for the logging path.
  pub fn chat_stream(
    self: Arc<Self>,
    params: ChatParams,
    on_complete: Option<tokio::sync::oneshot::Sender<StreamSummary>>,
  ) -> impl Stream<Item = String> + Send {
    stream! {
      let targets = target_collections(&params);
      let mut summary = StreamSummary::default();

      let mut retrieved_docs = if targets.is_empty() {
        info!("[RAG] casual mode stream - skipping retrieval");
        yield stage_event("generate");
        Vec::new()
      } else {
        yield stage_event("analyze");
        let initial_top_k = self.initial_top_k(params.top_k, params.use_reranking);
        yield stage_event("search");

        let docs = match self
          .retrieve_for_targets(
            &targets,
            &params.query,
            initial_top_k,
            params.score_threshold,
            params.use_hybrid,
          )
          .await
        {
          Ok(docs) => docs,
          Err(e) => {
            error!("[RAG] stream retrieval failed: {e}");
            summary.error = Some(e.to_string());
            finish(on_complete, summary);
            yield error_event(STREAM_FAILURE_ERROR);
            return;
          }
        };

        if docs.is_empty() {
          summary.error = Some(STREAM_NO_DOCS_ERROR.to_string());
          finish(on_complete, summary);
          yield error_event(STREAM_NO_DOCS_ERROR);
          return;
        }

        let docs = if params.use_reranking && self.reranker.is_some() {
          yield stage_event("rerank");
          self.apply_reranking(&params.query, docs, params.top_k).await
        } else {
          docs
        };
        docs
      };

      // Sources go out once, before any token, with query keywords attached.
      if !retrieved_docs.is_empty() || !targets.is_empty() {
        extract_keywords_for_documents(&params.query, &mut retrieved_docs);
        let sources = convert_docs_to_sources(&retrieved_docs);
        yield data_event(&json!({ "sources": sources }));
        yield stage_event("generate");
      }
      summary.retrieved_docs = retrieved_docs.clone();

      let messages = self.build_rag_messages(
        &params.query,
        &retrieved_docs,
        params.reasoning_level,
        &params.chat_history,
        params.collection_name.as_deref(),
        &params.model_key,
      );
      info!(
        "[RAG] streaming answer with model={}, reasoning_level={}",
        params.model_key, params.reasoning_level
      );

      let llm_stream = self.llm.chat_stream(&messages, &params.model_key, &params.sampling);
      pin_mut!(llm_stream);

      let mut response_parts: Vec<String> = Vec::new();
      let mut failed = false;
      while let Some(frame) = llm_stream.next().await {
        match frame {
          Ok(frame) => {
            if let Some(content) = extract_content_from_sse(frame.trim_end()) {
              response_parts.push(content);
            }
            yield frame;
          }
          Err(e) => {
            error!("[RAG] stream generation failed: {e}");
            summary.error = Some(e.to_string());
            failed = true;
            yield error_event(STREAM_FAILURE_ERROR);
            break;
          }
        }
      }

      // Whatever was collected is the answer of record, even on truncation.
      let full_response: String = response_parts.concat();
      summary.answer = full_response.clone();

      if !failed
        && self.rag_config.citation_extraction
        && !full_response.is_empty()
        && !retrieved_docs.is_empty()
      {
        extract_citations_for_sources(&full_response, &mut retrieved_docs);
        let has_citations = retrieved_docs
          .iter()
          .any(|doc| doc.cited_phrases.as_ref().is_some_and(|p| !p.is_empty()));
        if has_citations {
          let updated = convert_docs_to_sources(&retrieved_docs);
          yield data_event(&json!({ "sources_update": updated }));
          summary.retrieved_docs = retrieved_docs;
        }
      }

      finish(on_complete, summary);
    }
  }
}

/// What the logging hand-off needs from a finished stream.
#[derive(Debug, Default)]
pub struct StreamSummary {
  pub answer: String,
  pub retrieved_docs: Vec<RetrievedDoc>,
  pub error: Option<String>,
}

fn finish(tx: Option<tokio::sync::oneshot::Sender<StreamSummary>>, summary: StreamSummary) {
  if let Some(tx) = tx {
    let _ = tx.send(summary);
  }
}

fn target_collections(params: &ChatParams) -> Vec<String> {
  [&params.collection_name, &params.temp_collection_name]
    .into_iter()
    .flatten()
    .filter(|name| !name.is_empty())
    .cloned()
    .collect()
}

fn convert_usage(usage: ai_sdk::LlmUsage) -> Usage {
  Usage {
    prompt_tokens: usage.prompt_tokens,
    completion_tokens: usage.completion_tokens,
    total_tokens: usage.total_tokens,
  }
}

fn stage_event(stage: &str) -> String {
  data_event(&json!({ "type": "stage", "stage": stage }))
}

fn error_event(message: &str) -> String {
  data_event(&json!({ "error": message }))
}

fn data_event(value: &serde_json::Value) -> String {
  format!("data: {value}\n\n")
}

/// Rerank input strings: `[filename] [headings[1]] text`.
pub fn build_rerank_inputs(docs: &[RetrievedDoc]) -> Vec<String> {
  docs
    .iter()
    .map(|doc| {
      let text = doc.text();
      let headings = doc.headings();
      match (doc.filename(), headings.get(1)) {
        (Some(filename), Some(section)) => format!("[{filename}] [{section}] {text}"),
        (Some(filename), None) => format!("[{filename}] {text}"),
        _ => text.to_string(),
      }
    })
    .collect()
}

/// Applies reranker output: each document's `score` becomes the rerank
/// score, then the threshold filters. When nothing clears the threshold the
/// reranked ordering (truncated to `top_k`) is kept as-is.
pub fn apply_rerank_results(
  retrieved_docs: &[RetrievedDoc],
  results: &[RerankResult],
  score_threshold: f32,
  top_k: usize,
) -> Vec<RetrievedDoc> {
  let mut reordered = Vec::new();
  let mut filtered = Vec::new();

  for result in results {
    let Some(doc) = retrieved_docs.get(result.index) else {
      continue;
    };
    let mut doc = doc.clone();
    doc.score = result.relevance_score;
    if result.relevance_score >= score_threshold {
      filtered.push(doc.clone());
    }
    reordered.push(doc);
  }

  if !filtered.is_empty() {
    info!(
      "reranking completed: {} docs passed threshold (>={score_threshold}), top score={:.4}",
      filtered.len(),
      filtered[0].score
    );
    filtered
  } else {
    let top_score = reordered.first().map(|d| d.score).unwrap_or(0.0);
    info!("reranking completed: no docs passed threshold, keeping reranked order. top score={top_score:.4}");
    reordered.truncate(top_k);
    reordered
  }
}

/// Document block for the prompt: each entry is
/// `[ref] (유사도: s)\ntext`, where ref prefers `[headings0, headings1]`,
/// then `[headings0]`, then `[문서 i]`.
fn build_document_context(retrieved_docs: &[RetrievedDoc]) -> String {
  let mut parts = Vec::with_capacity(retrieved_docs.len());
  for (idx, doc) in retrieved_docs.iter().enumerate() {
    let headings = doc.headings();
    let reference = if headings.len() >= 2 {
      format!("[{}, {}]", headings[0], headings[1])
    } else if headings.len() == 1 {
      format!("[{}]", headings[0])
    } else {
      format!("[문서 {}]", idx + 1)
    };
    parts.push(format!("{reference} (유사도: {:.3})\n{}", doc.score, doc.text()));
  }
  parts.join("\n\n")
}
