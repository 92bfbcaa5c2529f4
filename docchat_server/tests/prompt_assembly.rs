//! End-to-end assembly checks for the RAG prompt: every retrieved document,
//! the question and the reasoning instruction must appear in the rendered
//! messages exactly once, for both prompting families.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ai_sdk::{EmbeddingClient, LlmClient, ModelEndpoint, RerankerClient};
use docchat_core::models::ReasoningLevel;
use docchat_core::RetrievedDoc;
use docchat_server::config::{HybridConfig, RagConfig, RerankerConfig};
use docchat_server::services::hybrid::HybridSearchEngine;
use docchat_server::services::prompt::PromptLoader;
use docchat_server::services::rag::RagService;
use docchat_server::services::vector_db::VectorStoreClient;

fn endpoint(model: &str, deep_reasoning: bool) -> ModelEndpoint {
  ModelEndpoint {
    base_url: "http://localhost:8080".to_string(),
    model: model.to_string(),
    temperature: 0.7,
    top_p: 0.9,
    max_tokens: 2000,
    deep_reasoning,
  }
}

fn service(prompts_dir: &std::path::Path) -> RagService {
  let embedder = Arc::new(
    EmbeddingClient::new("http://localhost:8083", "bge-m3-korean", 4, Duration::from_secs(60))
      .unwrap(),
  );
  let mut overrides = HashMap::new();
  overrides.insert("exaone-deep-7.8b".to_string(), endpoint("exaone-deep-7.8b", true));
  let llm = Arc::new(
    LlmClient::new(
      endpoint("gpt-oss-20b", false),
      overrides,
      Duration::from_secs(180),
      Duration::from_secs(300),
    )
    .unwrap(),
  );
  let reranker = Some(Arc::new(
    RerankerClient::new("http://localhost:8006", "BAAI/bge-reranker-v2-m3", Duration::from_secs(60))
      .unwrap(),
  ));
  let vector = Arc::new(
    VectorStoreClient::new("http://localhost:6333", None, Duration::from_secs(30)).unwrap(),
  );
  let hybrid = Arc::new(HybridSearchEngine::new(vector.clone(), HybridConfig::default()));
  let prompts = Arc::new(PromptLoader::new(prompts_dir));

  RagService::new(
    embedder,
    vector,
    llm,
    reranker,
    hybrid,
    prompts,
    true,
    RerankerConfig::default(),
    RagConfig::default(),
  )
}

fn docs() -> Vec<RetrievedDoc> {
  vec![
    RetrievedDoc::new(
      "d1",
      0.82,
      json!({"text": "환불은 7일 이내에 처리한다", "headings": ["refund.pdf", "페이지 3"]}),
    ),
    RetrievedDoc::new("d2", 0.71, json!({"text": "배송은 2일이 걸린다"})),
  ]
}

fn write_prompts(dir: &std::path::Path) {
  std::fs::write(
    dir.join("default.md"),
    "지침 블록입니다. {reasoning_instruction}",
  )
  .unwrap();
  std::fs::write(dir.join("casual.md"), "일상 대화 지침. {reasoning_instruction}").unwrap();
}

#[test]
fn generic_family_builds_system_plus_user_layout() {
  let tmp = tempfile::tempdir().unwrap();
  write_prompts(tmp.path());
  let service = service(tmp.path());

  let query = "환불 기한이 어떻게 되나요?";
  let messages = service.build_rag_messages(
    query,
    &docs(),
    ReasoningLevel::High,
    &[],
    Some("policies"),
    "gpt-oss-20b",
  );

  assert_eq!(messages.len(), 2);
  assert_eq!(messages[0].role.to_string(), "system");
  assert_eq!(
    messages[0].content.matches("Reasoning: high").count(),
    1,
    "reasoning instruction appears exactly once"
  );

  let user = &messages[1].content;
  assert_eq!(user.matches(query).count(), 1);
  assert_eq!(user.matches("환불은 7일 이내에 처리한다").count(), 1);
  assert_eq!(user.matches("배송은 2일이 걸린다").count(), 1);
  assert!(user.contains("[refund.pdf, 페이지 3]"));
  assert!(user.contains("[문서 2]"));
}

#[test]
fn deep_reasoning_family_gets_user_message_only() {
  let tmp = tempfile::tempdir().unwrap();
  write_prompts(tmp.path());
  let service = service(tmp.path());

  let query = "환불 기한이 어떻게 되나요?";
  let messages = service.build_rag_messages(
    query,
    &docs(),
    ReasoningLevel::Medium,
    &[],
    Some("policies"),
    "exaone-deep-7.8b",
  );

  // No system message; instructions and documents ride in the user turn.
  assert_eq!(messages.len(), 1);
  assert_eq!(messages[0].role.to_string(), "user");
  let user = &messages[0].content;
  assert!(user.contains("[지시사항]"));
  assert!(user.contains("[참고 문서]"));
  assert_eq!(user.matches(query).count(), 1);
  assert_eq!(user.matches("환불은 7일 이내에 처리한다").count(), 1);
}

#[test]
fn casual_mode_skips_document_block() {
  let tmp = tempfile::tempdir().unwrap();
  write_prompts(tmp.path());
  let service = service(tmp.path());

  let messages =
    service.build_rag_messages("안녕하세요", &[], ReasoningLevel::Medium, &[], None, "gpt-oss-20b");
  assert_eq!(messages.len(), 2);
  assert!(messages[0].content.starts_with("일상 대화 지침."));
  assert_eq!(messages[1].content, "안녕하세요");
  assert!(!messages[1].content.contains("참고"));
}

#[test]
fn history_is_threaded_between_system_and_user() {
  let tmp = tempfile::tempdir().unwrap();
  write_prompts(tmp.path());
  let service = service(tmp.path());

  let history = vec![
    docchat_core::ChatMessage {
      role: "user".to_string(),
      content: "이전 질문".to_string(),
    },
    docchat_core::ChatMessage {
      role: "assistant".to_string(),
      content: "이전 답변".to_string(),
    },
  ];
  let messages = service.build_rag_messages(
    "후속 질문",
    &docs(),
    ReasoningLevel::Low,
    &history,
    Some("policies"),
    "gpt-oss-20b",
  );
  assert_eq!(messages.len(), 4);
  assert_eq!(messages[1].content, "이전 질문");
  assert_eq!(messages[2].role.to_string(), "assistant");
  assert!(messages[3].content.contains("후속 질문"));
}
