use axum::http::StatusCode;
use axum::response::Json;
use axum::{
  body::Body,
  response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use docchat_core::CoreError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorOutput {
  pub code: u16,
  pub error: String,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AppError {
  #[error("upstream unavailable: {0}")]
  UpstreamUnavailable(String),

  #[error("Not Found: {0}")]
  NotFound(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("invalid input: {0}")]
  InvalidInput(String),

  #[error("io error: {0}")]
  IOError(#[from] std::io::Error),

  #[error("internal error: {0}")]
  AnyError(#[from] anyhow::Error),
}

impl From<CoreError> for AppError {
  fn from(error: CoreError) -> Self {
    match error {
      CoreError::UpstreamUnavailable(e) => AppError::UpstreamUnavailable(e),
      CoreError::ShapeMismatch { expected, actual } => AppError::UpstreamUnavailable(format!(
        "embedding dim mismatch: expected {expected}, got {actual}"
      )),
      CoreError::NotFound(e) => AppError::NotFound(e),
      CoreError::AlreadyExists(e) => AppError::Conflict(e),
      CoreError::Validation(e) => AppError::InvalidInput(e),
      CoreError::Parse(e) => AppError::AnyError(anyhow::anyhow!(e)),
      CoreError::Internal(e) => AppError::AnyError(anyhow::anyhow!(e)),
      _ => AppError::AnyError(anyhow::anyhow!(error.to_string())),
    }
  }
}

impl From<ai_sdk::AiError> for AppError {
  fn from(error: ai_sdk::AiError) -> Self {
    match error {
      ai_sdk::AiError::ShapeMismatch { expected, actual } => AppError::UpstreamUnavailable(
        format!("embedding dim mismatch: expected {expected}, got {actual}"),
      ),
      other => AppError::UpstreamUnavailable(other.to_string()),
    }
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response<Body> {
    let status = match &self {
      AppError::NotFound(_) => StatusCode::NOT_FOUND,
      AppError::Conflict(_) => StatusCode::CONFLICT,
      AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
      AppError::UpstreamUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
      AppError::IOError(_) => StatusCode::INTERNAL_SERVER_ERROR,
      AppError::AnyError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let code = status.as_u16();
    warn!("Status: {}, error: {}", status, self);
    let body = Json(ErrorOutput {
      code,
      error: self.to_string(),
    });
    (status, body).into_response()
  }
}

/// Generalized Korean messages surfaced outside DEBUG mode. The detailed
/// error is always written to the log; the client sees only the context
/// message unless debug is on.
pub fn safe_error_message(error: &AppError, context: &str, debug: bool) -> String {
  if debug {
    return error.to_string();
  }
  match context {
    "chat" => "채팅 처리 중 오류가 발생했습니다.",
    "stream" => "스트리밍 처리 중 오류가 발생했습니다.",
    "regenerate" => "응답 재생성 중 오류가 발생했습니다.",
    "collection" => "컬렉션 조회 중 오류가 발생했습니다.",
    "settings" => "설정 조회 중 오류가 발생했습니다.",
    "timeout" => "응답 시간이 초과되었습니다.",
    "not_found" => "관련된 문서를 찾을 수 없습니다.",
    _ => "일시적인 오류가 발생했습니다.",
  }
  .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn core_error_mapping() {
    let err: AppError = CoreError::NotFound("collection 'x'".to_string()).into();
    assert!(matches!(err, AppError::NotFound(_)));
    let err: AppError = CoreError::Validation("bad".to_string()).into();
    assert!(matches!(err, AppError::InvalidInput(_)));
  }

  #[test]
  fn safe_messages_hide_details_in_production() {
    let err = AppError::UpstreamUnavailable("connection refused to 10.0.0.1".to_string());
    let prod = safe_error_message(&err, "chat", false);
    assert_eq!(prod, "채팅 처리 중 오류가 발생했습니다.");
    let dev = safe_error_message(&err, "chat", true);
    assert!(dev.contains("connection refused"));
  }

}
