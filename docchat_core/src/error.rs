use thiserror::Error;

/// Error taxonomy shared by every docchat crate.
///
/// Transport-level failures against the embedding, vector, reranker and LLM
/// services all collapse to `UpstreamUnavailable`; the server layer maps the
/// variants onto HTTP statuses.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
  #[error("upstream unavailable: {0}")]
  UpstreamUnavailable(String),

  #[error("embedding shape mismatch: expected dim {expected}, got {actual}")]
  ShapeMismatch { expected: usize, actual: usize },

  #[error("not found: {0}")]
  NotFound(String),

  #[error("already exists: {0}")]
  AlreadyExists(String),

  #[error("invalid input: {0}")]
  Validation(String),

  #[error("parse failure: {0}")]
  Parse(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl CoreError {
  pub fn upstream(err: impl std::fmt::Display) -> Self {
    Self::UpstreamUnavailable(err.to_string())
  }
}
