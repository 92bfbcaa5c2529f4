use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyticsError {
  #[error("database error: {0}")]
  Sqlx(#[from] sqlx::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serde(#[from] serde_json::Error),

  #[error("general error: {0}")]
  AnyError(#[from] anyhow::Error),
}
