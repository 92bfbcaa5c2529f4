//! Relational session store (SQLite via sqlx).
//!
//! One row per `session_id`, upserted per turn by the session batcher.
//! Invariants: `message_count = user_message_count + assistant_message_count`
//! and `avg_response_time_ms = total_response_time_ms / assistant_message_count`
//! (integer division). `min_retrieval_score` is stored as text, as the
//! running minimum of per-turn top scores.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, error};

use docchat_core::{kst, SessionUpdate};

use crate::error::AnalyticsError;

const CREATE_SESSIONS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chat_sessions (
  session_id TEXT PRIMARY KEY,
  collection_name TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  message_count INTEGER NOT NULL DEFAULT 0,
  user_message_count INTEGER NOT NULL DEFAULT 0,
  assistant_message_count INTEGER NOT NULL DEFAULT 0,
  total_response_time_ms INTEGER NOT NULL DEFAULT 0,
  avg_response_time_ms INTEGER NOT NULL DEFAULT 0,
  has_error INTEGER NOT NULL DEFAULT 0,
  min_retrieval_score TEXT,
  llm_model TEXT,
  reasoning_level TEXT
)
"#;

const CREATE_STATISTICS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chat_statistics (
  stat_id TEXT PRIMARY KEY,
  collection_name TEXT NOT NULL,
  date TEXT NOT NULL,
  hour INTEGER,
  total_queries INTEGER NOT NULL DEFAULT 0,
  unique_sessions INTEGER NOT NULL DEFAULT 0,
  total_tokens INTEGER NOT NULL DEFAULT 0,
  error_count INTEGER NOT NULL DEFAULT 0,
  avg_response_time_ms REAL NOT NULL DEFAULT 0,
  p50_response_time_ms REAL,
  p95_response_time_ms REAL,
  p99_response_time_ms REAL,
  max_response_time_ms REAL,
  avg_retrieval_time_ms REAL NOT NULL DEFAULT 0,
  avg_retrieval_score REAL,
  avg_retrieved_count REAL NOT NULL DEFAULT 0,
  reranking_usage_count INTEGER NOT NULL DEFAULT 0,
  top_queries TEXT NOT NULL DEFAULT '[]',
  model_usage TEXT NOT NULL DEFAULT '{}',
  reasoning_distribution TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (collection_name, date, hour)
)
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChatSessionRow {
  pub session_id: String,
  pub collection_name: String,
  pub started_at: String,
  pub ended_at: Option<String>,
  pub message_count: i64,
  pub user_message_count: i64,
  pub assistant_message_count: i64,
  pub total_response_time_ms: i64,
  pub avg_response_time_ms: i64,
  pub has_error: i64,
  pub min_retrieval_score: Option<String>,
  pub llm_model: Option<String>,
  pub reasoning_level: Option<String>,
}

#[derive(Clone)]
pub struct SessionStore {
  pool: SqlitePool,
}

impl SessionStore {
  /// Connects and applies the SQLite tuning pragmas (WAL,
  /// `synchronous=NORMAL`, cache size) before creating the schema.
  pub async fn connect(db_url: &str) -> Result<Self, AnalyticsError> {
    let options = SqliteConnectOptions::from_str(db_url)
      .map_err(sqlx::Error::from)?
      .create_if_missing(true)
      .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
      .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
      .pragma("cache_size", "-64000");

    // An in-memory database exists per connection; it must be pinned to a
    // single one that never recycles.
    let pool_options = if db_url.contains(":memory:") {
      SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
    } else {
      SqlitePoolOptions::new().max_connections(5)
    };
    let pool = pool_options.connect_with(options).await?;

    sqlx::query(CREATE_SESSIONS_SQL).execute(&pool).await?;
    sqlx::query(CREATE_STATISTICS_SQL).execute(&pool).await?;
    Ok(Self { pool })
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  /// Applies a batch of per-turn diffs in one transaction. A bad diff is
  /// counted and skipped; a failed commit rolls the whole batch back.
  /// Returns (applied, errors).
  pub async fn apply_updates(&self, batch: &[SessionUpdate]) -> (usize, usize) {
    let mut applied = 0usize;
    let mut errors = 0usize;

    let mut tx = match self.pool.begin().await {
      Ok(tx) => tx,
      Err(e) => {
        error!("failed to open session batch transaction: {e}");
        return (0, batch.len());
      }
    };

    for update in batch {
      match apply_one(&mut tx, update).await {
        Ok(()) => applied += 1,
        Err(e) => {
          error!("session update failed (session_id: {}): {e}", update.session_id);
          errors += 1;
        }
      }
    }

    match tx.commit().await {
      Ok(()) => {
        debug!("session update batch committed: {applied} applied");
        (applied, errors)
      }
      Err(e) => {
        error!("session batch commit failed, rolled back: {e}");
        (0, batch.len())
      }
    }
  }

  pub async fn get(&self, session_id: &str) -> Result<Option<ChatSessionRow>, AnalyticsError> {
    let row = sqlx::query_as::<_, ChatSessionRow>(
      "SELECT * FROM chat_sessions WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row)
  }

  /// Distinct dates (YYYY-MM-DD) that already have a daily statistics row.
  pub async fn dates_with_daily_stats(
    &self,
    from: &str,
    to: &str,
  ) -> Result<Vec<String>, AnalyticsError> {
    let rows = sqlx::query(
      "SELECT DISTINCT date FROM chat_statistics WHERE date >= ? AND date <= ? AND hour IS NULL",
    )
    .bind(from)
    .bind(to)
    .fetch_all(&self.pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.get::<String, _>("date")).collect())
  }
}

async fn apply_one(
  tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
  update: &SessionUpdate,
) -> Result<(), sqlx::Error> {
  let existing = sqlx::query_as::<_, ChatSessionRow>(
    "SELECT * FROM chat_sessions WHERE session_id = ?",
  )
  .bind(&update.session_id)
  .fetch_optional(&mut **tx)
  .await?;

  let mut row = match existing {
    Some(row) => row,
    None => ChatSessionRow {
      session_id: update.session_id.clone(),
      collection_name: update.collection_name.clone(),
      started_at: kst::now_naive().format("%Y-%m-%d %H:%M:%S").to_string(),
      ended_at: None,
      message_count: 0,
      user_message_count: 0,
      assistant_message_count: 0,
      total_response_time_ms: 0,
      avg_response_time_ms: 0,
      has_error: 0,
      min_retrieval_score: None,
      llm_model: Some(update.model.clone()),
      reasoning_level: Some(update.reasoning_level.clone()),
    },
  };

  // One diff = one user + one assistant message.
  row.message_count += 2;
  row.user_message_count += 1;
  row.assistant_message_count += 1;

  if let Some(response_time_ms) = update.response_time_ms {
    row.total_response_time_ms += response_time_ms;
    row.avg_response_time_ms =
      row.total_response_time_ms / row.assistant_message_count.max(1);
  }

  if update.has_error {
    row.has_error = 1;
  }

  if let Some(min_score) = update
    .top_scores
    .iter()
    .copied()
    .fold(None::<f32>, |acc, s| Some(acc.map_or(s, |m| m.min(s))))
  {
    let current: Option<f32> = row
      .min_retrieval_score
      .as_deref()
      .and_then(|s| s.parse().ok());
    if current.is_none() || current.is_some_and(|c| c > min_score) {
      row.min_retrieval_score = Some(min_score.to_string());
    }
  }

  sqlx::query(
    r#"
    INSERT INTO chat_sessions (
      session_id, collection_name, started_at, ended_at,
      message_count, user_message_count, assistant_message_count,
      total_response_time_ms, avg_response_time_ms, has_error,
      min_retrieval_score, llm_model, reasoning_level
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (session_id) DO UPDATE SET
      message_count = excluded.message_count,
      user_message_count = excluded.user_message_count,
      assistant_message_count = excluded.assistant_message_count,
      total_response_time_ms = excluded.total_response_time_ms,
      avg_response_time_ms = excluded.avg_response_time_ms,
      has_error = excluded.has_error,
      min_retrieval_score = excluded.min_retrieval_score
    "#,
  )
  .bind(&row.session_id)
  .bind(&row.collection_name)
  .bind(&row.started_at)
  .bind(&row.ended_at)
  .bind(row.message_count)
  .bind(row.user_message_count)
  .bind(row.assistant_message_count)
  .bind(row.total_response_time_ms)
  .bind(row.avg_response_time_ms)
  .bind(row.has_error)
  .bind(&row.min_retrieval_score)
  .bind(&row.llm_model)
  .bind(&row.reasoning_level)
  .execute(&mut **tx)
  .await?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn store() -> SessionStore {
    SessionStore::connect("sqlite::memory:").await.unwrap()
  }

  fn update(
    session_id: &str,
    response_time_ms: i64,
    top_scores: &[f32],
    has_error: bool,
  ) -> SessionUpdate {
    let mut u = SessionUpdate::new(session_id, "policies", "gpt-oss-20b", "medium");
    u.response_time_ms = Some(response_time_ms);
    u.top_scores = top_scores.to_vec();
    u.has_error = has_error;
    u
  }

  #[tokio::test]
  async fn session_row_accumulates_turn_metrics() {
    let store = store().await;
    // Turn 1: 1200 ms, scores [0.82, 0.71]; turn 2: 800 ms, [0.55], error.
    store
      .apply_updates(&[update("s1", 1200, &[0.82, 0.71], false)])
      .await;
    store.apply_updates(&[update("s1", 800, &[0.55], true)]).await;

    let row = store.get("s1").await.unwrap().unwrap();
    assert_eq!(row.message_count, 4);
    assert_eq!(row.user_message_count, 2);
    assert_eq!(row.assistant_message_count, 2);
    assert_eq!(row.total_response_time_ms, 2000);
    assert_eq!(row.avg_response_time_ms, 1000);
    assert_eq!(row.has_error, 1);
    assert_eq!(row.min_retrieval_score.as_deref(), Some("0.55"));
  }

  #[tokio::test]
  async fn invariants_hold_after_each_turn() {
    let store = store().await;
    for i in 0..3 {
      store
        .apply_updates(&[update("s2", 100 * (i + 1), &[0.9], false)])
        .await;
      let row = store.get("s2").await.unwrap().unwrap();
      assert_eq!(
        row.message_count,
        row.user_message_count + row.assistant_message_count
      );
      assert_eq!(
        row.avg_response_time_ms,
        row.total_response_time_ms / row.assistant_message_count.max(1)
      );
    }
  }

  #[tokio::test]
  async fn min_score_only_decreases() {
    let store = store().await;
    store.apply_updates(&[update("s3", 100, &[0.5], false)]).await;
    store.apply_updates(&[update("s3", 100, &[0.9], false)]).await;
    let row = store.get("s3").await.unwrap().unwrap();
    assert_eq!(row.min_retrieval_score.as_deref(), Some("0.5"));
  }

  #[tokio::test]
  async fn batch_applies_multiple_sessions() {
    let store = store().await;
    let (applied, errors) = store
      .apply_updates(&[
        update("a", 100, &[0.9], false),
        update("b", 200, &[0.8], false),
      ])
      .await;
    assert_eq!((applied, errors), (2, 0));
    assert!(store.get("a").await.unwrap().is_some());
    assert!(store.get("b").await.unwrap().is_some());
  }
}
