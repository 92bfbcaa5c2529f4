//! Analytics read endpoints and ad-hoc aggregation triggers.

use axum::extract::{Query, State};
use axum::response::Json;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;

use docchat_core::kst;

use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
  #[serde(default)]
  pub collection_name: Option<String>,
  #[serde(default)]
  pub date_from: Option<NaiveDate>,
  #[serde(default)]
  pub date_to: Option<NaiveDate>,
}

pub async fn summary_handler(
  State(state): State<AppState>,
  Query(query): Query<SummaryQuery>,
) -> Json<serde_json::Value> {
  Json(state.stats.summary(
    query.collection_name.as_deref(),
    query.date_from,
    query.date_to,
  ))
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
  #[serde(default)]
  pub collection_name: Option<String>,
  #[serde(default = "default_days")]
  pub days: i64,
}

fn default_days() -> i64 {
  7
}

pub async fn timeline_handler(
  State(state): State<AppState>,
  Query(query): Query<TimelineQuery>,
) -> Json<serde_json::Value> {
  let timeline = state
    .stats
    .timeline(query.collection_name.as_deref(), query.days)
    .await;
  Json(serde_json::json!({ "timeline": timeline }))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
  pub date_from: NaiveDate,
  pub date_to: NaiveDate,
}

pub async fn report_handler(
  State(state): State<AppState>,
  Query(query): Query<ReportQuery>,
) -> Json<serde_json::Value> {
  Json(state.stats.report(query.date_from, query.date_to))
}

#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
  #[serde(default)]
  pub date: Option<NaiveDate>,
}

/// Manual aggregation trigger; defaults to yesterday.
pub async fn aggregate_handler(
  State(state): State<AppState>,
  Query(query): Query<AggregateQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
  let date = query
    .date
    .unwrap_or_else(|| kst::today() - chrono::Duration::days(1));
  info!("manual aggregation requested for {}", kst::format_date(date));
  let outcome = state.stats.aggregate_daily(date).await;
  Ok(Json(serde_json::to_value(outcome).map_err(|e| {
    AppError::AnyError(anyhow::anyhow!("failed to serialize outcome: {e}"))
  })?))
}

/// Logging pipeline counters for dashboards.
pub async fn logging_stats_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
  let stats = state.logging.stats();
  let mut value = serde_json::to_value(&stats).unwrap_or_default();
  value["active_conversations"] =
    serde_json::Value::from(state.conversations.active_count());
  Json(value)
}
