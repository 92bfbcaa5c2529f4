//! Statistics aggregation over the JSONL shard tree.
//!
//! Shards are read in line chunks, corrupt lines are skipped, timestamps
//! are normalized to naive KST, and per-collection rollups (plus the
//! synthetic `ALL` collection) are upserted into `chat_statistics` keyed on
//! `(collection_name, date, hour IS NULL)`. Re-running a date overwrites
//! the same row with identical values.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::Row;
use tracing::{debug, error, info, warn};

use docchat_core::record::MessageType;
use docchat_core::{kst, logpath, InteractionRecord};

use crate::error::AnalyticsError;
use crate::retention::read_lines;
use crate::sessions::SessionStore;

pub const ALL_COLLECTIONS: &str = "ALL";
const TOP_QUERIES: usize = 10;
const SUMMARY_TOP_QUERIES: usize = 20;

/// `ALL`, empty and missing collection names all mean "no filter".
pub fn normalize_collection(collection_name: Option<&str>) -> Option<String> {
  match collection_name {
    None | Some("") | Some(ALL_COLLECTIONS) => None,
    Some(name) => Some(name.to_string()),
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStatus {
  Success,
  NoData,
  Empty,
  Error,
}

#[derive(Debug, Serialize)]
pub struct AggregationOutcome {
  pub date: String,
  pub status: AggregationStatus,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub collections: Vec<CollectionRollup>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionRollup {
  pub stat_id: String,
  pub collection_name: String,
  pub date: String,
  pub hour: Option<i64>,
  pub total_queries: i64,
  pub unique_sessions: i64,
  pub total_tokens: i64,
  pub error_count: i64,
  pub avg_response_time_ms: f64,
  pub p50_response_time_ms: Option<f64>,
  pub p95_response_time_ms: Option<f64>,
  pub p99_response_time_ms: Option<f64>,
  pub max_response_time_ms: Option<f64>,
  pub avg_retrieval_time_ms: f64,
  pub avg_retrieval_score: Option<f64>,
  pub avg_retrieved_count: f64,
  pub reranking_usage_count: i64,
  pub top_queries: Vec<String>,
  pub model_usage: HashMap<String, i64>,
  pub reasoning_distribution: HashMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct BackfillOutcome {
  pub status: &'static str,
  pub processed: usize,
  pub remaining: usize,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub results: Vec<Value>,
}

/// Linear-interpolation percentile over an unsorted sample (`q` in [0, 1]).
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
  if values.is_empty() {
    return None;
  }
  let mut sorted = values.to_vec();
  sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
  let position = q * (sorted.len() - 1) as f64;
  let lower = position.floor() as usize;
  let upper = position.ceil() as usize;
  if lower == upper {
    return Some(sorted[lower]);
  }
  let fraction = position - lower as f64;
  Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Incremental per-collection aggregation state. Base counts come from user
/// messages; token sums and latency stats from assistant messages, with
/// zero response times excluded.
#[derive(Default)]
struct Accumulator {
  total_queries: i64,
  sessions: HashSet<String>,
  total_tokens: i64,
  error_count: i64,
  response_times: Vec<f64>,
  retrieval_times: Vec<f64>,
  retrieval_scores: Vec<f64>,
  retrieved_counts: Vec<f64>,
  reranking_usage_count: i64,
  query_counts: HashMap<String, i64>,
  model_usage: HashMap<String, i64>,
  reasoning_distribution: HashMap<String, i64>,
}

impl Accumulator {
  fn feed(&mut self, record: &InteractionRecord) {
    self.sessions.insert(record.session_id.clone());
    if record.error_info.is_some() {
      self.error_count += 1;
    }

    match record.message_type {
      MessageType::User => {
        self.total_queries += 1;
        if !record.message_content.is_empty() {
          *self
            .query_counts
            .entry(record.message_content.clone())
            .or_insert(0) += 1;
        }
        if let Some(model) = record.llm_model.as_ref().filter(|m| !m.is_empty()) {
          *self.model_usage.entry(model.clone()).or_insert(0) += 1;
        }
        if let Some(level) = record.reasoning_level.as_ref().filter(|l| !l.is_empty()) {
          *self.reasoning_distribution.entry(level.clone()).or_insert(0) += 1;
        }
      }
      MessageType::Assistant => {
        if let Some(performance) = &record.performance {
          self.total_tokens += performance.token_count;
          if performance.response_time_ms > 0 {
            self.response_times.push(performance.response_time_ms as f64);
          }
        }
        if let Some(retrieval) = &record.retrieval_info {
          if let Some(ms) = retrieval.retrieval_time_ms {
            self.retrieval_times.push(ms as f64);
          }
          for score in &retrieval.top_scores {
            self.retrieval_scores.push(*score as f64);
          }
          self.retrieved_counts.push(retrieval.retrieved_count as f64);
          if retrieval.reranking_used == Some(true) {
            self.reranking_usage_count += 1;
          }
        }
      }
    }
  }

  fn into_rollup(self, collection_name: &str, date: NaiveDate) -> CollectionRollup {
    let mean = |values: &[f64]| -> Option<f64> {
      if values.is_empty() {
        None
      } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
      }
    };

    let mut top: Vec<(String, i64)> = self.query_counts.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top_queries = top.into_iter().take(TOP_QUERIES).map(|(q, _)| q).collect();

    CollectionRollup {
      stat_id: uuid::Uuid::new_v4().to_string(),
      collection_name: collection_name.to_string(),
      date: kst::format_date(date),
      hour: None,
      total_queries: self.total_queries,
      unique_sessions: self.sessions.len() as i64,
      total_tokens: self.total_tokens,
      error_count: self.error_count,
      avg_response_time_ms: mean(&self.response_times).unwrap_or(0.0),
      p50_response_time_ms: percentile(&self.response_times, 0.50),
      p95_response_time_ms: percentile(&self.response_times, 0.95),
      p99_response_time_ms: percentile(&self.response_times, 0.99),
      max_response_time_ms: self
        .response_times
        .iter()
        .copied()
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v)))),
      avg_retrieval_time_ms: mean(&self.retrieval_times).unwrap_or(0.0),
      avg_retrieval_score: mean(&self.retrieval_scores),
      avg_retrieved_count: mean(&self.retrieved_counts).unwrap_or(0.0),
      reranking_usage_count: self.reranking_usage_count,
      top_queries,
      model_usage: self.model_usage,
      reasoning_distribution: self.reasoning_distribution,
    }
  }
}

pub struct StatisticsService {
  log_dir: PathBuf,
  sessions: SessionStore,
  chunk_size: usize,
  large_file_threshold: usize,
}

impl StatisticsService {
  pub fn new(
    log_dir: impl Into<PathBuf>,
    sessions: SessionStore,
    chunk_size: usize,
    large_file_threshold: usize,
  ) -> Self {
    Self {
      log_dir: log_dir.into(),
      sessions,
      chunk_size,
      large_file_threshold,
    }
  }

  /// Reads one shard into records, skipping corrupt lines. `created_at` is
  /// normalized to naive KST in place.
  fn read_shard(&self, path: &std::path::Path) -> Vec<InteractionRecord> {
    let lines = match read_lines(path) {
      Ok(lines) => lines,
      Err(e) => {
        error!("failed to read shard {}: {e}", path.display());
        return Vec::new();
      }
    };

    if lines.len() > self.large_file_threshold {
      warn!(
        "large log shard: {} ({} lines), chunk size {}",
        path.display(),
        lines.len(),
        if self.chunk_size > 0 { self.chunk_size.to_string() } else { "full load".to_string() }
      );
    }

    let chunk = if self.chunk_size > 0 { self.chunk_size } else { lines.len().max(1) };
    let mut records = Vec::with_capacity(lines.len());
    let mut processed = 0usize;
    for chunk_lines in lines.chunks(chunk) {
      for line in chunk_lines {
        if line.trim().is_empty() {
          continue;
        }
        match serde_json::from_str::<InteractionRecord>(line) {
          Ok(mut record) => {
            if let Some(normalized) = kst::parse_created_at(&record.created_at) {
              record.created_at = normalized.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
            }
            records.push(record);
          }
          Err(e) => error!("JSON parse error, line skipped: {e}"),
        }
      }
      processed += chunk_lines.len();
      debug!("chunk processed: {processed} lines");
    }
    records
  }

  /// Daily aggregation for one date; idempotent.
  pub async fn aggregate_daily(&self, target_date: NaiveDate) -> AggregationOutcome {
    let date_str = kst::format_date(target_date);
    let Some(path) = logpath::find_file_for_date(&self.log_dir, target_date, "") else {
      warn!("no log shard for {date_str}");
      return AggregationOutcome {
        date: date_str,
        status: AggregationStatus::NoData,
        collections: Vec::new(),
        error: None,
      };
    };

    let records = self.read_shard(&path);
    if records.is_empty() {
      warn!("empty log shard: {}", path.display());
      return AggregationOutcome {
        date: date_str,
        status: AggregationStatus::Empty,
        collections: Vec::new(),
        error: None,
      };
    }

    let mut per_collection: HashMap<String, Accumulator> = HashMap::new();
    let mut all = Accumulator::default();
    for record in &records {
      per_collection
        .entry(record.collection_name.clone())
        .or_default()
        .feed(record);
      all.feed(record);
    }

    let mut rollups: Vec<CollectionRollup> = per_collection
      .into_iter()
      .map(|(name, acc)| acc.into_rollup(&name, target_date))
      .collect();
    rollups.sort_by(|a, b| a.collection_name.cmp(&b.collection_name));
    rollups.push(all.into_rollup(ALL_COLLECTIONS, target_date));

    for rollup in &rollups {
      if let Err(e) = self.save_rollup(rollup).await {
        error!("failed to save statistics: {e}");
        return AggregationOutcome {
          date: rollup.date.clone(),
          status: AggregationStatus::Error,
          collections: Vec::new(),
          error: Some(e.to_string()),
        };
      }
    }

    info!("daily statistics aggregated for {}", kst::format_date(target_date));
    AggregationOutcome {
      date: kst::format_date(target_date),
      status: AggregationStatus::Success,
      collections: rollups,
      error: None,
    }
  }

  /// Hourly tick: re-aggregates today's daily row to keep dashboards live.
  pub async fn aggregate_hourly(&self) -> AggregationOutcome {
    self.aggregate_daily(kst::today()).await
  }

  /// Upsert keyed on `(collection_name, date, hour IS NULL)`. SQLite treats
  /// NULLs as distinct in unique indexes, so the existence probe is explicit
  /// rather than `ON CONFLICT`.
  async fn save_rollup(&self, rollup: &CollectionRollup) -> Result<(), AnalyticsError> {
    let pool = self.sessions.pool();
    let now = kst::now_naive().format("%Y-%m-%d %H:%M:%S").to_string();
    let top_queries = serde_json::to_string(&rollup.top_queries)?;
    let model_usage = serde_json::to_string(&rollup.model_usage)?;
    let reasoning = serde_json::to_string(&rollup.reasoning_distribution)?;

    let existing: Option<String> = sqlx::query_scalar(
      "SELECT stat_id FROM chat_statistics WHERE collection_name = ? AND date = ? AND hour IS NULL",
    )
    .bind(&rollup.collection_name)
    .bind(&rollup.date)
    .fetch_optional(pool)
    .await?;

    match existing {
      Some(stat_id) => {
        sqlx::query(
          r#"
          UPDATE chat_statistics SET
            total_queries = ?, unique_sessions = ?, total_tokens = ?, error_count = ?,
            avg_response_time_ms = ?, p50_response_time_ms = ?, p95_response_time_ms = ?,
            p99_response_time_ms = ?, max_response_time_ms = ?,
            avg_retrieval_time_ms = ?, avg_retrieval_score = ?, avg_retrieved_count = ?,
            reranking_usage_count = ?, top_queries = ?, model_usage = ?,
            reasoning_distribution = ?, updated_at = ?
          WHERE stat_id = ?
          "#,
        )
        .bind(rollup.total_queries)
        .bind(rollup.unique_sessions)
        .bind(rollup.total_tokens)
        .bind(rollup.error_count)
        .bind(rollup.avg_response_time_ms)
        .bind(rollup.p50_response_time_ms)
        .bind(rollup.p95_response_time_ms)
        .bind(rollup.p99_response_time_ms)
        .bind(rollup.max_response_time_ms)
        .bind(rollup.avg_retrieval_time_ms)
        .bind(rollup.avg_retrieval_score)
        .bind(rollup.avg_retrieved_count)
        .bind(rollup.reranking_usage_count)
        .bind(&top_queries)
        .bind(&model_usage)
        .bind(&reasoning)
        .bind(&now)
        .bind(&stat_id)
        .execute(pool)
        .await?;
        debug!("statistics updated: {} - {}", rollup.collection_name, rollup.date);
      }
      None => {
        sqlx::query(
          r#"
          INSERT INTO chat_statistics (
            stat_id, collection_name, date, hour,
            total_queries, unique_sessions, total_tokens, error_count,
            avg_response_time_ms, p50_response_time_ms, p95_response_time_ms,
            p99_response_time_ms, max_response_time_ms,
            avg_retrieval_time_ms, avg_retrieval_score, avg_retrieved_count,
            reranking_usage_count, top_queries, model_usage,
            reasoning_distribution, created_at, updated_at
          ) VALUES (?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
          "#,
        )
        .bind(&rollup.stat_id)
        .bind(&rollup.collection_name)
        .bind(&rollup.date)
        .bind(rollup.total_queries)
        .bind(rollup.unique_sessions)
        .bind(rollup.total_tokens)
        .bind(rollup.error_count)
        .bind(rollup.avg_response_time_ms)
        .bind(rollup.p50_response_time_ms)
        .bind(rollup.p95_response_time_ms)
        .bind(rollup.p99_response_time_ms)
        .bind(rollup.max_response_time_ms)
        .bind(rollup.avg_retrieval_time_ms)
        .bind(rollup.avg_retrieval_score)
        .bind(rollup.avg_retrieved_count)
        .bind(rollup.reranking_usage_count)
        .bind(&top_queries)
        .bind(&model_usage)
        .bind(&reasoning)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await?;
        debug!("statistics created: {} - {}", rollup.collection_name, rollup.date);
      }
    }
    Ok(())
  }

  /// Dates up to yesterday where a shard exists but no daily row does,
  /// oldest first.
  pub async fn find_missing_dates(&self, days_back: i64) -> Vec<NaiveDate> {
    let end_date = kst::today() - Duration::days(1);
    let start_date = end_date - Duration::days(days_back - 1);
    let existing: HashSet<String> = match self
      .sessions
      .dates_with_daily_stats(&kst::format_date(start_date), &kst::format_date(end_date))
      .await
    {
      Ok(dates) => dates.into_iter().collect(),
      Err(e) => {
        error!("missing-date probe failed: {e}");
        return Vec::new();
      }
    };

    let mut missing = Vec::new();
    let mut current = start_date;
    while current <= end_date {
      if !existing.contains(&kst::format_date(current))
        && logpath::find_file_for_date(&self.log_dir, current, "").is_some()
      {
        missing.push(current);
      }
      current += Duration::days(1);
    }
    if !missing.is_empty() {
      info!(
        "missing statistics detected: {} dates ({} ~ {})",
        missing.len(),
        kst::format_date(missing[0]),
        kst::format_date(*missing.last().expect("non-empty"))
      );
    }
    missing
  }

  /// Processes up to `max_dates` missing dates, oldest first.
  pub async fn backfill(&self, max_dates: usize, days_back: i64) -> BackfillOutcome {
    let missing = self.find_missing_dates(days_back).await;
    if missing.is_empty() {
      debug!("no missing statistics");
      return BackfillOutcome {
        status: "no_missing",
        processed: 0,
        remaining: 0,
        results: Vec::new(),
      };
    }

    let to_process: Vec<NaiveDate> = missing.iter().copied().take(max_dates).collect();
    let remaining = missing.len() - to_process.len();
    let mut results = Vec::new();
    for date in &to_process {
      info!("backfilling statistics for {}", kst::format_date(*date));
      let outcome = self.aggregate_daily(*date).await;
      results.push(json!({ "date": outcome.date, "status": outcome.status }));
    }

    info!("backfill progress: {} processed, {remaining} remaining", to_process.len());
    BackfillOutcome {
      status: "success",
      processed: to_process.len(),
      remaining,
      results,
    }
  }

  /// All records in a date range, optionally filtered by collection
  /// (`ALL` / empty mean no filter).
  pub fn query_logs_by_date_range(
    &self,
    start_date: NaiveDate,
    end_date: NaiveDate,
    collection_name: Option<&str>,
  ) -> Vec<InteractionRecord> {
    let filter = normalize_collection(collection_name);
    let mut records = Vec::new();
    let mut current = start_date;
    while current <= end_date {
      if let Some(path) = logpath::find_file_for_date(&self.log_dir, current, "") {
        let mut day_records = self.read_shard(&path);
        if let Some(filter) = &filter {
          day_records.retain(|r| &r.collection_name == filter);
        }
        records.extend(day_records);
      }
      current += Duration::days(1);
    }
    records
  }

  /// Summary over a date range, computed straight from the shards so
  /// unique-session counts do not double across days.
  pub fn summary(
    &self,
    collection_name: Option<&str>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
  ) -> Value {
    let date_to = date_to.unwrap_or_else(kst::today);
    let date_from = date_from.unwrap_or(date_to - Duration::days(7));
    let records = self.query_logs_by_date_range(date_from, date_to, collection_name);

    let period = json!({
      "from": kst::format_date(date_from),
      "to": kst::format_date(date_to),
      "days": (date_to - date_from).num_days() + 1,
    });

    if records.is_empty() {
      return json!({
        "total_queries": 0,
        "unique_sessions": 0,
        "total_tokens": 0,
        "error_count": 0,
        "avg_response_time_ms": 0,
        "period": period,
        "collections": normalize_collection(collection_name).map(|c| vec![c]).unwrap_or_default(),
        "top_queries": [],
      });
    }

    let mut acc = Accumulator::default();
    let mut collections: Vec<String> = Vec::new();
    for record in &records {
      acc.feed(record);
      if !record.collection_name.is_empty() && !collections.contains(&record.collection_name) {
        collections.push(record.collection_name.clone());
      }
    }

    let mut top: Vec<(String, i64)> = acc.query_counts.clone().into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top_queries: Vec<String> = top
      .into_iter()
      .take(SUMMARY_TOP_QUERIES)
      .map(|(q, _)| q)
      .collect();
    let avg_response_time = if acc.response_times.is_empty() {
      0.0
    } else {
      acc.response_times.iter().sum::<f64>() / acc.response_times.len() as f64
    };

    json!({
      "total_queries": acc.total_queries,
      "unique_sessions": acc.sessions.len(),
      "total_tokens": acc.total_tokens,
      "error_count": acc.error_count,
      "avg_response_time_ms": avg_response_time,
      "period": period,
      "collections": collections,
      "top_queries": top_queries,
    })
  }

  /// One row per day in the window, zeros for missing days. A concrete
  /// collection prefers the statistics table; `ALL`/none computes from the
  /// shards directly.
  pub async fn timeline(&self, collection_name: Option<&str>, days: i64) -> Vec<Value> {
    let end_date = kst::today();
    let start_date = end_date - Duration::days(days);

    if let Some(collection) = normalize_collection(collection_name) {
      match self.timeline_from_table(&collection, start_date, end_date).await {
        Ok(rows) if !rows.is_empty() => return rows,
        Ok(_) => {}
        Err(e) => error!("timeline query failed, falling back to shards: {e}"),
      }
      return self.timeline_from_logs(Some(&collection), start_date, end_date);
    }
    self.timeline_from_logs(None, start_date, end_date)
  }

  async fn timeline_from_table(
    &self,
    collection: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
  ) -> Result<Vec<Value>, AnalyticsError> {
    let rows = sqlx::query(
      r#"
      SELECT date, total_queries, unique_sessions, avg_response_time_ms, error_count
      FROM chat_statistics
      WHERE collection_name = ? AND date >= ? AND date <= ? AND hour IS NULL
      ORDER BY date
      "#,
    )
    .bind(collection)
    .bind(kst::format_date(start_date))
    .bind(kst::format_date(end_date))
    .fetch_all(self.sessions.pool())
    .await?;

    Ok(
      rows
        .into_iter()
        .map(|row| {
          json!({
            "date": row.get::<String, _>("date"),
            "hour": Value::Null,
            "queries": row.get::<i64, _>("total_queries"),
            "sessions": row.get::<i64, _>("unique_sessions"),
            "avg_response_time": row.get::<f64, _>("avg_response_time_ms"),
            "errors": row.get::<i64, _>("error_count"),
          })
        })
        .collect(),
    )
  }

  fn timeline_from_logs(
    &self,
    collection: Option<&str>,
    start_date: NaiveDate,
    end_date: NaiveDate,
  ) -> Vec<Value> {
    let records = self.query_logs_by_date_range(start_date, end_date, collection);
    let mut by_day: HashMap<String, Accumulator> = HashMap::new();
    for record in &records {
      let Some(created) = kst::parse_created_at(&record.created_at) else {
        continue;
      };
      by_day
        .entry(kst::format_date(created.date()))
        .or_default()
        .feed(record);
    }

    let mut timeline = Vec::new();
    let mut current = start_date;
    while current <= end_date {
      let key = kst::format_date(current);
      let entry = by_day.get(&key);
      let avg_response_time = entry
        .map(|acc| {
          if acc.response_times.is_empty() {
            0.0
          } else {
            acc.response_times.iter().sum::<f64>() / acc.response_times.len() as f64
          }
        })
        .unwrap_or(0.0);
      timeline.push(json!({
        "date": key,
        "hour": Value::Null,
        "queries": entry.map(|a| a.total_queries).unwrap_or(0),
        "sessions": entry.map(|a| a.sessions.len()).unwrap_or(0),
        "avg_response_time": avg_response_time,
        "errors": entry.map(|a| a.error_count).unwrap_or(0),
      }));
      current += Duration::days(1);
    }
    timeline
  }

  /// Comprehensive report: overview, latency percentiles, retrieval
  /// quality, hourly usage distribution and per-collection counts.
  pub fn report(&self, date_from: NaiveDate, date_to: NaiveDate) -> Value {
    let records = self.query_logs_by_date_range(date_from, date_to, None);
    let period = json!({
      "from": kst::format_date(date_from),
      "to": kst::format_date(date_to),
      "days": (date_to - date_from).num_days() + 1,
    });
    if records.is_empty() {
      return json!({ "status": "no_data", "period": period });
    }

    let user_count = records
      .iter()
      .filter(|r| r.message_type == MessageType::User)
      .count();
    let sessions: HashSet<&str> = records.iter().map(|r| r.session_id.as_str()).collect();
    let collections: HashSet<&str> = records
      .iter()
      .map(|r| r.collection_name.as_str())
      .filter(|c| !c.is_empty())
      .collect();

    let response_times: Vec<f64> = records
      .iter()
      .filter_map(|r| r.performance.as_ref())
      .map(|p| p.response_time_ms as f64)
      .filter(|ms| *ms > 0.0)
      .collect();
    let performance = if response_times.is_empty() {
      json!({})
    } else {
      json!({
        "avg_response_time_ms": response_times.iter().sum::<f64>() / response_times.len() as f64,
        "median_response_time_ms": percentile(&response_times, 0.50),
        "p95_response_time_ms": percentile(&response_times, 0.95),
        "p99_response_time_ms": percentile(&response_times, 0.99),
      })
    };

    let scores: Vec<f64> = records
      .iter()
      .filter_map(|r| r.retrieval_info.as_ref())
      .flat_map(|info| info.top_scores.iter().map(|s| *s as f64))
      .collect();
    let quality = if scores.is_empty() {
      json!({})
    } else {
      let low = scores.iter().filter(|s| **s < 0.5).count() as f64 / scores.len() as f64;
      json!({
        "avg_retrieval_score": scores.iter().sum::<f64>() / scores.len() as f64,
        "low_score_ratio": low,
      })
    };

    let mut hourly: HashMap<u32, i64> = HashMap::new();
    for record in &records {
      if let Some(created) = kst::parse_created_at(&record.created_at) {
        use chrono::Timelike;
        *hourly.entry(created.hour()).or_insert(0) += 1;
      }
    }
    let hourly_distribution: HashMap<String, i64> =
      hourly.into_iter().map(|(h, c)| (h.to_string(), c)).collect();

    let mut per_collection: HashMap<String, (i64, HashSet<&str>)> = HashMap::new();
    for record in records.iter().filter(|r| r.message_type == MessageType::User) {
      let entry = per_collection
        .entry(record.collection_name.clone())
        .or_default();
      entry.0 += 1;
      entry.1.insert(record.session_id.as_str());
    }
    let collections_breakdown: HashMap<String, Value> = per_collection
      .into_iter()
      .map(|(name, (queries, sessions))| {
        (
          name,
          json!({ "total_queries": queries, "unique_sessions": sessions.len() }),
        )
      })
      .collect();

    json!({
      "period": period,
      "overview": {
        "total_queries": user_count,
        "unique_sessions": sessions.len(),
        "unique_collections": collections.len(),
      },
      "performance": performance,
      "quality": quality,
      "usage_patterns": { "hourly_distribution": hourly_distribution },
      "collections": collections_breakdown,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use docchat_core::record::{Performance, RetrievalInfo};
  use tempfile::tempdir;

  fn record(
    session: &str,
    collection: &str,
    message_type: MessageType,
    response_time_ms: i64,
    token_count: i64,
    top_scores: &[f32],
    created_at: &str,
  ) -> InteractionRecord {
    let mut r = InteractionRecord::new(session, collection, message_type, "환불 규정 질문");
    r.created_at = created_at.to_string();
    r.llm_model = Some("gpt-oss-20b".to_string());
    r.reasoning_level = Some("medium".to_string());
    if message_type == MessageType::Assistant {
      r.performance = Some(Performance {
        response_time_ms,
        token_count,
        retrieval_time_ms: Some(100),
      });
      r.retrieval_info = Some(RetrievalInfo {
        retrieved_count: top_scores.len(),
        top_scores: top_scores.to_vec(),
        retrieval_time_ms: Some(100),
        reranking_used: Some(true),
      });
    }
    r
  }

  fn write_shard(dir: &std::path::Path, date: NaiveDate, records: &[InteractionRecord]) {
    let subdir = logpath::ensure_date_directory(dir, date).unwrap();
    let path = subdir.join(format!("{}.jsonl", kst::format_date(date)));
    let lines: Vec<String> = records
      .iter()
      .map(|r| serde_json::to_string(r).unwrap())
      .collect();
    std::fs::write(path, lines.join("\n") + "\n").unwrap();
  }

  async fn service(dir: &std::path::Path) -> StatisticsService {
    let sessions = SessionStore::connect("sqlite::memory:").await.unwrap();
    StatisticsService::new(dir, sessions, 2, 100_000)
  }

  #[test]
  fn percentiles_interpolate_linearly() {
    // Samples [100, 200, 300, 400, 500, 1000].
    let values = vec![100.0, 200.0, 300.0, 400.0, 500.0, 1000.0];
    assert_eq!(percentile(&values, 0.50), Some(350.0));
    assert_eq!(percentile(&values, 0.95), Some(875.0));
    assert!((percentile(&values, 0.99).unwrap() - 975.0).abs() < 1e-9);
    assert_eq!(percentile(&[], 0.5), None);
  }

  #[tokio::test]
  async fn daily_aggregation_computes_rollups() {
    let tmp = tempdir().unwrap();
    let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
    let ts = "2025-03-10T10:00:00";
    let mut records = Vec::new();
    for (i, rt) in [100i64, 200, 300, 400, 500, 1000].iter().enumerate() {
      records.push(record(&format!("s{i}"), "X", MessageType::User, 0, 0, &[], ts));
      records.push(record(
        &format!("s{i}"),
        "X",
        MessageType::Assistant,
        *rt,
        50,
        &[0.8, 0.7],
        ts,
      ));
    }
    // A zero response time must be excluded from latency stats.
    records.push(record("s9", "X", MessageType::Assistant, 0, 10, &[0.6], ts));
    write_shard(tmp.path(), date, &records);

    let service = service(tmp.path()).await;
    let outcome = service.aggregate_daily(date).await;
    assert_eq!(outcome.status, AggregationStatus::Success);

    let x = outcome
      .collections
      .iter()
      .find(|r| r.collection_name == "X")
      .unwrap();
    assert_eq!(x.total_queries, 6);
    assert_eq!(x.p50_response_time_ms, Some(350.0));
    assert_eq!(x.p95_response_time_ms, Some(875.0));
    assert!((x.p99_response_time_ms.unwrap() - 975.0).abs() < 1e-9);
    assert_eq!(x.max_response_time_ms, Some(1000.0));
    assert_eq!(x.total_tokens, 6 * 50 + 10);
    assert_eq!(x.reranking_usage_count, 7);
    assert_eq!(x.model_usage["gpt-oss-20b"], 6);

    let all = outcome
      .collections
      .iter()
      .find(|r| r.collection_name == ALL_COLLECTIONS)
      .unwrap();
    assert_eq!(all.total_queries, 6);
  }

  #[tokio::test]
  async fn aggregation_is_idempotent() {
    let tmp = tempdir().unwrap();
    let date = NaiveDate::from_ymd_opt(2025, 3, 11).unwrap();
    let ts = "2025-03-11T09:00:00";
    write_shard(
      tmp.path(),
      date,
      &[
        record("s1", "X", MessageType::User, 0, 0, &[], ts),
        record("s1", "X", MessageType::Assistant, 250, 40, &[0.9], ts),
      ],
    );
    let service = service(tmp.path()).await;
    service.aggregate_daily(date).await;
    service.aggregate_daily(date).await;

    let count: i64 = sqlx::query_scalar(
      "SELECT COUNT(*) FROM chat_statistics WHERE collection_name = 'X' AND date = '2025-03-11' AND hour IS NULL",
    )
    .fetch_one(service.sessions.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);

    let queries: i64 = sqlx::query_scalar(
      "SELECT total_queries FROM chat_statistics WHERE collection_name = 'X' AND date = '2025-03-11'",
    )
    .fetch_one(service.sessions.pool())
    .await
    .unwrap();
    assert_eq!(queries, 1);
  }

  #[tokio::test]
  async fn corrupt_lines_are_skipped() {
    let tmp = tempdir().unwrap();
    let date = NaiveDate::from_ymd_opt(2025, 3, 12).unwrap();
    let subdir = logpath::ensure_date_directory(tmp.path(), date).unwrap();
    let good = serde_json::to_string(&record(
      "s1",
      "X",
      MessageType::User,
      0,
      0,
      &[],
      "2025-03-12T08:00:00",
    ))
    .unwrap();
    std::fs::write(
      subdir.join("2025-03-12.jsonl"),
      format!("{good}\nnot json at all\n{good}\n"),
    )
    .unwrap();

    let service = service(tmp.path()).await;
    let outcome = service.aggregate_daily(date).await;
    assert_eq!(outcome.status, AggregationStatus::Success);
    let all = outcome
      .collections
      .iter()
      .find(|r| r.collection_name == ALL_COLLECTIONS)
      .unwrap();
    assert_eq!(all.total_queries, 2);
  }

  #[tokio::test]
  async fn missing_shard_reports_no_data() {
    let tmp = tempdir().unwrap();
    let service = service(tmp.path()).await;
    let outcome = service
      .aggregate_daily(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
      .await;
    assert_eq!(outcome.status, AggregationStatus::NoData);
  }

  #[tokio::test]
  async fn backfill_converges_and_reports_remaining() {
    let tmp = tempdir().unwrap();
    let service = service(tmp.path()).await;
    // Shards for D-3, D-2, D-1; no statistics rows yet.
    for back in 1..=3 {
      let date = kst::today() - Duration::days(back);
      let ts = format!("{}T10:00:00", kst::format_date(date));
      write_shard(
        tmp.path(),
        date,
        &[
          record("s1", "X", MessageType::User, 0, 0, &[], &ts),
          record("s1", "X", MessageType::Assistant, 100, 10, &[0.9], &ts),
        ],
      );
    }

    assert_eq!(service.find_missing_dates(30).await.len(), 3);

    // max_dates = 1 per tick: three ticks to converge, then no_missing.
    for expected_remaining in [2usize, 1, 0] {
      let outcome = service.backfill(1, 30).await;
      assert_eq!(outcome.status, "success");
      assert_eq!(outcome.processed, 1);
      assert_eq!(outcome.remaining, expected_remaining);
    }
    let outcome = service.backfill(1, 30).await;
    assert_eq!(outcome.status, "no_missing");

    // Each shard date now has rows for the collection and ALL.
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_statistics")
      .fetch_one(service.sessions.pool())
      .await
      .unwrap();
    assert_eq!(rows, 6);
  }

  #[tokio::test]
  async fn timeline_zero_fills_missing_days() {
    let tmp = tempdir().unwrap();
    let service = service(tmp.path()).await;
    let date = kst::today() - Duration::days(1);
    let ts = format!("{}T10:00:00", kst::format_date(date));
    write_shard(
      tmp.path(),
      date,
      &[record("s1", "X", MessageType::User, 0, 0, &[], &ts)],
    );

    let timeline = service.timeline(None, 3).await;
    assert_eq!(timeline.len(), 4);
    let with_data: Vec<&Value> = timeline
      .iter()
      .filter(|d| d["queries"].as_i64() == Some(1))
      .collect();
    assert_eq!(with_data.len(), 1);
    assert!(timeline.iter().any(|d| d["queries"].as_i64() == Some(0)));
  }

  #[tokio::test]
  async fn summary_counts_from_shards() {
    let tmp = tempdir().unwrap();
    let service = service(tmp.path()).await;
    let date = kst::today();
    let ts = format!("{}T11:00:00", kst::format_date(date));
    write_shard(
      tmp.path(),
      date,
      &[
        record("s1", "X", MessageType::User, 0, 0, &[], &ts),
        record("s1", "X", MessageType::Assistant, 300, 20, &[0.9], &ts),
        record("s2", "Y", MessageType::User, 0, 0, &[], &ts),
      ],
    );

    let summary = service.summary(None, Some(date), Some(date));
    assert_eq!(summary["total_queries"], 2);
    assert_eq!(summary["unique_sessions"], 2);
    assert_eq!(summary["total_tokens"], 20);
    // "ALL" behaves exactly like no filter.
    let all = service.summary(Some(ALL_COLLECTIONS), Some(date), Some(date));
    assert_eq!(all["total_queries"], 2);
    let only_x = service.summary(Some("X"), Some(date), Some(date));
    assert_eq!(only_x["total_queries"], 1);
  }

  #[tokio::test]
  async fn tz_aware_timestamps_normalize_to_kst_dates() {
    let tmp = tempdir().unwrap();
    let service = service(tmp.path()).await;
    let date = kst::today();
    // 23:30 UTC the previous day is 08:30 KST on `date`.
    let utc_ts = format!(
      "{}T23:30:00+00:00",
      kst::format_date(date - Duration::days(1))
    );
    write_shard(
      tmp.path(),
      date,
      &[record("s1", "X", MessageType::User, 0, 0, &[], &utc_ts)],
    );
    let timeline = service.timeline(None, 0).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0]["queries"], 1);
  }
}
