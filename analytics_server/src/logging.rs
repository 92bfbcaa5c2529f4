//! Hybrid logging pipeline: bounded queues, batched writers, overflow and
//! emergency paths.
//!
//! The request path only ever uses `try_send`; a full queue spills to the
//! overflow file instead of blocking the answer. The log batcher is the
//! sole writer to a daily shard within one process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docchat_core::{kst, logpath, InteractionRecord, SessionUpdate};

use crate::sessions::SessionStore;

const BACKPRESSURE_THRESHOLD: f64 = 0.8;
const SESSION_BATCH_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LoggingConfig {
  pub queue_size: usize,
  pub session_queue_size: usize,
  pub batch_size: usize,
  pub session_batch_size: usize,
  pub flush_interval: Duration,
  pub data_dir: PathBuf,
  pub overflow_dir: PathBuf,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      queue_size: 1000,
      session_queue_size: 500,
      batch_size: 20,
      session_batch_size: 50,
      flush_interval: Duration::from_secs(5),
      data_dir: PathBuf::from("logs/data"),
      overflow_dir: PathBuf::from("logs/overflow"),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingStats {
  pub log_queue_size: usize,
  pub log_queue_capacity: usize,
  pub session_queue_size: usize,
  pub session_queue_capacity: usize,
  pub dropped_count: u64,
  pub overflow_count: u64,
  pub session_update_count: u64,
  pub session_update_errors: u64,
  pub running: bool,
}

#[derive(Default)]
struct Counters {
  dropped: AtomicU64,
  overflow: AtomicU64,
  session_updated: AtomicU64,
  session_errors: AtomicU64,
}

pub struct LoggingPipeline {
  config: LoggingConfig,
  log_tx: mpsc::Sender<InteractionRecord>,
  log_rx: Arc<Mutex<mpsc::Receiver<InteractionRecord>>>,
  session_tx: mpsc::Sender<SessionUpdate>,
  session_rx: Arc<Mutex<mpsc::Receiver<SessionUpdate>>>,
  sessions: SessionStore,
  counters: Counters,
  running: AtomicBool,
  cancel: std::sync::Mutex<CancellationToken>,
  handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl LoggingPipeline {
  pub fn new(config: LoggingConfig, sessions: SessionStore) -> Arc<Self> {
    std::fs::create_dir_all(&config.data_dir).ok();
    std::fs::create_dir_all(&config.overflow_dir).ok();

    let (log_tx, log_rx) = mpsc::channel(config.queue_size);
    let (session_tx, session_rx) = mpsc::channel(config.session_queue_size);
    Arc::new(Self {
      config,
      log_tx,
      log_rx: Arc::new(Mutex::new(log_rx)),
      session_tx,
      session_rx: Arc::new(Mutex::new(session_rx)),
      sessions,
      counters: Counters::default(),
      running: AtomicBool::new(false),
      cancel: std::sync::Mutex::new(CancellationToken::new()),
      handles: std::sync::Mutex::new(Vec::new()),
    })
  }

  /// Launches the log and session batchers.
  pub fn start(self: &Arc<Self>) {
    if self.running.swap(true, Ordering::SeqCst) {
      return;
    }
    let token = CancellationToken::new();
    *self.cancel.lock().expect("cancel lock") = token.clone();

    let log_worker = tokio::spawn(Arc::clone(self).log_worker(token.clone()));
    let session_worker = tokio::spawn(Arc::clone(self).session_worker(token));
    let mut handles = self.handles.lock().expect("handles lock");
    handles.push(log_worker);
    handles.push(session_worker);
    info!("logging pipeline started (log + session update queues)");
  }

  /// Cancels both workers (each drains its partial batch), then flushes
  /// whatever is still queued.
  pub async fn stop(self: &Arc<Self>) {
    if !self.running.swap(false, Ordering::SeqCst) {
      return;
    }
    self.cancel.lock().expect("cancel lock").cancel();
    let handles: Vec<JoinHandle<()>> = self.handles.lock().expect("handles lock").drain(..).collect();
    for handle in handles {
      let _ = handle.await;
    }
    self.flush().await;
    info!(
      "logging pipeline stopped (session updates: {}, errors: {})",
      self.counters.session_updated.load(Ordering::Relaxed),
      self.counters.session_errors.load(Ordering::Relaxed)
    );
  }

  fn queue_usage(&self) -> f64 {
    let max = self.log_tx.max_capacity() as f64;
    1.0 - self.log_tx.capacity() as f64 / max
  }

  /// Enqueues one interaction record; never blocks. Queue-full spills to
  /// the overflow shard and counts.
  pub async fn log(&self, record: InteractionRecord) {
    let usage = self.queue_usage();
    if usage >= BACKPRESSURE_THRESHOLD {
      warn!("log queue usage high: {:.0}% - backpressure", usage * 100.0);
    }

    if let Err(mpsc::error::TrySendError::Full(record)) = self.log_tx.try_send(record) {
      let total = self.counters.overflow.fetch_add(1, Ordering::Relaxed) + 1;
      warn!("log queue overflow (total: {total})");
      match serde_json::to_value(&record) {
        Ok(value) => self.save_to_overflow(&[value]).await,
        Err(e) => {
          self.counters.dropped.fetch_add(1, Ordering::Relaxed);
          error!("failed to serialize overflowed record: {e}");
        }
      }
    }
  }

  /// Enqueues a session diff; never blocks.
  pub async fn queue_session_update(&self, update: SessionUpdate) {
    if let Err(mpsc::error::TrySendError::Full(update)) = self.session_tx.try_send(update) {
      warn!("session update queue full - session_id: {}", update.session_id);
      match serde_json::to_value(&update) {
        Ok(mut value) => {
          value["type"] = serde_json::Value::String("session_update".to_string());
          self.save_to_overflow(&[value]).await;
        }
        Err(e) => error!("failed to serialize overflowed session update: {e}"),
      }
    }
  }

  async fn log_worker(self: Arc<Self>, cancel: CancellationToken) {
    loop {
      let batch = self
        .collect_batch(
          &self.log_rx,
          self.config.batch_size,
          self.config.flush_interval,
          &cancel,
        )
        .await;
      if !batch.is_empty() {
        self.write_jsonl_batch(&batch).await;
      }
      if cancel.is_cancelled() {
        debug!("log worker cancelled");
        break;
      }
    }
  }

  async fn session_worker(self: Arc<Self>, cancel: CancellationToken) {
    loop {
      let batch = self
        .collect_batch(
          &self.session_rx,
          self.config.session_batch_size,
          SESSION_BATCH_WAIT,
          &cancel,
        )
        .await;
      if !batch.is_empty() {
        self.apply_session_batch(&batch).await;
      }
      if cancel.is_cancelled() {
        debug!("session worker cancelled");
        break;
      }
    }
  }

  /// Pulls up to `limit` items or waits out the flush interval. Returns the
  /// partial batch on cancellation so nothing collected is lost.
  async fn collect_batch<T>(
    &self,
    rx: &Arc<Mutex<mpsc::Receiver<T>>>,
    limit: usize,
    wait: Duration,
    cancel: &CancellationToken,
  ) -> Vec<T> {
    let mut rx = rx.lock().await;
    let mut batch = Vec::new();
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    while batch.len() < limit {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = &mut deadline => break,
        item = rx.recv() => match item {
          Some(item) => batch.push(item),
          None => break,
        },
      }
    }
    batch
  }

  async fn write_jsonl_batch(&self, batch: &[InteractionRecord]) {
    let today = kst::today();
    let result = async {
      let dir = logpath::ensure_date_directory(&self.config.data_dir, today)?;
      let path = dir.join(format!("{}.jsonl", kst::format_date(today)));
      let mut lines = String::new();
      for record in batch {
        lines.push_str(&serde_json::to_string(record).map_err(std::io::Error::other)?);
        lines.push('\n');
      }
      let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .await?;
      file.write_all(lines.as_bytes()).await?;
      debug!("wrote {} log records to {}", batch.len(), path.display());
      Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
      error!("JSONL write failed: {e}");
      self.emergency_save(batch).await;
    }
  }

  /// One-shot dump used when the daily shard cannot be written. A second
  /// failure here means the records are lost; that is logged as critical.
  async fn emergency_save(&self, batch: &[InteractionRecord]) {
    let stamp = kst::format_compact(kst::now_naive());
    let path = self.config.data_dir.join(format!("emergency_{stamp}.jsonl"));
    let result = async {
      let mut lines = String::new();
      for record in batch {
        lines.push_str(&serde_json::to_string(record).map_err(std::io::Error::other)?);
        lines.push('\n');
      }
      tokio::fs::write(&path, lines).await
    }
    .await;

    match result {
      Ok(()) => warn!("emergency save completed: {}", path.display()),
      Err(e) => {
        self
          .counters
          .dropped
          .fetch_add(batch.len() as u64, Ordering::Relaxed);
        error!("emergency save failed, data lost: {e}");
      }
    }
  }

  async fn save_to_overflow(&self, values: &[serde_json::Value]) {
    let today = kst::today();
    let result = async {
      let dir = logpath::ensure_date_directory(&self.config.overflow_dir, today)?;
      let path = dir.join(format!("overflow_{}.jsonl", kst::format_date(today)));
      let mut lines = String::new();
      for value in values {
        lines.push_str(&value.to_string());
        lines.push('\n');
      }
      let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .await?;
      file.write_all(lines.as_bytes()).await?;
      Ok::<(), std::io::Error>(())
    }
    .await;

    match result {
      Ok(()) => debug!("saved {} overflow records", values.len()),
      Err(e) => {
        self
          .counters
          .dropped
          .fetch_add(values.len() as u64, Ordering::Relaxed);
        error!("overflow save failed: {e}");
      }
    }
  }

  async fn apply_session_batch(&self, batch: &[SessionUpdate]) {
    let (applied, errors) = self.sessions.apply_updates(batch).await;
    self
      .counters
      .session_updated
      .fetch_add(applied as u64, Ordering::Relaxed);
    self
      .counters
      .session_errors
      .fetch_add(errors as u64, Ordering::Relaxed);
  }

  /// Forces both queues empty synchronously.
  pub async fn flush(&self) {
    let mut records = Vec::new();
    {
      let mut rx = self.log_rx.lock().await;
      while let Ok(record) = rx.try_recv() {
        records.push(record);
      }
    }
    if !records.is_empty() {
      let count = records.len();
      self.write_jsonl_batch(&records).await;
      info!("flush completed: {count} log records written");
    }

    let mut updates = Vec::new();
    {
      let mut rx = self.session_rx.lock().await;
      while let Ok(update) = rx.try_recv() {
        updates.push(update);
      }
    }
    if !updates.is_empty() {
      let count = updates.len();
      self.apply_session_batch(&updates).await;
      info!("session flush completed: {count} updates applied");
    }
  }

  pub fn stats(&self) -> LoggingStats {
    LoggingStats {
      log_queue_size: self.config.queue_size - self.log_tx.capacity(),
      log_queue_capacity: self.config.queue_size,
      session_queue_size: self.config.session_queue_size - self.session_tx.capacity(),
      session_queue_capacity: self.config.session_queue_size,
      dropped_count: self.counters.dropped.load(Ordering::Relaxed),
      overflow_count: self.counters.overflow.load(Ordering::Relaxed),
      session_update_count: self.counters.session_updated.load(Ordering::Relaxed),
      session_update_errors: self.counters.session_errors.load(Ordering::Relaxed),
      running: self.running.load(Ordering::SeqCst),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use docchat_core::MessageType;
  use tempfile::tempdir;

  fn record(content: &str) -> InteractionRecord {
    InteractionRecord::new("s1", "policies", MessageType::User, content)
  }

  async fn pipeline_with(
    dir: &std::path::Path,
    queue_size: usize,
  ) -> Arc<LoggingPipeline> {
    let sessions = SessionStore::connect("sqlite::memory:").await.unwrap();
    let config = LoggingConfig {
      queue_size,
      session_queue_size: 4,
      batch_size: 10,
      session_batch_size: 10,
      flush_interval: Duration::from_millis(50),
      data_dir: dir.join("data"),
      overflow_dir: dir.join("overflow"),
    };
    LoggingPipeline::new(config, sessions)
  }

  #[tokio::test]
  async fn queue_full_spills_to_overflow_without_error() {
    let tmp = tempdir().unwrap();
    let pipeline = pipeline_with(tmp.path(), 2).await;

    // Workers not started: the queue fills at 2, the third spills.
    pipeline.log(record("1")).await;
    pipeline.log(record("2")).await;
    pipeline.log(record("3")).await;

    let stats = pipeline.stats();
    assert_eq!(stats.overflow_count, 1);
    assert_eq!(stats.log_queue_size, 2);

    let overflow_files = docchat_core::logpath::iter_all_files(&tmp.path().join("overflow"));
    assert_eq!(overflow_files.len(), 1);
    let contents = std::fs::read_to_string(&overflow_files[0]).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("\"message_content\":\"3\""));
  }

  #[tokio::test]
  async fn flush_writes_queued_records_to_daily_shard() {
    let tmp = tempdir().unwrap();
    let pipeline = pipeline_with(tmp.path(), 10).await;
    pipeline.log(record("하나")).await;
    pipeline.log(record("둘")).await;
    pipeline.flush().await;

    let shard = docchat_core::logpath::find_file_for_date(
      &tmp.path().join("data"),
      kst::today(),
      "",
    )
    .expect("daily shard exists");
    let contents = std::fs::read_to_string(shard).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(contents.ends_with('\n'));
    assert!(contents.contains("하나"));
  }

  #[tokio::test]
  async fn workers_batch_and_stop_drains() {
    let tmp = tempdir().unwrap();
    let pipeline = pipeline_with(tmp.path(), 100).await;
    pipeline.start();
    for i in 0..5 {
      pipeline.log(record(&format!("r{i}"))).await;
    }
    let mut update = SessionUpdate::new("sess", "policies", "gpt-oss-20b", "medium");
    update.response_time_ms = Some(500);
    pipeline.queue_session_update(update).await;
    pipeline.stop().await;

    let shard = docchat_core::logpath::find_file_for_date(
      &tmp.path().join("data"),
      kst::today(),
      "",
    )
    .expect("daily shard exists");
    let contents = std::fs::read_to_string(shard).unwrap();
    assert_eq!(contents.lines().count(), 5);
    assert!(!pipeline.stats().running);
    assert_eq!(pipeline.stats().session_update_count, 1);
  }

  #[tokio::test]
  async fn unwritable_data_dir_counts_drops() {
    let tmp = tempdir().unwrap();
    // data_dir is a regular file: shard and emergency writes both fail.
    let bogus = tmp.path().join("data");
    std::fs::write(&bogus, "x").unwrap();
    let sessions = SessionStore::connect("sqlite::memory:").await.unwrap();
    let config = LoggingConfig {
      data_dir: bogus,
      overflow_dir: tmp.path().join("overflow"),
      ..LoggingConfig::default()
    };
    let pipeline = LoggingPipeline::new(config, sessions);
    pipeline.log(record("lost")).await;
    pipeline.flush().await;
    assert_eq!(pipeline.stats().dropped_count, 1);
  }
}
