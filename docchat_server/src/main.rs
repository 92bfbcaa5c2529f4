use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use analytics_server::{retention, JobOutcome, Scheduler};
use docchat_core::kst;
use docchat_server::{get_router, AppConfig, AppState};

const BACKFILL_MAX_DATES: usize = 7;
const BACKFILL_DAYS_BACK: i64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
  let layer = fmt::layer().with_target(false);
  tracing_subscriber::registry()
    .with(layer)
    .with(EnvFilter::from_default_env().add_directive("info".parse()?))
    .init();

  let config = AppConfig::load()?;
  info!("{}", config.summary());

  let addr = format!("{}:{}", config.server.host, config.server.port);
  let state = AppState::try_new(config).await?;

  state.logging.start();
  let mut scheduler = build_scheduler(&state)?;
  scheduler.start();
  let scheduler = Arc::new(scheduler);

  let listener = tokio::net::TcpListener::bind(&addr).await?;
  info!("docchat listening on {addr}");

  let router = get_router(state.clone());
  axum::serve(listener, router)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("shutting down");
  scheduler.stop().await;
  state.logging.stop().await;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("failed to listen for shutdown signal: {e}");
  }
}

/// Registers the maintenance jobs: daily/hourly aggregation, the
/// self-removing back-fill, shard and conversation cleanup, and the
/// temp-collection sweep. Jobs log failures and never propagate them.
fn build_scheduler(state: &AppState) -> Result<Scheduler> {
  let mut scheduler = Scheduler::new();

  // Daily statistics at 01:00 KST, aggregating yesterday.
  {
    let stats = state.stats.clone();
    scheduler.add_cron("daily_stats_aggregation", "0 0 1 * * *", move || {
      let stats = stats.clone();
      async move {
        let yesterday = kst::today() - chrono::Duration::days(1);
        let outcome = stats.aggregate_daily(yesterday).await;
        info!("daily stats aggregation: {:?}", outcome.status);
      }
    })?;
  }

  // Hourly refresh of today's rollup at minute 0.
  {
    let stats = state.stats.clone();
    scheduler.add_cron("hourly_stats_aggregation", "0 0 * * * *", move || {
      let stats = stats.clone();
      async move {
        let outcome = stats.aggregate_hourly().await;
        info!("hourly stats aggregation: {:?}", outcome.status);
      }
    })?;
  }

  // Back-fill every 5 minutes, first run 30 s after startup; removes itself
  // once nothing is missing.
  {
    let stats = state.stats.clone();
    scheduler.add_interval(
      "stats_backfill",
      Duration::from_secs(300),
      Duration::from_secs(30),
      move || {
        let stats = stats.clone();
        async move {
          let outcome = stats.backfill(BACKFILL_MAX_DATES, BACKFILL_DAYS_BACK).await;
          if outcome.status == "no_missing" {
            info!("all missing stats backfilled, removing job");
            JobOutcome::Remove
          } else {
            info!(
              "stats backfill progress: {} processed, {} remaining",
              outcome.processed, outcome.remaining
            );
            JobOutcome::Continue
          }
        }
      },
    );
  }

  // Log shard compression + retention at 02:00 KST.
  {
    let data_dir = state.config.logs_data_dir();
    let overflow_dir = state.config.logs_overflow_dir();
    let compress_after = state.config.retention.compress_after_days;
    let retention_days = state.config.retention.retention_days;
    scheduler.add_cron("log_cleanup", "0 0 2 * * *", move || {
      let data_dir = data_dir.clone();
      let overflow_dir = overflow_dir.clone();
      async move {
        let compressed = retention::compress_older_than(&data_dir, compress_after);
        let deleted = retention::delete_older_than(&data_dir, retention_days)
          + retention::delete_older_than(&overflow_dir, retention_days);
        info!("log cleanup: {compressed} compressed, {deleted} deleted");
      }
    })?;
  }

  // Conversation files at 02:30 KST.
  {
    let conversations = state.conversations.clone();
    scheduler.add_cron("conversation_cleanup", "0 30 2 * * *", move || {
      let conversations = conversations.clone();
      async move {
        let deleted = conversations.cleanup();
        info!("conversation cleanup: {deleted} files deleted");
      }
    })?;
  }

  // Expired temp collections, every 5 minutes.
  {
    let vector = state.vector.clone();
    let ttl = state.config.vector_store.temp_collection_ttl_minutes;
    let hybrid = state.rag.hybrid_engine();
    scheduler.add_interval(
      "temp_collection_cleanup",
      Duration::from_secs(300),
      Duration::from_secs(300),
      move || {
        let vector = vector.clone();
        let hybrid = hybrid.clone();
        async move {
          match vector.cleanup_expired_temp_collections(ttl).await {
            Ok(deleted) => {
              for name in &deleted {
                hybrid.invalidate(Some(name));
              }
            }
            Err(e) => warn!("temp collection cleanup failed: {e}"),
          }
          JobOutcome::Continue
        }
      },
    );
  }

  Ok(scheduler)
}
