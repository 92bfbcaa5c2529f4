//! Cron/interval job driver.
//!
//! Cron expressions are evaluated in KST. Jobs never rethrow: a failing
//! tick is logged and retried on the next occurrence. Interval jobs may ask
//! to be removed by returning [`JobOutcome::Remove`] (the back-fill job does
//! this once nothing is missing).

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use docchat_core::kst;

pub type JobFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// What a job tick asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
  Continue,
  /// Deregister this job; no further ticks fire.
  Remove,
}

struct Job {
  name: String,
  trigger: Trigger,
  run: JobFn,
}

enum Trigger {
  Cron(Schedule),
  Interval {
    period: Duration,
    initial_delay: Duration,
  },
}

pub struct Scheduler {
  jobs: Vec<Job>,
  cancel: CancellationToken,
  handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
  started: std::sync::atomic::AtomicBool,
}

impl Scheduler {
  pub fn new() -> Self {
    Self {
      jobs: Vec::new(),
      cancel: CancellationToken::new(),
      handles: std::sync::Mutex::new(Vec::new()),
      started: std::sync::atomic::AtomicBool::new(false),
    }
  }

  /// Registers a cron job (6/7-field expression, seconds first), evaluated
  /// in KST.
  pub fn add_cron<F, Fut>(&mut self, name: &str, expression: &str, run: F) -> anyhow::Result<()>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let schedule = Schedule::from_str(expression)
      .map_err(|e| anyhow::anyhow!("invalid cron expression '{expression}': {e}"))?;
    let run = Arc::new(run);
    self.jobs.push(Job {
      name: name.to_string(),
      trigger: Trigger::Cron(schedule),
      run: Arc::new(move || {
        let tick = (*run)();
        Box::pin(async move {
          tick.await;
          JobOutcome::Continue
        }) as JobFuture
      }),
    });
    Ok(())
  }

  /// Registers an interval job. The closure's outcome controls whether the
  /// job keeps firing.
  pub fn add_interval<F, Fut>(
    &mut self,
    name: &str,
    period: Duration,
    initial_delay: Duration,
    run: F,
  ) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
  {
    let run = Arc::new(run);
    self.jobs.push(Job {
      name: name.to_string(),
      trigger: Trigger::Interval {
        period,
        initial_delay,
      },
      run: Arc::new(move || Box::pin((*run)()) as JobFuture),
    });
  }

  /// Spawns one driver task per registered job.
  pub fn start(&mut self) {
    if self.started.swap(true, std::sync::atomic::Ordering::SeqCst) {
      warn!("scheduler already started");
      return;
    }
    let names: Vec<String> = self.jobs.iter().map(|j| j.name.clone()).collect();
    let mut handles = self.handles.lock().expect("handles lock");
    for job in self.jobs.drain(..) {
      let cancel = self.cancel.clone();
      handles.push(tokio::spawn(drive_job(job, cancel)));
    }
    info!("scheduler started with jobs: {}", names.join(", "));
  }

  pub async fn stop(&self) {
    self.cancel.cancel();
    let handles: Vec<JoinHandle<()>> = self.handles.lock().expect("handles lock").drain(..).collect();
    for handle in handles {
      let _ = handle.await;
    }
    info!("scheduler stopped");
  }
}

impl Default for Scheduler {
  fn default() -> Self {
    Self::new()
  }
}

async fn drive_job(job: Job, cancel: CancellationToken) {
  match job.trigger {
    Trigger::Cron(schedule) => loop {
      let Some(next) = schedule.upcoming(kst::timezone()).next() else {
        warn!("cron job '{}' has no upcoming occurrence", job.name);
        return;
      };
      let wait = (next - kst::now())
        .to_std()
        .unwrap_or(Duration::from_secs(0));
      debug!("job '{}' sleeps {}s until {next}", job.name, wait.as_secs());
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(wait) => {}
      }
      info!("running scheduled job '{}'", job.name);
      let outcome = (job.run.as_ref())().await;
      if outcome == JobOutcome::Remove {
        info!("job '{}' removed itself", job.name);
        return;
      }
    },
    Trigger::Interval {
      period,
      initial_delay,
    } => {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(initial_delay) => {}
      }
      loop {
        info!("running interval job '{}'", job.name);
        let outcome = (job.run.as_ref())().await;
        if outcome == JobOutcome::Remove {
          info!("job '{}' removed itself", job.name);
          return;
        }
        tokio::select! {
          _ = cancel.cancelled() => return,
          _ = tokio::time::sleep(period) => {}
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test(start_paused = true)]
  async fn interval_job_fires_after_initial_delay_then_periodically() {
    let count = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new();
    let c = Arc::clone(&count);
    scheduler.add_interval(
      "tick",
      Duration::from_secs(300),
      Duration::from_secs(30),
      move || {
        let c = Arc::clone(&c);
        async move {
          c.fetch_add(1, Ordering::SeqCst);
          JobOutcome::Continue
        }
      },
    );
    scheduler.start();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);

    scheduler.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn interval_job_self_removes() {
    let count = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new();
    let c = Arc::clone(&count);
    scheduler.add_interval(
      "once",
      Duration::from_secs(10),
      Duration::from_secs(0),
      move || {
        let c = Arc::clone(&c);
        async move {
          c.fetch_add(1, Ordering::SeqCst);
          JobOutcome::Remove
        }
      },
    );
    scheduler.start();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    scheduler.stop().await;
  }

  #[test]
  fn cron_expressions_parse() {
    let mut scheduler = Scheduler::new();
    // Daily 01:00, hourly minute 0, daily 02:00 and 02:30.
    assert!(scheduler.add_cron("daily", "0 0 1 * * *", || async {}).is_ok());
    assert!(scheduler.add_cron("hourly", "0 0 * * * *", || async {}).is_ok());
    assert!(scheduler.add_cron("cleanup", "0 0 2 * * *", || async {}).is_ok());
    assert!(scheduler.add_cron("conv", "0 30 2 * * *", || async {}).is_ok());
    assert!(scheduler.add_cron("bad", "not a cron", || async {}).is_err());
  }
}
