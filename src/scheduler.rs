use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::coordinator::{Coordinator, RunError};
use crate::model::ScrapeJob;
use crate::shutdown::Shutdown;

/// Something that performs one scrape run.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, shutdown: &Shutdown) -> Result<ScrapeJob, RunError>;
}

#[async_trait]
impl JobRunner for Coordinator {
    async fn run_job(&self, shutdown: &Shutdown) -> Result<ScrapeJob, RunError> {
        self.run(shutdown).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// The run was started and has finished with this job record.
    Started(ScrapeJob),
    /// Another run was in flight; nothing happened.
    SkippedBusy,
}

/// Marks the scheduler busy until dropped.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Interval-driven runner with at most one run in flight.
#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    interval: Duration,
    run_on_start: bool,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, interval: Duration) -> Self {
        Self {
            runner,
            interval,
            run_on_start: true,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    fn try_begin(&self) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(self.running.clone()))
    }

    /// Run once now unless a run is already in flight.
    pub async fn trigger(&self, shutdown: &Shutdown) -> Result<TriggerOutcome, RunError> {
        let Some(_guard) = self.try_begin() else {
            info!("scrape run already in progress; trigger skipped");
            return Ok(TriggerOutcome::SkippedBusy);
        };
        let job = self.runner.run_job(shutdown).await?;
        Ok(TriggerOutcome::Started(job))
    }

    /// Tick until shutdown, then wait for the in-flight run to wind down.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let first = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    let Some(guard) = self.try_begin() else {
                        info!("previous scrape run still in progress; tick skipped");
                        continue;
                    };
                    let runner = self.runner.clone();
                    let run_shutdown = shutdown.clone();
                    in_flight = Some(tokio::spawn(async move {
                        let _guard = guard;
                        match runner.run_job(&run_shutdown).await {
                            Ok(job) => info!(
                                job_id = %job.job_id,
                                status = job.status.as_str(),
                                "scheduled run complete"
                            ),
                            Err(err) => error!(?err, "scheduled run failed"),
                        }
                    }));
                }
            }
        }

        info!("scheduler stopping");
        if let Some(handle) = in_flight {
            if let Err(err) = handle.await {
                error!(?err, "scrape run task panicked");
            }
        }
    }
}
