//! Catch-up scheduler: runs every job whose time has passed.
//!
//! Each tick takes the store lock, collects the due jobs and executes them one
//! at a time, persisting each result before the next job starts. A job that
//! came due while no process was running is simply due on the first tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chime_hooks::{HookEvent, HookRegistry};
use chime_types::RunStatus;

use crate::dispatch::{Dispatcher, ExecutionOutcome};
use crate::error::{CronError, Result};
use crate::query::QueryFacade;
use crate::run_log::{RunLog, RunLogEntry};
use crate::schedule::{self, AfterRun};
use crate::store::{CronStore, LockedStore};

const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// How `run` treats the due-time check.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Run only if the job is due.
    #[default]
    Due,
    /// Run now, even if not due or disabled.
    Force,
}

/// Result of an explicit `run`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub job_id: String,
    pub ran: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub ran: usize,
    pub failed: usize,
}

/// Lock and timer settings the scheduler runs with.
#[derive(Debug, Clone)]
pub struct SchedulerTimings {
    pub lock_timeout: Duration,
    pub stale_lock: Duration,
    pub tick_interval: Duration,
}

impl SchedulerTimings {
    /// Refresh the lock well inside the staleness threshold.
    fn keepalive_interval(&self) -> Duration {
        (self.stale_lock / 3).max(MIN_TICK_INTERVAL)
    }
}

pub struct Scheduler {
    store: Arc<CronStore>,
    dispatcher: Dispatcher,
    query: Arc<QueryFacade>,
    run_log: RunLog,
    hooks: Option<Arc<HookRegistry>>,
    timings: SchedulerTimings,
}

impl Scheduler {
    pub fn new(
        store: Arc<CronStore>,
        dispatcher: Dispatcher,
        query: Arc<QueryFacade>,
        run_log: RunLog,
        hooks: Option<Arc<HookRegistry>>,
        timings: SchedulerTimings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            query,
            run_log,
            hooks,
            timings,
        }
    }

    pub fn store(&self) -> &Arc<CronStore> {
        &self.store
    }

    pub fn query(&self) -> &Arc<QueryFacade> {
        &self.query
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    pub(crate) async fn emit(&self, event: HookEvent) {
        if let Some(hooks) = &self.hooks {
            hooks.emit(event).await;
        }
    }

    /// Execute every due job once, earliest first.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut locked = self.store.lock(self.timings.lock_timeout).await?;
        let due = schedule::due_job_ids(&locked.file.jobs, Utc::now());
        self.query.remember(&locked.file).await;

        let mut report = TickReport::default();
        if due.is_empty() {
            locked.release().await?;
            return Ok(report);
        }

        debug!(count = due.len(), "Cron tick found due jobs");
        locked.keep_alive(self.timings.keepalive_interval());

        let mut failure = None;
        for job_id in due {
            match self.execute_locked(&mut locked, &job_id, false).await {
                Ok(outcome) => {
                    report.ran += 1;
                    if outcome.status == RunStatus::Failed {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let released = locked.release().await;
        if let Some(e) = failure {
            return Err(e);
        }
        self.query.remember(&released?).await;
        Ok(report)
    }

    /// Run one job through the same locked path the timer uses.
    pub async fn run_job(&self, job_id: &str, mode: RunMode) -> Result<RunOutcome> {
        let mut locked = self.store.lock(self.timings.lock_timeout).await?;
        let now = Utc::now();
        let due = locked.file.find(job_id).map(|job| schedule::is_due(job, now));

        let Some(due) = due else {
            locked.release().await?;
            return Err(CronError::JobNotFound(job_id.to_string()));
        };
        if mode == RunMode::Due && !due {
            let file = locked.release().await?;
            self.query.remember(&file).await;
            return Ok(RunOutcome {
                job_id: job_id.to_string(),
                ran: false,
                reason: Some("not-due".into()),
                status: None,
                summary: None,
            });
        }

        self.query.remember(&locked.file).await;
        locked.keep_alive(self.timings.keepalive_interval());
        let result = self
            .execute_locked(&mut locked, job_id, mode == RunMode::Force)
            .await;
        let released = locked.release().await;
        let outcome = result?;
        self.query.remember(&released?).await;

        Ok(RunOutcome {
            job_id: job_id.to_string(),
            ran: true,
            reason: None,
            status: Some(outcome.status),
            summary: Some(outcome.summary),
        })
    }

    /// Execute one job while holding the store lock and persist the result.
    async fn execute_locked(
        &self,
        locked: &mut LockedStore<'_>,
        job_id: &str,
        forced: bool,
    ) -> Result<ExecutionOutcome> {
        let job = locked
            .file
            .find(job_id)
            .cloned()
            .ok_or_else(|| CronError::JobNotFound(job_id.to_string()))?;

        info!(
            job_id = %job.id,
            name = %job.name,
            target = %job.session_target,
            forced,
            "Executing cron job"
        );
        self.emit(HookEvent::CronJobStarted {
            job_id: job.id.clone(),
            forced,
        })
        .await;

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = self.dispatcher.execute(&job).await;
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        let after = match locked.file.find_mut(job_id) {
            Some(stored) => {
                schedule::record_run(stored, &outcome, started_at, duration_ms, Utc::now())
            }
            None => AfterRun::Keep,
        };
        if after == AfterRun::Delete {
            locked.file.remove(job_id);
            info!(job_id = %job.id, "One-shot job deleted after successful run");
        }
        locked.persist().await?;
        self.query.remember(&locked.file).await;

        match outcome.status {
            RunStatus::Ok => info!(job_id = %job.id, duration_ms, "Cron job finished"),
            status => warn!(
                job_id = %job.id,
                duration_ms,
                %status,
                summary = %outcome.summary,
                "Cron job did not complete"
            ),
        }

        let entry = RunLogEntry {
            job_id: job.id.clone(),
            run_at: started_at,
            status: outcome.status,
            summary: outcome.summary.clone(),
            duration_ms,
            forced,
        };
        if let Err(e) = self.run_log.append(&entry).await {
            warn!(job_id = %job.id, "Failed to append run log: {e}");
        }

        self.emit(HookEvent::CronJobFinished {
            job_id: job.id,
            status: outcome.status,
            summary: outcome.summary.clone(),
            duration_ms,
        })
        .await;

        Ok(outcome)
    }

    /// Start the timer task. The first tick fires immediately.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.timings.tick_interval.max(MIN_TICK_INTERVAL);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(path = %self.store.path().display(), "Cron scheduler started");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match self.tick().await {
                    Ok(report) if report.ran > 0 => {
                        info!(ran = report.ran, failed = report.failed, "Cron tick complete");
                    }
                    Ok(_) => {}
                    Err(e) if e.is_timeout() => {
                        warn!("Cron tick skipped, store busy: {e}");
                    }
                    Err(e) => warn!("Cron tick failed: {e}"),
                }
            }

            info!(path = %self.store.path().display(), "Cron scheduler stopped");
        })
    }
}
