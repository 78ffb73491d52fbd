//! Cron service, the public facade hosts embed.
//!
//! One service instance owns one store path. Mutations go through the store
//! lock and propagate lock timeouts; `status` and `list` degrade to the last
//! snapshot instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chime_config::CronConfig;
use chime_hooks::{HookEvent, HookRegistry};

use crate::dispatch::Dispatcher;
use crate::error::{CronError, Result};
use crate::query::{QueryFacade, SchedulerStatus};
use crate::run_log::{RunLog, RunLogEntry};
use crate::scheduler::{RunMode, RunOutcome, Scheduler, SchedulerTimings, TickReport};
use crate::store::CronStore;
use crate::{CronJob, CronJobCreate, CronJobPatch};

/// Settings for one service instance.
#[derive(Debug, Clone)]
pub struct CronServiceOptions {
    pub store_path: PathBuf,
    /// Whether `start` launches the timer.
    pub enabled: bool,
    /// How long mutations wait for the store lock.
    pub lock_timeout: Duration,
    /// Age after which a lock file is reclaimed.
    pub stale_lock: Duration,
    /// How long reads wait before answering from cache.
    pub read_timeout: Duration,
    pub tick_interval: Duration,
    pub run_log_max_bytes: u64,
    pub run_log_keep_lines: usize,
}

impl CronServiceOptions {
    /// Default settings for `store_path`.
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self::from_config(&CronConfig::default(), store_path)
    }

    pub fn from_config(config: &CronConfig, store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            enabled: config.enabled,
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            stale_lock: Duration::from_millis(config.stale_lock_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            run_log_max_bytes: config.run_log_max_bytes,
            run_log_keep_lines: config.run_log_keep_lines,
        }
    }
}

struct TimerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Persistent scheduler for one job store.
pub struct CronService {
    options: CronServiceOptions,
    scheduler: Arc<Scheduler>,
    timer: Mutex<Option<TimerHandle>>,
}

impl CronService {
    pub fn new(options: CronServiceOptions, dispatcher: Dispatcher) -> Self {
        Self::build(options, dispatcher, None)
    }

    /// Like [`CronService::new`], emitting lifecycle events to `hooks`.
    pub fn with_hooks(
        options: CronServiceOptions,
        dispatcher: Dispatcher,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self::build(options, dispatcher, Some(hooks))
    }

    fn build(
        options: CronServiceOptions,
        dispatcher: Dispatcher,
        hooks: Option<Arc<HookRegistry>>,
    ) -> Self {
        let store = Arc::new(CronStore::new(&options.store_path, options.stale_lock));
        let query = Arc::new(QueryFacade::new(store.clone(), options.read_timeout));
        let run_log = RunLog::for_store(
            &options.store_path,
            options.run_log_max_bytes,
            options.run_log_keep_lines,
        );
        let timings = SchedulerTimings {
            lock_timeout: options.lock_timeout,
            stale_lock: options.stale_lock,
            tick_interval: options.tick_interval,
        };
        let scheduler = Arc::new(Scheduler::new(
            store, dispatcher, query, run_log, hooks, timings,
        ));
        Self {
            options,
            scheduler,
            timer: Mutex::new(None),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.options.store_path
    }

    /// Launch the catch-up timer. Does nothing if disabled or already running.
    pub async fn start(&self) {
        if !self.options.enabled {
            info!(path = %self.store_path().display(), "Cron scheduler disabled");
            return;
        }
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = self.scheduler.clone().spawn(cancel.clone());
        *timer = Some(TimerHandle { cancel, handle });
        drop(timer);

        self.scheduler
            .emit(HookEvent::SchedulerStarted {
                store_path: self.store_path().display().to_string(),
            })
            .await;
    }

    /// Stop the timer. An in-flight tick finishes first; no tick starts after.
    pub async fn stop(&self) {
        let Some(timer) = self.timer.lock().await.take() else {
            return;
        };
        timer.cancel.cancel();
        if let Err(e) = timer.handle.await {
            warn!("Cron timer task ended abnormally: {e}");
        }
        self.scheduler
            .emit(HookEvent::SchedulerStopped {
                store_path: self.store_path().display().to_string(),
            })
            .await;
    }

    pub async fn is_running(&self) -> bool {
        self.timer.lock().await.is_some()
    }

    /// Validate and persist a new job.
    pub async fn add(&self, spec: CronJobCreate) -> Result<CronJob> {
        spec.validate()?;
        let job = CronJob::from_create(spec, Utc::now());

        let stored = job.clone();
        let (_, file) = self
            .scheduler
            .store()
            .with_lock(self.options.lock_timeout, move |file| {
                file.jobs.push(stored);
                Ok(())
            })
            .await?;
        self.scheduler.query().remember(&file).await;

        info!(job_id = %job.id, name = %job.name, next_run_at = ?job.next_run_at, "Cron job added");
        self.scheduler
            .emit(HookEvent::CronJobAdded {
                job_id: job.id.clone(),
                name: job.name.clone(),
            })
            .await;
        Ok(job)
    }

    /// Apply `patch` to a job. The job is left untouched if the result is invalid.
    pub async fn update(&self, id: &str, patch: CronJobPatch) -> Result<CronJob> {
        let (job, file) = self
            .scheduler
            .store()
            .with_lock(self.options.lock_timeout, |file| {
                let job = file
                    .find_mut(id)
                    .ok_or_else(|| CronError::JobNotFound(id.to_string()))?;
                let mut updated = job.clone();
                patch.apply(&mut updated, Utc::now());
                updated.validate()?;
                *job = updated.clone();
                Ok(updated)
            })
            .await?;
        self.scheduler.query().remember(&file).await;

        info!(job_id = %job.id, enabled = job.enabled, "Cron job updated");
        self.scheduler
            .emit(HookEvent::CronJobUpdated {
                job_id: job.id.clone(),
            })
            .await;
        Ok(job)
    }

    /// Delete a job and its run history. Returns `false` for unknown ids.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let (removed, file) = self
            .scheduler
            .store()
            .with_lock(self.options.lock_timeout, |file| Ok(file.remove(id).is_some()))
            .await?;
        self.scheduler.query().remember(&file).await;
        if !removed {
            return Ok(false);
        }

        if let Err(e) = self.scheduler.run_log().remove(id).await {
            warn!(job_id = %id, "Failed to remove run log: {e}");
        }
        info!(job_id = %id, "Cron job removed");
        self.scheduler
            .emit(HookEvent::CronJobRemoved {
                job_id: id.to_string(),
            })
            .await;
        Ok(true)
    }

    /// All jobs, including disabled ones, ordered by next run.
    pub async fn list(&self) -> Vec<CronJob> {
        self.scheduler.query().list(true).await
    }

    /// Enabled jobs only, ordered by next run.
    pub async fn list_enabled(&self) -> Vec<CronJob> {
        self.scheduler.query().list(false).await
    }

    /// Run one job now (`Force`) or only if it is due (`Due`).
    pub async fn run(&self, id: &str, mode: RunMode) -> Result<RunOutcome> {
        self.scheduler.run_job(id, mode).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.scheduler.query().status(self.options.enabled).await
    }

    /// The newest `limit` runs of a job, oldest first.
    pub async fn runs(&self, id: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
        self.scheduler.run_log().read(id, limit).await
    }

    /// Run one catch-up pass immediately, independent of the timer.
    pub async fn tick(&self) -> Result<TickReport> {
        self.scheduler.tick().await
    }
}

impl Drop for CronService {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.cancel.cancel();
        }
    }
}
