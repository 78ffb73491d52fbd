//! Hook event types.

use serde::{Deserialize, Serialize};

use chime_types::RunStatus;

/// Events that hooks can subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    /// The catch-up timer has started.
    SchedulerStarted { store_path: String },
    /// The catch-up timer has stopped.
    SchedulerStopped { store_path: String },
    /// A job has been added.
    CronJobAdded { job_id: String, name: String },
    /// A job has been updated.
    CronJobUpdated { job_id: String },
    /// A job has been removed.
    CronJobRemoved { job_id: String },
    /// A job is about to be executed.
    CronJobStarted { job_id: String, forced: bool },
    /// A job has finished executing.
    CronJobFinished {
        job_id: String,
        status: RunStatus,
        summary: String,
        duration_ms: u64,
    },
}

impl HookEvent {
    /// Event type name used for routing.
    pub fn type_name(&self) -> &'static str {
        match self {
            HookEvent::SchedulerStarted { .. } => "scheduler_started",
            HookEvent::SchedulerStopped { .. } => "scheduler_stopped",
            HookEvent::CronJobAdded { .. } => "cron_job_added",
            HookEvent::CronJobUpdated { .. } => "cron_job_updated",
            HookEvent::CronJobRemoved { .. } => "cron_job_removed",
            HookEvent::CronJobStarted { .. } => "cron_job_started",
            HookEvent::CronJobFinished { .. } => "cron_job_finished",
        }
    }
}
