//! chime-cron: Persistent job scheduling for agent sessions.
//!
//! Jobs live in one JSON store file per scheduler instance, guarded by a
//! sidecar lock file so several processes can share it. A catch-up timer
//! executes every job whose time has passed, including jobs that became due
//! while nothing was running, and records the result before moving on.
//! `status`/`list` never wait long for the lock: when a job is mid-flight
//! they answer from the last snapshot they saw.

pub mod dispatch;
pub mod error;
pub mod lock;
pub mod query;
pub mod run_log;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod store;

pub use dispatch::{Dispatcher, ExecutionOutcome, IsolatedRunner, SessionBridge};
pub use error::{CronError, Result};
pub use query::SchedulerStatus;
pub use run_log::RunLogEntry;
pub use scheduler::{RunMode, RunOutcome, TickReport};
pub use service::{CronService, CronServiceOptions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chime_types::{RunStatus, SessionRef, SessionTarget, WakeMode};

/// Upper bound for `every` intervals (ten years).
pub const MAX_EVERY_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

/// When a job is due.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronSchedule {
    /// Once, at a fixed instant.
    At { at: DateTime<Utc> },
    /// Every `every_ms`, counted from `anchor` (the creation time if unset).
    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<DateTime<Utc>>,
    },
}

/// An agent turn to run in an isolated context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurn {
    /// Prompt handed to the agent.
    pub message: String,
    /// Model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Budget for the run, enforced by the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// What a job does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronPayload {
    AgentTurn(AgentTurn),
    SystemEvent { text: String },
}

impl CronPayload {
    /// Text delivered to the agent.
    pub fn text(&self) -> &str {
        match self {
            CronPayload::AgentTurn(turn) => &turn.message,
            CronPayload::SystemEvent { text } => text,
        }
    }
}

/// A scheduled job as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    /// Unique job ID.
    pub id: String,
    /// Human-readable label (not unique).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disabled jobs are never run by the timer but stay listable.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Remove a one-shot job once it has run successfully.
    #[serde(default)]
    pub delete_after_run: bool,
    pub schedule: CronSchedule,
    pub session_target: SessionTarget,
    #[serde(default)]
    pub wake_mode: WakeMode,
    pub payload: CronPayload,
    /// Agent scope for delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Session an attached job is delivered into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Next pending occurrence, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Start of the last execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl CronJob {
    /// Build a new job from a creation request.
    pub fn from_create(spec: CronJobCreate, now: DateTime<Utc>) -> Self {
        let mut job = Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name.trim().to_string(),
            description: spec.description,
            enabled: spec.enabled,
            delete_after_run: spec.delete_after_run,
            schedule: spec.schedule,
            session_target: spec.session_target,
            wake_mode: spec.wake_mode,
            payload: spec.payload,
            agent_id: spec.agent_id,
            session_key: spec.session_key,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            last_summary: None,
            last_duration_ms: None,
        };
        job.next_run_at = schedule::next_run_at(&job);
        job
    }

    /// Session an attached job is delivered into.
    pub fn session_ref(&self) -> SessionRef {
        SessionRef {
            agent_id: self.agent_id.clone(),
            session_key: self.session_key.clone(),
        }
    }

    /// Check the job is something the scheduler can run.
    pub fn validate(&self) -> Result<()> {
        validate_fields(&self.name, &self.schedule, self.session_target, &self.payload)
    }
}

/// Request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobCreate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
    pub schedule: CronSchedule,
    pub session_target: SessionTarget,
    #[serde(default)]
    pub wake_mode: WakeMode,
    pub payload: CronPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

impl CronJobCreate {
    /// An enabled job with default wake mode and no session scope.
    pub fn new(
        name: impl Into<String>,
        schedule: CronSchedule,
        session_target: SessionTarget,
        payload: CronPayload,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            schedule,
            session_target,
            wake_mode: WakeMode::default(),
            payload,
            agent_id: None,
            session_key: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_fields(&self.name, &self.schedule, self.session_target, &self.payload)
    }
}

/// Partial update of a job. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<CronSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_mode: Option<WakeMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<CronPayload>,
}

impl CronJobPatch {
    /// Apply to `job` and re-derive its next run.
    pub fn apply(self, job: &mut CronJob, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            job.name = name.trim().to_string();
        }
        if let Some(description) = self.description {
            job.description = Some(description);
        }
        if let Some(enabled) = self.enabled {
            job.enabled = enabled;
        }
        if let Some(delete_after_run) = self.delete_after_run {
            job.delete_after_run = delete_after_run;
        }
        if let Some(schedule) = self.schedule {
            job.schedule = schedule;
        }
        if let Some(wake_mode) = self.wake_mode {
            job.wake_mode = wake_mode;
        }
        if let Some(payload) = self.payload {
            job.payload = payload;
        }
        job.updated_at = now;
        job.next_run_at = schedule::next_run_at(job);
    }
}

fn validate_fields(
    name: &str,
    schedule: &CronSchedule,
    target: SessionTarget,
    payload: &CronPayload,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CronError::InvalidJob("name must not be empty".into()));
    }
    if let CronSchedule::Every { every_ms, .. } = schedule {
        if *every_ms == 0 || *every_ms > MAX_EVERY_MS {
            return Err(CronError::InvalidJob(format!(
                "everyMs must be between 1 and {MAX_EVERY_MS}, got {every_ms}"
            )));
        }
    }
    if payload.text().trim().is_empty() {
        return Err(CronError::InvalidJob("payload text must not be empty".into()));
    }
    if target == SessionTarget::Isolated && !matches!(payload, CronPayload::AgentTurn(_)) {
        return Err(CronError::InvalidJob(
            "isolated jobs require an agentTurn payload".into(),
        ));
    }
    Ok(())
}
