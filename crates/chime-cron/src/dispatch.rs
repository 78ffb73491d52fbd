//! Job dispatch. Hands a due job to the isolated runner or the session
//! bridge depending on its target.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use chime_types::{RunStatus, SessionRef, SessionTarget, SystemEvent, WakeMode};

use crate::{AgentTurn, CronJob, CronPayload};

/// Result of executing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: RunStatus,
    pub summary: String,
}

impl ExecutionOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Ok,
            summary: summary.into(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            summary: summary.into(),
        }
    }

    pub fn skipped(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Skipped,
            summary: summary.into(),
        }
    }
}

/// Runs an agent turn in a fresh, isolated context.
#[async_trait]
pub trait IsolatedRunner: Send + Sync {
    async fn run_isolated(&self, job: &CronJob, turn: &AgentTurn)
    -> anyhow::Result<ExecutionOutcome>;
}

/// Delivers events into a long-lived agent session.
#[async_trait]
pub trait SessionBridge: Send + Sync {
    /// Queue a system event for the session's next turn.
    async fn enqueue_system_event(&self, event: SystemEvent) -> anyhow::Result<()>;

    /// Ask the session to take a turn now instead of at its next heartbeat.
    async fn request_heartbeat_now(&self, session: &SessionRef) -> anyhow::Result<()>;
}

/// Routes jobs to their executor. Never fails: every error becomes a
/// `failed` outcome.
#[derive(Clone)]
pub struct Dispatcher {
    isolated: Arc<dyn IsolatedRunner>,
    bridge: Arc<dyn SessionBridge>,
}

impl Dispatcher {
    pub fn new(isolated: Arc<dyn IsolatedRunner>, bridge: Arc<dyn SessionBridge>) -> Self {
        Self { isolated, bridge }
    }

    /// Execute `job` once.
    pub async fn execute(&self, job: &CronJob) -> ExecutionOutcome {
        match job.session_target {
            SessionTarget::Isolated => self.run_isolated(job).await,
            SessionTarget::Attached => self.deliver_attached(job).await,
        }
    }

    async fn run_isolated(&self, job: &CronJob) -> ExecutionOutcome {
        let CronPayload::AgentTurn(turn) = &job.payload else {
            return ExecutionOutcome::skipped("isolated jobs require an agentTurn payload");
        };

        // Own task, so a panicking runner is reported instead of tearing down the tick.
        let runner = self.isolated.clone();
        let job = job.clone();
        let turn = turn.clone();
        let task = tokio::spawn(async move { runner.run_isolated(&job, &turn).await });

        match task.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ExecutionOutcome::failed(format!("{e:#}")),
            Err(e) => {
                warn!("Isolated run panicked: {e}");
                ExecutionOutcome::failed(format!("runner panicked: {e}"))
            }
        }
    }

    async fn deliver_attached(&self, job: &CronJob) -> ExecutionOutcome {
        let session = job.session_ref();
        let text = job.payload.text().to_string();
        let event = SystemEvent {
            job_id: job.id.clone(),
            session: session.clone(),
            text,
            enqueued_at: Utc::now().timestamp_millis(),
        };

        if let Err(e) = self.bridge.enqueue_system_event(event).await {
            return ExecutionOutcome::failed(format!("failed to enqueue system event: {e:#}"));
        }

        match job.wake_mode {
            WakeMode::NextHeartbeat => {
                ExecutionOutcome::ok("system event queued for next heartbeat")
            }
            WakeMode::Now => match self.bridge.request_heartbeat_now(&session).await {
                Ok(()) => ExecutionOutcome::ok("system event queued, heartbeat requested"),
                Err(e) => {
                    debug!(job_id = %job.id, "Heartbeat request failed: {e:#}");
                    ExecutionOutcome::failed(format!(
                        "system event queued but heartbeat request failed: {e:#}"
                    ))
                }
            },
        }
    }
}
