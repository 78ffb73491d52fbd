use std::fmt;

use serde::{Deserialize, Serialize};

// ──────────────────── Session Types ────────────────────

/// Where a scheduled job is executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    /// Run in a fresh, throwaway agent context.
    Isolated,
    /// Deliver into an existing, already-running session.
    #[serde(alias = "main")]
    Attached,
}

impl SessionTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Attached => "attached",
        }
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an attached session learns about a delivered event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    /// The event is picked up the next time the session wakes on its own.
    #[default]
    NextHeartbeat,
    /// The session is asked to wake immediately.
    Now,
}

/// Identifies the session an attached job is delivered into.
///
/// Both fields are optional: an empty reference means "the agent's main
/// session", which the session layer resolves.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    /// Agent owning the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Session key within that agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Event enqueued into a live session by an attached job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    /// Job that produced this event.
    pub job_id: String,
    /// Target session.
    pub session: SessionRef,
    /// Event text handed to the agent.
    pub text: String,
    /// Enqueue timestamp (unix millis).
    pub enqueued_at: i64,
}

// ──────────────────── Run Types ────────────────────

/// Outcome of a single job execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Failed,
    /// The job could not be dispatched (e.g. payload does not fit the target).
    Skipped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
