use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    /// Another holder kept the store lock past the wait bound.
    #[error("lock timeout: {path} still held after {waited_ms}ms")]
    LockTimeout { path: String, waited_ms: u64 },
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CronError {
    /// Whether this error means "busy" rather than "broken".
    pub fn is_timeout(&self) -> bool {
        matches!(self, CronError::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
