//! Per-job run history, one JSONL file per job under `<store dir>/runs/`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use chime_types::RunStatus;

use crate::error::Result;

/// One finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub job_id: String,
    pub run_at: DateTime<Utc>,
    pub status: RunStatus,
    pub summary: String,
    pub duration_ms: u64,
    /// Started by an explicit force run rather than the timer.
    #[serde(default)]
    pub forced: bool,
}

/// Append-only run history with size-based pruning.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
    max_bytes: u64,
    keep_lines: usize,
}

impl RunLog {
    /// Run log stored next to `store_path`.
    pub fn for_store(store_path: &Path, max_bytes: u64, keep_lines: usize) -> Self {
        let dir = store_path
            .parent()
            .map(|p| p.join("runs"))
            .unwrap_or_else(|| PathBuf::from("runs"));
        Self {
            dir,
            max_bytes,
            keep_lines: keep_lines.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", file_stem(job_id)))
    }

    /// Append an entry, pruning the file to the newest `keep_lines` entries
    /// once it grows past `max_bytes`.
    pub async fn append(&self, entry: &RunLogEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&entry.job_id);

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        let size = tokio::fs::metadata(&path).await?.len();
        if size > self.max_bytes {
            self.prune(&path).await?;
        }
        Ok(())
    }

    async fn prune(&self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read_to_string(path).await?;
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let keep = &lines[lines.len().saturating_sub(self.keep_lines)..];

        let mut pruned = keep.join("\n");
        pruned.push('\n');
        tokio::fs::write(path, pruned).await?;
        debug!(
            path = %path.display(),
            dropped = lines.len() - keep.len(),
            "Pruned run log"
        );
        Ok(())
    }

    /// The newest `limit` entries for `job_id`, oldest first.
    pub async fn read(&self, job_id: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
        let raw = match tokio::fs::read_to_string(self.path_for(job_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<RunLogEntry> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    /// Delete the history of a removed job.
    pub async fn remove(&self, job_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keep job ids from escaping the runs directory.
fn file_stem(job_id: &str) -> String {
    job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
