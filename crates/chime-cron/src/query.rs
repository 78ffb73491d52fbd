//! Read-side of the service: `status` and `list`.
//!
//! Reads take the store lock only if it frees up within a short bound. When
//! a long execution holds it, they answer from the last snapshot any
//! operation on this instance observed, flagged `stale`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::CronJob;
use crate::store::{CronStore, StoreFile};

/// Summary of the scheduler state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub store_path: PathBuf,
    pub jobs: usize,
    pub enabled_jobs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_wake_at: Option<DateTime<Utc>>,
    /// Answered from a cached snapshot because the store was busy.
    pub stale: bool,
}

/// A view of the store plus whether it came from the cache.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub file: StoreFile,
    pub stale: bool,
}

pub struct QueryFacade {
    store: Arc<CronStore>,
    read_timeout: Duration,
    cache: RwLock<StoreFile>,
}

impl QueryFacade {
    pub fn new(store: Arc<CronStore>, read_timeout: Duration) -> Self {
        Self {
            store,
            read_timeout,
            cache: RwLock::new(StoreFile::default()),
        }
    }

    /// Fresh store contents if the lock frees up in time, otherwise the cache.
    pub async fn snapshot(&self) -> Snapshot {
        if let Some(locked) = self.store.try_lock_within(self.read_timeout).await {
            match locked.release().await {
                Ok(file) => {
                    self.remember(&file).await;
                    return Snapshot { file, stale: false };
                }
                Err(e) => warn!("Failed to release store lock after read: {e}"),
            }
        }
        debug!(
            path = %self.store.path().display(),
            "Store busy, answering from cached snapshot"
        );
        Snapshot {
            file: self.cache.read().await.clone(),
            stale: true,
        }
    }

    /// Record contents observed under the lock.
    pub async fn remember(&self, file: &StoreFile) {
        *self.cache.write().await = file.clone();
    }

    pub async fn status(&self, enabled: bool) -> SchedulerStatus {
        let Snapshot { file, stale } = self.snapshot().await;
        let next_wake_at = if enabled {
            file.jobs
                .iter()
                .filter(|job| job.enabled)
                .filter_map(|job| job.next_run_at)
                .min()
        } else {
            None
        };
        SchedulerStatus {
            enabled,
            store_path: self.store.path().to_path_buf(),
            jobs: file.jobs.len(),
            enabled_jobs: file.jobs.iter().filter(|job| job.enabled).count(),
            next_wake_at,
            stale,
        }
    }

    /// Jobs ordered by next run, jobs with nothing pending last.
    pub async fn list(&self, include_disabled: bool) -> Vec<CronJob> {
        let mut jobs: Vec<CronJob> = self
            .snapshot()
            .await
            .file
            .jobs
            .into_iter()
            .filter(|job| include_disabled || job.enabled)
            .collect();
        jobs.sort_by(|a, b| match (a.next_run_at, b.next_run_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.created_at.cmp(&b.created_at),
        });
        jobs
    }
}
