//! JSON-file cron job storage.
//!
//! The whole job set lives in one file, rewritten atomically on every
//! change. Cross-process exclusion comes from the sidecar lock in
//! [`crate::lock`]; use [`CronStore::lock`] or [`CronStore::with_lock`]
//! for anything that reads, modifies and writes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::CronJob;
use crate::error::Result;
use crate::lock::{self, FileLock};
use crate::schedule;

const STORE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STORE_VERSION
}

/// On-disk shape of the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            jobs: Vec::new(),
        }
    }
}

impl StoreFile {
    pub fn find(&self, id: &str) -> Option<&CronJob> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut CronJob> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    /// Remove a job by ID, returning it if present.
    pub fn remove(&mut self, id: &str) -> Option<CronJob> {
        let idx = self.jobs.iter().position(|job| job.id == id)?;
        Some(self.jobs.remove(idx))
    }
}

/// Persistent storage for cron jobs.
#[derive(Debug)]
pub struct CronStore {
    path: PathBuf,
    stale: Duration,
}

impl CronStore {
    /// Open a store at `path`. Nothing touches disk until the first load/save.
    pub fn new(path: impl Into<PathBuf>, stale: Duration) -> Self {
        Self {
            path: path.into(),
            stale,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        lock::lock_path_for(&self.path)
    }

    /// Read the store. A missing or unparseable file reads as empty.
    pub async fn load(&self) -> Result<StoreFile> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(StoreFile::default());
        }
        match serde_json::from_str::<StoreFile>(&raw) {
            Ok(mut file) => {
                // `nextRunAt` is derived; never trust the persisted value.
                for job in &mut file.jobs {
                    job.next_run_at = schedule::next_run_at(job);
                }
                Ok(file)
            }
            Err(e) => {
                warn!(path = %self.path.display(), "Corrupt cron store, treating as empty: {e}");
                Ok(StoreFile::default())
            }
        }
    }

    /// Write the store via a temp file and rename.
    pub async fn save(&self, file: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(file)?;

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(format!(".{}.tmp", Uuid::new_v4()));
        let tmp = PathBuf::from(tmp);

        if let Err(e) = tokio::fs::write(&tmp, json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), jobs = file.jobs.len(), "Cron store saved");
        Ok(())
    }

    /// Take the store lock, waiting up to `timeout`, and load the jobs.
    pub async fn lock(&self, timeout: Duration) -> Result<LockedStore<'_>> {
        let lock = lock::acquire(&self.path, timeout, self.stale).await?;
        self.loaded(lock).await
    }

    /// Take the store lock only if it frees up within `bound`.
    pub async fn try_lock_within(&self, bound: Duration) -> Option<LockedStore<'_>> {
        let lock = lock::try_acquire_within(&self.path, bound, self.stale).await?;
        match self.loaded(lock).await {
            Ok(locked) => Some(locked),
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to read cron store: {e}");
                None
            }
        }
    }

    /// Run `f` against the locked store and save it if `f` succeeds.
    pub async fn with_lock<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut StoreFile) -> Result<T>,
    ) -> Result<(T, StoreFile)> {
        let mut locked = self.lock(timeout).await?;
        let value = match f(&mut locked.file) {
            Ok(value) => value,
            Err(e) => {
                locked.release().await?;
                return Err(e);
            }
        };
        locked.persist().await?;
        let file = locked.release().await?;
        Ok((value, file))
    }

    async fn loaded(&self, lock: FileLock) -> Result<LockedStore<'_>> {
        // On error the lock drops here and cleans up its file.
        let file = self.load().await?;
        Ok(LockedStore {
            store: self,
            lock,
            file,
        })
    }
}

/// The store contents, held under the store lock.
#[derive(Debug)]
pub struct LockedStore<'a> {
    store: &'a CronStore,
    lock: FileLock,
    pub file: StoreFile,
}

impl LockedStore<'_> {
    /// Write the current contents without giving up the lock.
    pub async fn persist(&self) -> Result<()> {
        self.store.save(&self.file).await
    }

    /// Keep the lock fresh while a long critical section runs.
    pub fn keep_alive(&mut self, every: Duration) {
        self.lock.keep_alive(every);
    }

    /// Give up the lock, returning the last contents seen under it.
    pub async fn release(self) -> Result<StoreFile> {
        self.lock.release().await?;
        Ok(self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CronError;
    use crate::{AgentTurn, CronJobCreate, CronPayload, CronSchedule};
    use chime_types::SessionTarget;
    use chrono::Utc;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(30);

    fn sample_job(name: &str) -> CronJob {
        let spec = CronJobCreate::new(
            name,
            CronSchedule::At { at: Utc::now() },
            SessionTarget::Isolated,
            CronPayload::AgentTurn(AgentTurn {
                message: "hi".into(),
                model: None,
                timeout_seconds: None,
            }),
        );
        CronJob::from_create(spec, Utc::now())
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::new(dir.path().join("jobs.json"), STALE);
        let file = store.load().await.unwrap();
        assert!(file.jobs.is_empty());
        assert_eq!(file.version, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let store = CronStore::new(&path, STALE);
        assert!(store.load().await.unwrap().jobs.is_empty());
    }

    #[tokio::test]
    async fn test_load_rederives_next_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let json = r#"{
            "version": 1,
            "jobs": [{
                "id": "pending",
                "name": "pending",
                "schedule": {"kind": "at", "at": "2020-01-01T00:00:00Z"},
                "sessionTarget": "isolated",
                "payload": {"kind": "agentTurn", "message": "hi"},
                "createdAt": "2019-12-31T00:00:00Z",
                "updatedAt": "2019-12-31T00:00:00Z"
            }, {
                "id": "serviced",
                "name": "serviced",
                "schedule": {"kind": "at", "at": "2020-01-01T00:00:00Z"},
                "sessionTarget": "isolated",
                "payload": {"kind": "agentTurn", "message": "hi"},
                "createdAt": "2019-12-31T00:00:00Z",
                "updatedAt": "2019-12-31T00:00:00Z",
                "nextRunAt": "2020-01-01T00:00:00Z",
                "lastRunAt": "2020-01-01T00:00:05Z"
            }]
        }"#;
        tokio::fs::write(&path, json).await.unwrap();

        let file = CronStore::new(&path, STALE).load().await.unwrap();
        let pending = file.find("pending").unwrap();
        assert_eq!(
            pending.next_run_at.map(|t| t.to_rfc3339()),
            Some("2020-01-01T00:00:00+00:00".to_string())
        );
        assert_eq!(file.find("serviced").unwrap().next_run_at, None);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::new(dir.path().join("nested").join("jobs.json"), STALE);

        let mut file = StoreFile::default();
        file.jobs.push(sample_job("one"));
        file.jobs.push(sample_job("two"));
        store.save(&file).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, file);

        // No temp files left behind.
        let mut entries = tokio::fs::read_dir(dir.path().join("nested")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["jobs.json".to_string()]);
    }

    #[tokio::test]
    async fn test_with_lock_persists_on_success() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::new(dir.path().join("jobs.json"), STALE);

        let job = sample_job("one");
        let id = job.id.clone();
        let (_, file) = store
            .with_lock(Duration::from_secs(1), |file| {
                file.jobs.push(job);
                Ok(())
            })
            .await
            .unwrap();
        assert!(file.find(&id).is_some());
        assert!(store.load().await.unwrap().find(&id).is_some());
        assert!(!store.lock_path().exists());
    }

    #[tokio::test]
    async fn test_with_lock_discards_on_error() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::new(dir.path().join("jobs.json"), STALE);

        let err = store
            .with_lock(Duration::from_secs(1), |file| -> Result<()> {
                file.jobs.push(sample_job("one"));
                Err(CronError::JobNotFound("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::JobNotFound(_)));
        assert!(store.load().await.unwrap().jobs.is_empty());
        assert!(!store.lock_path().exists());
    }

    #[tokio::test]
    async fn test_try_lock_within_gives_up_while_held() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::new(dir.path().join("jobs.json"), STALE);

        let held = store.lock(Duration::from_secs(1)).await.unwrap();
        assert!(
            store
                .try_lock_within(Duration::from_millis(100))
                .await
                .is_none()
        );
        held.release().await.unwrap();
        assert!(
            store
                .try_lock_within(Duration::from_millis(100))
                .await
                .is_some()
        );
    }

    #[test]
    fn test_store_file_remove() {
        let mut file = StoreFile::default();
        let job = sample_job("one");
        let id = job.id.clone();
        file.jobs.push(job);
        assert!(file.remove("missing").is_none());
        assert_eq!(file.remove(&id).map(|j| j.name), Some("one".to_string()));
        assert!(file.jobs.is_empty());
    }
}
