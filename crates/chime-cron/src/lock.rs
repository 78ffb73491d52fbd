//! File mutex: a sidecar `<store>.lock` file claiming exclusive access to one
//! store file.
//!
//! The lock file holds `{pid, startedAt}`. A holder that crashes leaves the
//! file behind; once `startedAt` (or the file mtime, if the content is
//! unreadable) is older than the staleness threshold, the next caller
//! reclaims it. Every process sharing a store path must use the same file
//! shape and threshold.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CronError, Result};

/// Delay between acquisition attempts while the lock is busy.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Contents of a lock file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    /// Acquisition (or last keepalive) time, unix millis.
    pub started_at: i64,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: now_ms(),
        }
    }

    /// Whether the holder has kept the lock longer than `threshold`.
    pub fn is_stale(&self, threshold: Duration, now_ms: i64) -> bool {
        let age_ms = now_ms.saturating_sub(self.started_at);
        age_ms > duration_ms(threshold)
    }
}

/// Path of the lock file guarding `store_path`.
pub fn lock_path_for(store_path: &Path) -> PathBuf {
    let mut os = store_path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// A held store lock.
///
/// Call [`FileLock::release`] when the critical section ends. A lock dropped
/// without release (an early `?` return, a panic) removes its file
/// synchronously, as long as the file still belongs to this holder.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    pid: u32,
    /// `startedAt` last written by this holder; identifies our file.
    stamp: Arc<AtomicI64>,
    keepalive: Option<(CancellationToken, JoinHandle<()>)>,
    released: bool,
}

impl FileLock {
    fn held(path: PathBuf, info: LockInfo) -> Self {
        Self {
            path,
            pid: info.pid,
            stamp: Arc::new(AtomicI64::new(info.started_at)),
            keepalive: None,
            released: false,
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What this holder last wrote into the lock file.
    pub fn info(&self) -> LockInfo {
        LockInfo {
            pid: self.pid,
            started_at: self.stamp.load(Ordering::SeqCst),
        }
    }

    /// Refresh `startedAt` every `every` until release, so a critical section
    /// that outlives the staleness threshold is not reclaimed underneath us.
    pub fn keep_alive(&mut self, every: Duration) {
        if self.keepalive.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let cancel = token.clone();
        let path = self.path.clone();
        let pid = self.pid;
        let stamp = self.stamp.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                if let Err(e) = refresh(&path, pid, &stamp).await {
                    warn!(path = %path.display(), "Failed to refresh lock file: {e}");
                }
            }
        });
        self.keepalive = Some((token, handle));
    }

    /// Release the lock, deleting the lock file if it is still ours.
    pub async fn release(mut self) -> Result<()> {
        if let Some((token, handle)) = self.keepalive.take() {
            token.cancel();
            let _ = handle.await;
        }
        let owned = self.info();
        let result = match read_holder(&self.path).await {
            Ok(Some(current)) if current == owned => {
                match tokio::fs::remove_file(&self.path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Ok(_) => {
                debug!(path = %self.path.display(), "Lock file no longer ours, leaving it");
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        self.released = true;
        debug!(path = %self.path.display(), "Store lock released");
        result
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some((token, handle)) = self.keepalive.take() {
            token.cancel();
            handle.abort();
        }
        let owned = self.info();
        let still_ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LockInfo>(&raw).ok())
            .is_some_and(|current| current == owned);
        if still_ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "Failed to remove dropped lock file: {e}");
            }
        }
    }
}

/// Acquire the lock guarding `store_path`, waiting up to `timeout`.
///
/// Fails with [`CronError::LockTimeout`] when a live holder keeps the lock
/// for the whole wait.
pub async fn acquire(store_path: &Path, timeout: Duration, stale: Duration) -> Result<FileLock> {
    let lock_path = lock_path_for(store_path);
    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let start = Instant::now();
    loop {
        if let Some(lock) = try_acquire_once(&lock_path, stale).await? {
            return Ok(lock);
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(CronError::LockTimeout {
                path: lock_path.display().to_string(),
                waited_ms: duration_ms(waited).unsigned_abs(),
            });
        }
        tokio::time::sleep(LOCK_POLL_INTERVAL.min(timeout - waited)).await;
    }
}

/// Like [`acquire`], but gives up quietly after `bound`.
///
/// This is the read-path primitive: callers fall back to cached data instead
/// of waiting behind a long critical section.
pub async fn try_acquire_within(
    store_path: &Path,
    bound: Duration,
    stale: Duration,
) -> Option<FileLock> {
    match acquire(store_path, bound, stale).await {
        Ok(lock) => Some(lock),
        Err(e) if e.is_timeout() => None,
        Err(e) => {
            warn!(store = %store_path.display(), "Lock attempt failed: {e}");
            None
        }
    }
}

async fn try_acquire_once(lock_path: &Path, stale: Duration) -> Result<Option<FileLock>> {
    if let Some(lock) = create_lock_file(lock_path).await? {
        return Ok(Some(lock));
    }

    let Some(existing) = read_holder(lock_path).await? else {
        // Released between our attempt and the read.
        return create_lock_file(lock_path).await;
    };
    if !existing.is_stale(stale, now_ms()) {
        return Ok(None);
    }

    reclaim_stale(lock_path, existing, stale).await
}

/// Replace a stale lock file with our own.
///
/// Reclaimers serialize on a `<lock>.reclaim` guard, so the re-read of the
/// holder and the removal cannot interleave with another reclaimer replacing
/// the file. A guard left behind by a crash is cleared once older than
/// `stale`; only that crash case leaves a window.
async fn reclaim_stale(
    lock_path: &Path,
    existing: LockInfo,
    stale: Duration,
) -> Result<Option<FileLock>> {
    let guard_path = reclaim_guard_path(lock_path);
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&guard_path)
        .await
    {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            clear_abandoned_guard(&guard_path, stale).await;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let result = replace_stale(lock_path, existing).await;
    match tokio::fs::remove_file(&guard_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %guard_path.display(), "Failed to remove reclaim guard: {e}"),
    }
    result
}

async fn replace_stale(lock_path: &Path, existing: LockInfo) -> Result<Option<FileLock>> {
    // Only remove the file we judged stale, not one a faster reclaimer
    // has already replaced.
    if read_holder(lock_path).await? != Some(existing) {
        return Ok(None);
    }
    warn!(
        path = %lock_path.display(),
        pid = existing.pid,
        started_at = existing.started_at,
        "Reclaiming stale store lock"
    );
    match tokio::fs::remove_file(lock_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    create_lock_file(lock_path).await
}

fn reclaim_guard_path(lock_path: &Path) -> PathBuf {
    let mut os = lock_path.as_os_str().to_owned();
    os.push(".reclaim");
    PathBuf::from(os)
}

async fn clear_abandoned_guard(guard_path: &Path, stale: Duration) {
    let Ok(modified) = tokio::fs::metadata(guard_path)
        .await
        .and_then(|meta| meta.modified())
    else {
        return;
    };
    let age_ms = now_ms().saturating_sub(system_time_ms(modified));
    if age_ms > duration_ms(stale) {
        warn!(path = %guard_path.display(), "Removing abandoned reclaim guard");
        let _ = tokio::fs::remove_file(guard_path).await;
    }
}

/// Atomically create the lock file. `None` if it already exists.
async fn create_lock_file(lock_path: &Path) -> Result<Option<FileLock>> {
    let info = LockInfo::current();
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = write_info(&mut file, &info).await {
        let _ = tokio::fs::remove_file(lock_path).await;
        return Err(e.into());
    }
    debug!(path = %lock_path.display(), pid = info.pid, "Store lock acquired");
    Ok(Some(FileLock::held(lock_path.to_path_buf(), info)))
}

async fn write_info(file: &mut tokio::fs::File, info: &LockInfo) -> std::io::Result<()> {
    let body = serde_json::to_vec(info).map_err(std::io::Error::other)?;
    file.write_all(&body).await?;
    file.flush().await
}

/// Read the current holder. Unparseable content (e.g. a file caught
/// mid-write) is dated by its mtime.
async fn read_holder(lock_path: &Path) -> std::io::Result<Option<LockInfo>> {
    let raw = match tokio::fs::read_to_string(lock_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if let Ok(info) = serde_json::from_str::<LockInfo>(&raw) {
        return Ok(Some(info));
    }

    let started_at = match tokio::fs::metadata(lock_path).await {
        Ok(meta) => meta.modified().map(system_time_ms).unwrap_or_else(|_| now_ms()),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(LockInfo { pid: 0, started_at }))
}

async fn refresh(path: &Path, pid: u32, stamp: &AtomicI64) -> std::io::Result<()> {
    let owned = LockInfo {
        pid,
        started_at: stamp.load(Ordering::SeqCst),
    };
    if read_holder(path).await? != Some(owned) {
        return Ok(());
    }

    let next = LockInfo {
        pid,
        started_at: now_ms(),
    };
    // No `create`: a lock released meanwhile must stay released.
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    write_info(&mut file, &next).await?;
    stamp.store(next.started_at, Ordering::SeqCst);
    Ok(())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn system_time_ms(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(30);

    fn write_lock(store: &Path, info: LockInfo) {
        std::fs::write(lock_path_for(store), serde_json::to_vec(&info).unwrap()).unwrap();
    }

    #[test]
    fn test_lock_path_for() {
        let path = lock_path_for(Path::new("/data/cron/jobs.json"));
        assert_eq!(path, PathBuf::from("/data/cron/jobs.json.lock"));
    }

    #[test]
    fn test_is_stale() {
        let info = LockInfo {
            pid: 1,
            started_at: 1_000,
        };
        assert!(!info.is_stale(Duration::from_millis(500), 1_400));
        assert!(info.is_stale(Duration::from_millis(500), 1_600));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("cron").join("jobs.json");

        let lock = acquire(&store, Duration::from_secs(1), STALE).await.unwrap();
        let raw = std::fs::read_to_string(lock_path_for(&store)).unwrap();
        let info: LockInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info, lock.info());

        lock.release().await.unwrap();
        assert!(!lock_path_for(&store).exists());
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        let held = acquire(&store, Duration::from_secs(1), STALE).await.unwrap();

        let start = Instant::now();
        let err = acquire(&store, Duration::from_millis(300), STALE)
            .await
            .unwrap_err();
        let waited = start.elapsed();
        assert!(err.is_timeout(), "{err}");
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_secs(2));

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_try_acquire_within_returns_none_while_held() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        let held = acquire(&store, Duration::from_secs(1), STALE).await.unwrap();

        let attempt = try_acquire_within(&store, Duration::from_millis(100), STALE).await;
        assert!(attempt.is_none());

        held.release().await.unwrap();
        let lock = try_acquire_within(&store, Duration::from_millis(100), STALE).await;
        assert!(lock.is_some());
        lock.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        let held = acquire(&store, Duration::from_secs(1), STALE).await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            held.release().await.unwrap();
        });

        let lock = acquire(&store, Duration::from_secs(5), STALE).await.unwrap();
        releaser.await.unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        write_lock(
            &store,
            LockInfo {
                pid: 999_999,
                started_at: now_ms() - 60_000,
            },
        );

        let start = Instant::now();
        let lock = acquire(&store, Duration::from_secs(5), STALE).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(lock.info().pid, std::process::id());
        lock.release().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reclaimers_stay_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("jobs.json");
        let abandoned = LockInfo {
            pid: 999_999,
            started_at: now_ms() - 60_000,
        };
        std::fs::write(
            lock_path_for(&store),
            serde_json::to_string(&abandoned).unwrap(),
        )
        .unwrap();

        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let overlap = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let inside = inside.clone();
            let overlap = overlap.clone();
            tasks.push(tokio::spawn(async move {
                let lock = acquire(&store, Duration::from_secs(5), STALE).await.unwrap();
                if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.release().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(!overlap.load(Ordering::SeqCst));
        assert!(!lock_path_for(&store).exists());
        assert!(!reclaim_guard_path(&lock_path_for(&store)).exists());
    }

    #[tokio::test]
    async fn test_abandoned_reclaim_guard_is_cleared() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("jobs.json");
        let lock_path = lock_path_for(&store);
        let abandoned = LockInfo {
            pid: 999_999,
            started_at: now_ms() - 60_000,
        };
        std::fs::write(&lock_path, serde_json::to_string(&abandoned).unwrap()).unwrap();
        std::fs::write(reclaim_guard_path(&lock_path), "").unwrap();

        let stale = Duration::from_millis(100);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let lock = acquire(&store, Duration::from_secs(2), stale).await.unwrap();
        assert_eq!(lock.info().pid, std::process::id());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_foreign_lock_is_respected() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        write_lock(
            &store,
            LockInfo {
                pid: 999_999,
                started_at: now_ms(),
            },
        );

        let err = acquire(&store, Duration::from_millis(150), STALE)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(lock_path_for(&store).exists());
    }

    #[tokio::test]
    async fn test_unreadable_lock_dated_by_mtime() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        std::fs::write(lock_path_for(&store), "not json").unwrap();

        // Just written, so not stale.
        let attempt = try_acquire_within(&store, Duration::from_millis(100), STALE).await;
        assert!(attempt.is_none());

        // With a tiny threshold it is.
        let lock = try_acquire_within(&store, Duration::from_secs(2), Duration::from_millis(50))
            .await
            .unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_file() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        let lock = acquire(&store, Duration::from_secs(1), STALE).await.unwrap();

        // Someone reclaimed it meanwhile.
        let foreign = LockInfo {
            pid: 42,
            started_at: now_ms() + 1,
        };
        write_lock(&store, foreign);

        lock.release().await.unwrap();
        let raw = std::fs::read_to_string(lock_path_for(&store)).unwrap();
        let info: LockInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info, foreign);
    }

    #[tokio::test]
    async fn test_drop_removes_lock_file() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        {
            let _lock = acquire(&store, Duration::from_secs(1), STALE).await.unwrap();
            assert!(lock_path_for(&store).exists());
        }
        assert!(!lock_path_for(&store).exists());
    }

    #[tokio::test]
    async fn test_keep_alive_prevents_reclaim() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("jobs.json");
        let stale = Duration::from_millis(300);

        let mut lock = acquire(&store, Duration::from_secs(1), stale).await.unwrap();
        let first = lock.info().started_at;
        lock.keep_alive(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(600)).await;

        let attempt = try_acquire_within(&store, Duration::from_millis(100), stale).await;
        assert!(attempt.is_none(), "held lock must not look stale");
        assert!(lock.info().started_at > first);

        lock.release().await.unwrap();
        assert!(!lock_path_for(&store).exists());
    }
}
