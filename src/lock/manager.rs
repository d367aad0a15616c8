// ABOUTME: File-backed lock manager for task directories shared across processes.
// ABOUTME: Provides acquire, release, inspection, and stale-lock reclamation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_LOCK_STALE_AFTER, is_stale};
use crate::error::LockError;

/// Name of the lock record inside a task directory.
pub const LOCK_FILE_NAME: &str = ".lock";

/// The on-disk lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub lock_id: String,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
}

impl LockInfo {
    fn new(tool: &str) -> Self {
        Self {
            pid: std::process::id(),
            lock_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tool: tool.to_string(),
        }
    }
}

/// Outcome of an acquisition attempt. Contention is `acquired: false`, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockAcquisition {
    pub acquired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of a release attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRelease {
    pub released: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Current state of a task directory's lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub is_locked: bool,
    pub is_stale: bool,
    pub lock_info: Option<LockInfo>,
}

impl LockStatus {
    fn unlocked() -> Self {
        Self {
            is_locked: false,
            is_stale: false,
            lock_info: None,
        }
    }
}

/// Advisory lock manager for task directories.
///
/// # Lock Semantics
///
/// - **Exclusive publish:** a lock record is written to a private temp file and
///   hard-linked into place. Linking fails if a lock already exists, so two
///   processes racing on the same directory cannot both succeed and a reader
///   never observes a half-written record.
/// - **Staleness:** a record older than `stale_after` is presumed abandoned. It
///   is removed and acquisition retried once.
/// - **Ownership:** release only removes a record whose `lockId` matches.
///
/// Locks are advisory; code that skips acquisition can still touch the files.
#[derive(Debug, Clone)]
pub struct LockManager {
    stale_after: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_STALE_AFTER)
    }
}

impl LockManager {
    /// Create a lock manager with the given staleness threshold.
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    /// The staleness threshold used for acquisition and cleanup.
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Try to acquire the lock for `task_dir` on behalf of `tool`.
    ///
    /// Returns `acquired: false` with a reason if another live holder owns it.
    pub async fn acquire_lock(
        &self,
        task_dir: &Path,
        tool: &str,
    ) -> Result<LockAcquisition, LockError> {
        for attempt in 0..2 {
            if let Some(info) = publish(task_dir, tool).await? {
                tracing::debug!(dir = %task_dir.display(), tool, lock_id = %info.lock_id, "lock acquired");
                return Ok(LockAcquisition {
                    acquired: true,
                    lock_id: Some(info.lock_id),
                    reason: None,
                });
            }

            let status = self.check_lock(task_dir).await?;
            let observed = status.lock_info.as_ref().map(|info| info.lock_id.clone());
            match status.lock_info {
                Some(info) if !status.is_stale => {
                    return Ok(LockAcquisition {
                        acquired: false,
                        lock_id: None,
                        reason: Some(format!(
                            "locked by {} (pid {}) since {}",
                            info.tool,
                            info.pid,
                            info.timestamp.to_rfc3339()
                        )),
                    });
                }
                Some(info) => {
                    tracing::warn!(
                        dir = %task_dir.display(),
                        holder = %info.tool,
                        pid = info.pid,
                        "reclaiming stale lock"
                    );
                }
                // Vanished or unreadable: nothing live to respect.
                None => {}
            }

            if attempt == 0 {
                remove_if_unchanged(task_dir, observed.as_deref()).await?;
            }
        }

        Ok(LockAcquisition {
            acquired: false,
            lock_id: None,
            reason: Some("lock contended during stale reclamation".to_string()),
        })
    }

    /// Release the lock for `task_dir` if `lock_id` owns it.
    pub async fn release_lock(
        &self,
        task_dir: &Path,
        lock_id: &str,
    ) -> Result<LockRelease, LockError> {
        let path = task_dir.join(LOCK_FILE_NAME);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(LockRelease {
                    released: true,
                    reason: Some("already released".to_string()),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let owner = match serde_json::from_slice::<LockInfo>(&raw) {
            Ok(info) => info,
            Err(_) => {
                return Ok(LockRelease {
                    released: false,
                    reason: Some("lock file unreadable".to_string()),
                });
            }
        };

        if owner.lock_id != lock_id {
            return Ok(LockRelease {
                released: false,
                reason: Some("not owner".to_string()),
            });
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(dir = %task_dir.display(), lock_id, "lock released");

        Ok(LockRelease {
            released: true,
            reason: None,
        })
    }

    /// Inspect the lock for `task_dir`. Malformed records read as unlocked.
    pub async fn check_lock(&self, task_dir: &Path) -> Result<LockStatus, LockError> {
        let raw = match tokio::fs::read(task_dir.join(LOCK_FILE_NAME)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockStatus::unlocked()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<LockInfo>(&raw) {
            Ok(info) => Ok(LockStatus {
                is_locked: true,
                is_stale: is_stale(Utc::now(), info.timestamp, self.stale_after),
                lock_info: Some(info),
            }),
            Err(_) => Ok(LockStatus::unlocked()),
        }
    }

    /// Remove every stale lock under `directory`, along with staging files
    /// left behind by publishers that died between write and link.
    ///
    /// Unreadable files and removal failures are skipped. A lock replaced
    /// after it was judged stale is kept. Returns the paths actually removed.
    pub async fn cleanup_stale_locks(&self, directory: &Path) -> Result<Vec<PathBuf>, LockError> {
        let root = directory.to_path_buf();
        let candidates = tokio::task::spawn_blocking(move || find_lock_files(&root))
            .await
            .map_err(|e| LockError::Scan(e.to_string()))?;

        let now = Utc::now();
        let mut removed = Vec::new();
        for path in candidates {
            let result = if is_staging_file(&path) {
                self.sweep_staging_file(&path, now).await
            } else {
                self.sweep_lock_file(&path, now).await
            };
            match result {
                Ok(true) => removed.push(path),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to sweep lock file");
                }
            }
        }

        Ok(removed)
    }

    async fn sweep_lock_file(&self, path: &Path, now: DateTime<Utc>) -> Result<bool, LockError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let Ok(info) = serde_json::from_slice::<LockInfo>(&raw) else {
            return Ok(false);
        };
        if !is_stale(now, info.timestamp, self.stale_after) {
            return Ok(false);
        }

        let Some(task_dir) = path.parent() else {
            return Ok(false);
        };
        let removed = remove_if_unchanged(task_dir, Some(info.lock_id.as_str())).await?;
        if removed {
            tracing::info!(path = %path.display(), holder = %info.tool, "removed stale lock");
        }
        Ok(removed)
    }

    async fn sweep_staging_file(&self, path: &Path, now: DateTime<Utc>) -> Result<bool, LockError> {
        let modified = match tokio::fs::metadata(path).await {
            Ok(meta) => DateTime::<Utc>::from(meta.modified()?),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !is_stale(now, modified, self.stale_after) {
            return Ok(false);
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "removed abandoned lock staging file");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write a fresh record and link it into place. `None` means a lock already exists.
async fn publish(task_dir: &Path, tool: &str) -> Result<Option<LockInfo>, LockError> {
    let info = LockInfo::new(tool);
    let staging = task_dir.join(format!("{}.{}.tmp", LOCK_FILE_NAME, info.lock_id));
    tokio::fs::write(&staging, serde_json::to_vec(&info)?).await?;

    let linked = tokio::fs::hard_link(&staging, task_dir.join(LOCK_FILE_NAME)).await;
    if let Err(e) = tokio::fs::remove_file(&staging).await {
        tracing::debug!(path = %staging.display(), error = %e, "failed to remove lock staging file");
    }

    match linked {
        Ok(()) => Ok(Some(info)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove the lock record only if it still carries the `lockId` observed when
/// it was judged stale (or is still unreadable when `observed` is `None`).
/// Returns whether a record was removed.
pub(super) async fn remove_if_unchanged(
    task_dir: &Path,
    observed: Option<&str>,
) -> Result<bool, LockError> {
    let path = task_dir.join(LOCK_FILE_NAME);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let current = serde_json::from_slice::<LockInfo>(&raw)
        .ok()
        .map(|info| info.lock_id);
    if current.as_deref() != observed {
        return Ok(false);
    }

    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Matches `.lock.<lockId>.tmp` as written by [`publish`].
fn is_staging_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(LOCK_FILE_NAME))
        .is_some_and(|rest| rest.starts_with('.') && rest.ends_with(".tmp"))
}

fn find_lock_files(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| {
            entry.file_type().is_file()
                && (entry.file_name() == LOCK_FILE_NAME || is_staging_file(entry.path()))
        })
        .map(|entry| entry.into_path())
        .collect()
}
