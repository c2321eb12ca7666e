//! Per-target run lock that doubles as a live status feed.
//!
//! The lock file holds a JSON [`LockFileStatus`]. A lock whose recorded pid
//! is no longer running is considered abandoned and is reclaimed by the next
//! `acquire`, so a crashed run never needs manual cleanup.

use fs2::FileExt;
use guideforge_common::LockFileStatus;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{TargetConfig, write_atomic};
use crate::errors::OrchestratorError;

/// Answers "is this pid still running on this machine".
pub trait ProcessLivenessChecker: Send + Sync + std::fmt::Debug {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLivenessChecker;

impl ProcessLivenessChecker for OsLivenessChecker {
    fn is_alive(&self, pid: u32) -> bool {
        // pid 0 would address our own process group on unix.
        if pid == 0 {
            return false;
        }
        is_process_running(pid)
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) delivers nothing; it only reports whether the pid exists.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(code) if code == libc::EPERM
    )
}

#[cfg(windows)]
fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|o| {
            let out = String::from_utf8_lossy(&o.stdout);
            o.status.success() && !out.contains("INFO:") && out.contains(&pid.to_string())
        })
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
fn is_process_running(_pid: u32) -> bool {
    true
}

fn lock_io(path: &Path) -> impl FnOnce(std::io::Error) -> OrchestratorError + '_ {
    move |source| OrchestratorError::LockIo {
        path: path.to_path_buf(),
        source,
    }
}

fn read_status(path: &Path) -> Result<Option<LockFileStatus>, OrchestratorError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(lock_io(path)(e)),
    };
    match serde_json::from_str(&content) {
        Ok(status) => Ok(Some(status)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable lock file");
            Ok(None)
        }
    }
}

fn write_status(path: &Path, status: &LockFileStatus) -> Result<(), OrchestratorError> {
    let json = serde_json::to_vec_pretty(status)
        .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("Failed to serialize lock status: {}", e)))?;
    write_atomic(path, &json).map_err(lock_io(path))
}

/// Hands out [`LockGuard`]s, one live holder per target.
#[derive(Debug, Clone)]
pub struct LockFileManager {
    checker: Arc<dyn ProcessLivenessChecker>,
}

impl Default for LockFileManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockFileManager {
    pub fn new() -> Self {
        Self::with_checker(Arc::new(OsLivenessChecker))
    }

    pub fn with_checker(checker: Arc<dyn ProcessLivenessChecker>) -> Self {
        Self { checker }
    }

    /// Current lock contents, if any. Unreadable files read as `None`.
    pub fn read(&self, config: &TargetConfig) -> Result<Option<LockFileStatus>, OrchestratorError> {
        read_status(&config.layout().lock_file)
    }

    /// Whether the recorded owner of `status` is still running.
    pub fn is_live(&self, status: &LockFileStatus) -> bool {
        self.checker.is_alive(status.pid)
    }

    /// Take the lock for `config`.
    ///
    /// Fails with `DuplicateRun` iff an existing lock names a live pid.
    pub fn acquire(&self, config: &TargetConfig) -> Result<LockGuard, OrchestratorError> {
        let layout = config.layout();
        layout.ensure_directories()?;

        // Serialize concurrent acquirers so the check-then-write below is
        // atomic with respect to other processes.
        let latch_path = layout.root.join("run.lock.latch");
        let latch = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&latch_path)
            .map_err(lock_io(&latch_path))?;
        latch.lock_exclusive().map_err(lock_io(&latch_path))?;

        let result = self.acquire_locked(config, &layout.lock_file);

        if let Err(e) = FileExt::unlock(&latch) {
            debug!(error = %e, "Failed to unlock acquisition latch");
        }
        result
    }

    fn acquire_locked(
        &self,
        config: &TargetConfig,
        lock_path: &Path,
    ) -> Result<LockGuard, OrchestratorError> {
        if let Some(existing) = read_status(lock_path)? {
            if self.checker.is_alive(existing.pid) {
                return Err(OrchestratorError::DuplicateRun {
                    target: config.target_id.clone(),
                    pid: existing.pid,
                    run_id: existing.run_id,
                });
            }
            info!(
                target = %config.target_id,
                old_pid = existing.pid,
                old_run = %existing.run_id,
                "Reclaiming abandoned lock"
            );
        }

        let status = LockFileStatus::new(Uuid::new_v4(), std::process::id());
        write_status(lock_path, &status)?;
        debug!(target = %config.target_id, run_id = %status.run_id, "Lock acquired");

        Ok(LockGuard {
            path: lock_path.to_path_buf(),
            status,
            released: false,
        })
    }
}

/// Proof of holding a target's lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    status: LockFileStatus,
    released: bool,
}

impl LockGuard {
    pub fn run_id(&self) -> Uuid {
        self.status.run_id
    }

    pub fn status(&self) -> &LockFileStatus {
        &self.status
    }

    /// Mutate the status record and persist it immediately.
    pub fn update<F>(&mut self, f: F) -> Result<(), OrchestratorError>
    where
        F: FnOnce(&mut LockFileStatus),
    {
        f(&mut self.status);
        self.status.touch();
        write_status(&self.path, &self.status)
    }

    /// Delete the lock file if it still belongs to this run.
    pub fn release(mut self) -> Result<(), OrchestratorError> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> Result<(), OrchestratorError> {
        match read_status(&self.path)? {
            Some(current) if current.run_id != self.status.run_id => {
                warn!(path = %self.path.display(), "Lock now owned by another run; leaving it");
                Ok(())
            }
            _ => match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(lock_io(&self.path)(e)),
            },
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.remove_if_owned()
        {
            warn!(error = %e, "Failed to release lock on drop");
        }
    }
}
