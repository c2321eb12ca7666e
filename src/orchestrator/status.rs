//! Read-only views over a target's state, plus pruning of old runs.

use anyhow::Result;
use guideforge_common::{LastEvalResult, RunPhase};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use crate::artifact::ArtifactSlots;
use crate::audit::{RunArchive, RunManifest};
use crate::config::TargetConfig;
use crate::orchestrator::{CheckpointManager, LockFileManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Lock held by a running process.
    Running,
    /// Lock left behind by a process that is gone.
    Stale,
    /// No lock.
    Idle,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::Running => write!(f, "running"),
            Liveness::Stale => write!(f, "stale"),
            Liveness::Idle => write!(f, "idle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub target: String,
    pub liveness: Liveness,
    pub run_id: Option<Uuid>,
    pub pid: Option<u32>,
    pub phase: Option<RunPhase>,
    pub iteration: Option<u32>,
    pub last_eval_result: Option<LastEvalResult>,
    pub best_pass_count: Option<u32>,
    pub current_action: Option<String>,
    /// Token count of the committed artifact, if one exists.
    pub committed_tokens: Option<usize>,
    /// Best pass count recorded in the checkpoint, across runs.
    pub checkpoint_pass_count: Option<u32>,
}

/// Status of `config` from its lock file and artifact slots.
pub fn status(config: &TargetConfig, locks: &LockFileManager) -> Result<StatusReport> {
    let layout = config.layout();
    let lock = locks.read(config)?;
    let liveness = match &lock {
        Some(s) if locks.is_live(s) => Liveness::Running,
        Some(_) => Liveness::Stale,
        None => Liveness::Idle,
    };
    let committed = ArtifactSlots::new(&layout).load_committed()?;
    let checkpoint = CheckpointManager::new(&layout).meta();

    Ok(StatusReport {
        target: config.target_id.clone(),
        liveness,
        run_id: lock.as_ref().map(|s| s.run_id),
        pid: lock.as_ref().map(|s| s.pid),
        phase: lock.as_ref().map(|s| s.phase),
        iteration: lock.as_ref().map(|s| s.iteration),
        last_eval_result: lock.as_ref().and_then(|s| s.last_eval_result),
        best_pass_count: lock.as_ref().map(|s| s.best_pass_count),
        current_action: lock.as_ref().map(|s| s.current_action.clone()),
        committed_tokens: committed.map(|a| a.token_count),
        checkpoint_pass_count: checkpoint.map(|m| m.pass_count),
    })
}

/// Past runs, most recent first. A run whose manifest cannot be read is
/// listed with `None`.
pub fn history(config: &TargetConfig) -> Result<Vec<(PathBuf, Option<RunManifest>)>> {
    let archive = RunArchive::new(&config.layout().runs_dir);
    Ok(archive
        .list_runs()?
        .into_iter()
        .map(|dir| {
            let manifest = archive.load_manifest(&dir).ok();
            (dir, manifest)
        })
        .collect())
}

/// Delete all but the `keep` most recent runs. A live run is never removed.
pub fn clean(config: &TargetConfig, keep: usize, locks: &LockFileManager) -> Result<Vec<PathBuf>> {
    let protect = locks
        .read(config)?
        .filter(|s| locks.is_live(s))
        .map(|s| s.run_id);
    RunArchive::new(&config.layout().runs_dir).clean(keep, protect)
}
