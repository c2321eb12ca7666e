use super::{RunManifest, RunOutcome};
use anyhow::{Context, Result};
use guideforge_common::GuidelineArtifact;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::write_atomic;

const MANIFEST_FILE: &str = "manifest.json";

/// The directory of one live run.
#[derive(Debug)]
pub struct RunLog {
    dir: PathBuf,
    manifest: RunManifest,
}

impl RunLog {
    pub fn create(runs_dir: &Path, run_id: Uuid, target: &str) -> Result<Self> {
        let manifest = RunManifest::new(run_id, target);
        let dir = runs_dir.join(manifest.dir_name());
        fs::create_dir_all(dir.join("proposals")).context("Failed to create proposals directory")?;
        fs::create_dir_all(dir.join("oracle")).context("Failed to create oracle directory")?;
        let log = Self { dir, manifest };
        log.write_manifest()?;
        debug!(dir = %log.dir.display(), "Run directory created");
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn oracle_dir(&self) -> PathBuf {
        self.dir.join("oracle")
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn write_manifest(&self) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(&self.manifest).context("Failed to serialize run manifest")?;
        write_atomic(&self.dir.join(MANIFEST_FILE), &json).context("Failed to write run manifest")
    }

    pub fn finish(&mut self, outcome: RunOutcome, committed_digest: Option<String>) -> Result<()> {
        self.manifest.finish(outcome);
        self.manifest.committed_digest = committed_digest;
        self.write_manifest()
    }

    /// Store a proposal as `proposals/refinement-NNN.md`.
    ///
    /// Files are created exclusively; if `attempt`'s name is taken the next
    /// free number is used, so an existing proposal is never overwritten.
    pub fn save_proposal(&self, attempt: u32, proposal: &GuidelineArtifact) -> Result<PathBuf> {
        let proposals = self.dir.join("proposals");
        let mut number = attempt;
        loop {
            let path = proposals.join(format!("refinement-{:03}.md", number));
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(proposal.text.as_bytes())
                        .with_context(|| format!("Failed to write proposal {}", path.display()))?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => number += 1,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create proposal {}", path.display()));
                }
            }
        }
    }
}

/// Read and prune access to all run directories of one target.
#[derive(Debug, Clone)]
pub struct RunArchive {
    runs_dir: PathBuf,
}

impl RunArchive {
    pub fn new(runs_dir: &Path) -> Self {
        Self {
            runs_dir: runs_dir.to_path_buf(),
        }
    }

    /// Run directories, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&self.runs_dir)
            .context("Failed to read runs directory")?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_manifest(&self, run_dir: &Path) -> Result<RunManifest> {
        let content = fs::read_to_string(run_dir.join(MANIFEST_FILE))
            .with_context(|| format!("Failed to read manifest in {}", run_dir.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest in {}", run_dir.display()))
    }

    /// Delete all but the `keep` most recent runs. The run `protect` (the
    /// live one, if any) is never deleted.
    pub fn clean(&self, keep: usize, protect: Option<Uuid>) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for dir in self.list_runs()?.into_iter().skip(keep) {
            if let Some(live) = protect
                && self
                    .load_manifest(&dir)
                    .map(|m| m.run_id == live)
                    .unwrap_or(false)
            {
                debug!(dir = %dir.display(), "Skipping live run");
                continue;
            }
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove run directory {}", dir.display()))?;
            removed.push(dir);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), keep, "Cleaned old runs");
        }
        Ok(removed)
    }
}
