//! Working and committed guideline slots on disk.
//!
//! The checkpoint slot lives in [`crate::orchestrator::checkpoint`] because
//! it carries its own metadata and revert semantics.

use guideforge_common::GuidelineArtifact;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::{TargetLayout, write_atomic};
use crate::errors::OrchestratorError;

/// Short hex digest of an artifact's text, used in manifests and logs.
pub fn digest(artifact: &GuidelineArtifact) -> String {
    let hash = Sha256::digest(artifact.text.as_bytes());
    hash.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn read_slot(path: &Path) -> Result<Option<GuidelineArtifact>, OrchestratorError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(GuidelineArtifact::new(text))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(OrchestratorError::ArtifactIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub(crate) fn write_slot(path: &Path, artifact: &GuidelineArtifact) -> Result<(), OrchestratorError> {
    write_atomic(path, artifact.text.as_bytes()).map_err(|source| OrchestratorError::ArtifactIo {
        path: path.to_path_buf(),
        source,
    })
}

/// The working slot (mutated every iteration) and the committed slot (the
/// durable deliverable).
#[derive(Debug, Clone)]
pub struct ArtifactSlots {
    working: PathBuf,
    committed: PathBuf,
}

impl ArtifactSlots {
    pub fn new(layout: &TargetLayout) -> Self {
        Self {
            working: layout.working.clone(),
            committed: layout.committed.clone(),
        }
    }

    pub fn working_path(&self) -> &Path {
        &self.working
    }

    pub fn committed_path(&self) -> &Path {
        &self.committed
    }

    pub fn load_working(&self) -> Result<Option<GuidelineArtifact>, OrchestratorError> {
        read_slot(&self.working)
    }

    pub fn save_working(&self, artifact: &GuidelineArtifact) -> Result<(), OrchestratorError> {
        write_slot(&self.working, artifact)
    }

    pub fn load_committed(&self) -> Result<Option<GuidelineArtifact>, OrchestratorError> {
        read_slot(&self.committed)
    }

    pub fn save_committed(&self, artifact: &GuidelineArtifact) -> Result<(), OrchestratorError> {
        write_slot(&self.committed, artifact)
    }

    /// Pick the artifact a (possibly resumed) run starts from: the working
    /// slot, else the committed slot, else `seed`.
    pub fn resume_point(
        &self,
        seed: Option<&Path>,
    ) -> Result<GuidelineArtifact, OrchestratorError> {
        if let Some(working) = self.load_working()? {
            return Ok(working);
        }
        if let Some(committed) = self.load_committed()? {
            return Ok(committed);
        }
        match seed {
            Some(path) => Ok(read_slot(path)?.unwrap_or_else(GuidelineArtifact::empty)),
            None => Ok(GuidelineArtifact::empty()),
        }
    }
}
