//! Single-slot snapshot of the best artifact seen so far.
//!
//! The checkpoint is overwritten unconditionally on every save; callers only
//! save when the pass count has improved, so it always holds the best-known
//! good version. Metadata sits in a sibling JSON file so a resumed run knows
//! what pass count the snapshot achieved.

use chrono::{DateTime, Utc};
use guideforge_common::GuidelineArtifact;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::artifact::{digest, read_slot, write_slot};
use crate::config::{TargetLayout, write_atomic};
use crate::errors::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    pub pass_count: u32,
    pub total: u32,
    pub iteration: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub digest: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
    meta_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(layout: &TargetLayout) -> Self {
        Self {
            path: layout.checkpoint.clone(),
            meta_path: layout.checkpoint_meta.clone(),
        }
    }

    /// Overwrite the checkpoint with `artifact`.
    pub fn save(
        &self,
        artifact: &GuidelineArtifact,
        pass_count: u32,
        total: u32,
        iteration: u32,
    ) -> Result<(), OrchestratorError> {
        write_slot(&self.path, artifact)?;

        let meta = CheckpointMeta {
            pass_count,
            total,
            iteration,
            saved_at: Utc::now(),
            digest: digest(artifact),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| anyhow::anyhow!("Failed to serialize checkpoint metadata: {}", e))?;
        write_atomic(&self.meta_path, &json).map_err(|source| OrchestratorError::ArtifactIo {
            path: self.meta_path.clone(),
            source,
        })?;

        debug!(pass_count, total, iteration, digest = %meta.digest, "Checkpoint saved");
        Ok(())
    }

    /// The last saved artifact, or `None` if nothing was ever saved.
    pub fn revert(&self) -> Result<Option<GuidelineArtifact>, OrchestratorError> {
        read_slot(&self.path)
    }

    /// Metadata of the last save. Missing or unreadable metadata reads as
    /// `None`.
    pub fn meta(&self) -> Option<CheckpointMeta> {
        let content = std::fs::read_to_string(&self.meta_path).ok()?;
        serde_json::from_str(&content).ok()
    }
}
