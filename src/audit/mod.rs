//! Per-run audit trail.
//!
//! Every run gets its own directory under the target's `runs/` holding a
//! manifest, the oracle output, and every refinement proposal it tried.
//! Proposal files are never overwritten or removed by the engines; only an
//! explicit `clean` deletes whole run directories.

mod logger;

pub use logger::{RunArchive, RunLog};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    InProgress,
    Succeeded { summary: String },
    Failed { error: String },
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::InProgress => write!(f, "in progress"),
            RunOutcome::Succeeded { summary } => write!(f, "succeeded: {}", summary),
            RunOutcome::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    /// Digest of the committed artifact when the run ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_digest: Option<String>,
}

impl RunManifest {
    pub fn new(run_id: Uuid, target: impl Into<String>) -> Self {
        Self {
            run_id,
            target: target.into(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: RunOutcome::InProgress,
            committed_digest: None,
        }
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
    }

    /// Directory name: sortable start time plus the first 8 chars of the id.
    pub fn dir_name(&self) -> String {
        format!(
            "{}_{}",
            self.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &self.run_id.simple().to_string()[..8]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_name_sorts_by_start_time() {
        let mut early = RunManifest::new(Uuid::new_v4(), "m");
        let mut late = RunManifest::new(Uuid::new_v4(), "m");
        early.started_at = "2026-01-01T10:00:00Z".parse().unwrap();
        late.started_at = "2026-01-02T09:00:00Z".parse().unwrap();
        assert!(early.dir_name() < late.dir_name());
        assert!(early.dir_name().starts_with("2026-01-01T10-00-00_"));
        assert_eq!(early.dir_name().len(), "2026-01-01T10-00-00_".len() + 8);
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_string(&RunOutcome::Failed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"failed","error":"boom"}"#);
    }

    #[test]
    fn test_finish_sets_end_time() {
        let mut manifest = RunManifest::new(Uuid::nil(), "m");
        assert!(manifest.ended_at.is_none());
        manifest.finish(RunOutcome::Succeeded {
            summary: "12/12".into(),
        });
        assert!(manifest.ended_at.is_some());
        assert_eq!(manifest.outcome.to_string(), "succeeded: 12/12");
    }
}
