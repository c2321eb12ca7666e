use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::eval::EvalRunResult;

/// Coarse phase of a run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Startup,
    Construction,
    Refinement,
    Complete,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Startup => write!(f, "startup"),
            RunPhase::Construction => write!(f, "construction"),
            RunPhase::Refinement => write!(f, "refinement"),
            RunPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Compact summary of the latest oracle run, kept in the status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastEvalResult {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
}

impl From<&EvalRunResult> for LastEvalResult {
    fn from(result: &EvalRunResult) -> Self {
        Self {
            passed: result.passed,
            failed: result.failed,
            total: result.total,
        }
    }
}

impl std::fmt::Display for LastEvalResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} passed", self.passed, self.total)
    }
}

/// Contents of the per-target lock file, doubling as a live status feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFileStatus {
    pub run_id: Uuid,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub phase: RunPhase,
    pub iteration: u32,
    pub last_eval_result: Option<LastEvalResult>,
    pub current_action: String,
    pub updated_at: DateTime<Utc>,
    pub best_pass_count: u32,
    pub best_iteration: u32,
    pub stable_iterations: u32,
}

impl LockFileStatus {
    pub fn new(run_id: Uuid, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            pid,
            started_at: now,
            phase: RunPhase::Startup,
            iteration: 0,
            last_eval_result: None,
            current_action: "starting".to_string(),
            updated_at: now,
            best_pass_count: 0,
            best_iteration: 0,
            stable_iterations: 0,
        }
    }

    /// Move to `phase`. Backward transitions are ignored.
    pub fn advance_phase(&mut self, phase: RunPhase) -> bool {
        if phase < self.phase {
            return false;
        }
        self.phase = phase;
        true
    }

    pub fn set_action(&mut self, action: impl Into<String>) {
        self.current_action = action.into();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
