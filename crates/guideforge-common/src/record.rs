use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::eval::EvalRunResult;

/// Outcome of one construction iteration. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub pass_count: u32,
    pub fail_count: u32,
    pub eval_results: BTreeMap<String, bool>,
    /// Summary of the edit applied to the artifact after this evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<String>,
}

impl IterationRecord {
    pub fn from_eval(iteration: u32, run_id: Uuid, result: &EvalRunResult) -> Self {
        Self {
            iteration,
            run_id,
            timestamp: Utc::now(),
            pass_count: result.passed,
            fail_count: result.failed,
            eval_results: result.pass_map(),
            diff_summary: None,
        }
    }

    pub fn with_diff_summary(mut self, summary: impl Into<String>) -> Self {
        self.diff_summary = Some(summary.into());
        self
    }
}

/// What changed between two consecutive iteration records.
///
/// Derived on demand and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationFeedback {
    pub previous_iteration: u32,
    pub current_iteration: u32,
    pub pass_count_delta: i64,
    pub evals_flipped_to_pass: Vec<String>,
    pub evals_flipped_to_fail: Vec<String>,
    /// The edit made between the two evaluations (the earlier record's diff).
    pub changes_made: Option<String>,
}

impl IterationFeedback {
    /// Compare two records. Evals present in only one of them are ignored.
    pub fn between(previous: &IterationRecord, current: &IterationRecord) -> Self {
        let mut evals_flipped_to_pass = Vec::new();
        let mut evals_flipped_to_fail = Vec::new();

        for (name, &now) in &current.eval_results {
            match previous.eval_results.get(name) {
                Some(false) if now => evals_flipped_to_pass.push(name.clone()),
                Some(true) if !now => evals_flipped_to_fail.push(name.clone()),
                _ => {}
            }
        }

        Self {
            previous_iteration: previous.iteration,
            current_iteration: current.iteration,
            pass_count_delta: current.pass_count as i64 - previous.pass_count as i64,
            evals_flipped_to_pass,
            evals_flipped_to_fail,
            changes_made: previous.diff_summary.clone(),
        }
    }

    pub fn is_regression(&self) -> bool {
        self.pass_count_delta < 0 || !self.evals_flipped_to_fail.is_empty()
    }

    /// One-paragraph rendering used inside synthesis prompts.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Iteration {} -> {}: pass count {:+}",
            self.previous_iteration, self.current_iteration, self.pass_count_delta
        );
        if let Some(ref changes) = self.changes_made {
            out.push_str(&format!("\n  Changes made: {}", changes));
        }
        if !self.evals_flipped_to_pass.is_empty() {
            out.push_str(&format!(
                "\n  Now passing: {}",
                self.evals_flipped_to_pass.join(", ")
            ));
        }
        if !self.evals_flipped_to_fail.is_empty() {
            out.push_str(&format!(
                "\n  Now FAILING (regressed): {}",
                self.evals_flipped_to_fail.join(", ")
            ));
        }
        out
    }
}
