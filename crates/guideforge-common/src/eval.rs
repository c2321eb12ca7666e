use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Outcome of a single test case inside one oracle run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalCaseResult {
    /// Fully-qualified eval name, usually `category/name`.
    pub eval_name: String,
    pub passed: bool,
    /// Directory holding the task description for this eval.
    #[serde(default)]
    pub task_path: PathBuf,
    #[serde(default)]
    pub expected_files: Vec<PathBuf>,
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    #[serde(default)]
    pub run_log_path: Option<PathBuf>,
}

/// Category segment of an eval name (text before the first `/`), or
/// `general` when there is none.
pub fn eval_category(eval_name: &str) -> &str {
    match eval_name.split_once('/') {
        Some((category, _)) if !category.is_empty() => category,
        _ => "general",
    }
}

impl EvalCaseResult {
    pub fn category(&self) -> &str {
        eval_category(&self.eval_name)
    }
}

/// The oracle's output contract for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRunResult {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
    #[serde(default)]
    pub results: Vec<EvalCaseResult>,
}

impl EvalRunResult {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    /// Fraction of passing cases; an empty suite counts as 0.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }

    pub fn failing_cases(&self) -> impl Iterator<Item = &EvalCaseResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// Map of eval name to pass/fail, as stored in iteration records.
    pub fn pass_map(&self) -> BTreeMap<String, bool> {
        self.results
            .iter()
            .map(|r| (r.eval_name.clone(), r.passed))
            .collect()
    }
}
