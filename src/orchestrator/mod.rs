//! The guideline control loop.
//!
//! Leaf-first:
//! - `lock`: per-target mutual exclusion and live status feed
//! - `checkpoint`: single-slot best-known-good snapshot
//! - `history`: bounded iteration log and feedback derivation
//! - `dispatcher`: bounded-parallelism, order-preserving task runner
//! - `construction`: build the artifact up to full pass or a plateau
//! - `refinement`: simplify the committed artifact while keeping full pass
//! - `controller`: compose the above for one target
//! - `status`: read-only status/history/clean surface

pub mod checkpoint;
pub mod construction;
pub mod controller;
pub mod dispatcher;
pub mod history;
pub mod lock;
pub mod refinement;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

use guideforge_common::EvalRunResult;
use std::path::Path;
use std::sync::Arc;

use crate::analysis::FailureAnalyzer;
use crate::completion::{CallContext, CompletionService, RetryPolicy};
use crate::config::TargetConfig;
use crate::errors::OrchestratorError;
use crate::oracle::{EvalOracle, OracleRequest};
use crate::synthesis::GuidelineSynthesizer;

pub use checkpoint::{CheckpointManager, CheckpointMeta};
pub use construction::{ConstructionEngine, ConstructionOutcome, ResumeState};
pub use controller::{Orchestrator, RunSummary};
pub use dispatcher::ConcurrencyLimitedDispatcher;
pub use history::IterationHistoryStore;
pub use lock::{LockFileManager, LockGuard, OsLivenessChecker, ProcessLivenessChecker};
pub use refinement::{RefinementEngine, RefinementOutcome, RejectionKind, classify_token_delta};
pub use status::{Liveness, StatusReport, clean, history, status};

pub const MAX_CONSTRUCTION_ITERATIONS: u32 = 50;
pub const MAX_REGRESSION_ALLOWED: u32 = 2;
pub const MIN_PASS_RATE_THRESHOLD: f64 = 0.90;
pub const STABLE_PLATEAU_ITERATIONS: u32 = 5;
pub const STABILITY_CHECK_RUNS: u32 = 3;
pub const MAX_PARALLEL_ANALYZERS: usize = 5;
pub const MAX_HISTORY_RECORDS: usize = 20;
pub const RECENT_FEEDBACK_WINDOW: usize = 5;
/// Consecutive rejected refinements before the phase stops. A heuristic,
/// not a proof of local optimality.
pub const MAX_CONSECUTIVE_REJECTIONS: u32 = 10;
/// Tokens removed beyond which a rejected proposal is "too aggressive".
pub const AGGRESSIVE_TOKEN_THRESHOLD: i64 = 50;

/// Loop constants shared by both phase engines.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    pub max_construction_iterations: u32,
    pub max_regression_allowed: u32,
    pub min_pass_rate: f64,
    pub stable_plateau_iterations: u32,
    pub stability_check_runs: u32,
    pub recent_feedback: usize,
    pub max_parallel_analyzers: usize,
    pub max_history_records: usize,
    pub max_consecutive_rejections: u32,
    pub aggressive_token_threshold: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_construction_iterations: MAX_CONSTRUCTION_ITERATIONS,
            max_regression_allowed: MAX_REGRESSION_ALLOWED,
            min_pass_rate: MIN_PASS_RATE_THRESHOLD,
            stable_plateau_iterations: STABLE_PLATEAU_ITERATIONS,
            stability_check_runs: STABILITY_CHECK_RUNS,
            recent_feedback: RECENT_FEEDBACK_WINDOW,
            max_parallel_analyzers: MAX_PARALLEL_ANALYZERS,
            max_history_records: MAX_HISTORY_RECORDS,
            max_consecutive_rejections: MAX_CONSECUTIVE_REJECTIONS,
            aggressive_token_threshold: AGGRESSIVE_TOKEN_THRESHOLD,
        }
    }
}

impl Limits {
    pub fn with_max_construction_iterations(mut self, n: u32) -> Self {
        self.max_construction_iterations = n;
        self
    }

    pub fn with_max_consecutive_rejections(mut self, n: u32) -> Self {
        self.max_consecutive_rejections = n;
        self
    }

    pub fn with_stability_check_runs(mut self, n: u32) -> Self {
        self.stability_check_runs = n;
        self
    }
}

/// External collaborators and tunables shared by both phase engines.
pub struct PhaseServices {
    pub oracle: Arc<dyn EvalOracle>,
    pub completion: Arc<dyn CompletionService>,
    pub ctx: CallContext,
    pub policy: RetryPolicy,
    pub limits: Limits,
    pub test_filter: Option<String>,
}

impl PhaseServices {
    pub fn new(oracle: Arc<dyn EvalOracle>, completion: Arc<dyn CompletionService>) -> Self {
        Self {
            oracle,
            completion,
            ctx: CallContext::default(),
            policy: RetryPolicy::default(),
            limits: Limits::default(),
            test_filter: None,
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_call_context(mut self, ctx: CallContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_test_filter(mut self, filter: Option<String>) -> Self {
        self.test_filter = filter;
        self
    }

    pub fn analyzer(&self) -> FailureAnalyzer {
        FailureAnalyzer::new(self.completion.clone(), self.ctx.clone(), self.policy)
    }

    pub fn synthesizer(&self) -> GuidelineSynthesizer {
        GuidelineSynthesizer::new(self.completion.clone(), self.ctx.clone(), self.policy)
    }

    /// Score the artifact at `artifact_path`.
    pub async fn evaluate(
        &self,
        target: &TargetConfig,
        artifact_path: &Path,
        output_dir: &Path,
    ) -> Result<EvalRunResult, OrchestratorError> {
        let request = OracleRequest {
            target_id: target.target_id.clone(),
            artifact_path: artifact_path.to_path_buf(),
            test_filter: self.test_filter.clone(),
            output_dir: output_dir.to_path_buf(),
        };
        Ok(self.oracle.evaluate(&request).await?)
    }
}
