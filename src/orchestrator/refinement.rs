//! Refinement phase: shrink the committed artifact one proposal at a time.
//!
//! A proposal is only committed if it passes every eval on
//! `stability_check_runs` consecutive runs. Rejected proposals are described
//! back to the proposer so it does not repeat them. The phase ends after
//! `max_consecutive_rejections` rejections in a row; that stop is a
//! heuristic plateau, not proof that nothing shorter would pass.

use guideforge_common::{GuidelineArtifact, LastEvalResult, RunPhase};
use std::path::Path;
use tracing::{info, warn};

use crate::artifact::ArtifactSlots;
use crate::audit::RunLog;
use crate::config::TargetConfig;
use crate::errors::OrchestratorError;
use crate::orchestrator::{LockGuard, PhaseServices};

/// Why a proposal was turned down, judged by its token delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Removed more than the aggressive threshold.
    TooAggressive,
    /// Grew the artifact.
    AddedLength,
    /// Small or zero change that still broke an eval.
    Subtle,
    /// The proposer returned nothing usable.
    NoProposal,
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionKind::TooAggressive => write!(f, "too aggressive"),
            RejectionKind::AddedLength => write!(f, "added length"),
            RejectionKind::Subtle => write!(f, "subtle change"),
            RejectionKind::NoProposal => write!(f, "no proposal"),
        }
    }
}

/// Classify a failed proposal by `proposal tokens - committed tokens`.
pub fn classify_token_delta(delta: i64, aggressive_threshold: i64) -> RejectionKind {
    if delta < -aggressive_threshold {
        RejectionKind::TooAggressive
    } else if delta > 0 {
        RejectionKind::AddedLength
    } else {
        RejectionKind::Subtle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementOutcome {
    pub attempts: u32,
    pub accepted: u32,
    pub initial_tokens: usize,
    pub final_tokens: usize,
    /// True when the phase stopped on consecutive rejections.
    pub plateau_reached: bool,
}

impl std::fmt::Display for RefinementOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} proposals accepted, tokens {}->{}",
            self.accepted, self.attempts, self.initial_tokens, self.final_tokens
        )
    }
}

pub struct RefinementEngine<'a> {
    services: &'a PhaseServices,
    target: &'a TargetConfig,
    slots: ArtifactSlots,
}

impl<'a> RefinementEngine<'a> {
    pub fn new(services: &'a PhaseServices, target: &'a TargetConfig) -> Self {
        Self {
            services,
            target,
            slots: ArtifactSlots::new(&target.layout()),
        }
    }

    pub async fn run(
        &self,
        lock: &mut LockGuard,
        run_log: &RunLog,
    ) -> Result<RefinementOutcome, OrchestratorError> {
        let limits = &self.services.limits;
        let mut committed = self.slots.load_committed()?.ok_or_else(|| {
            anyhow::anyhow!(
                "No committed artifact for target '{}'; refinement needs a passing artifact",
                self.target.target_id
            )
        })?;
        let initial_tokens = committed.token_count;

        lock.update(|s| {
            s.advance_phase(RunPhase::Refinement);
            s.set_action("starting refinement");
        })?;
        info!(target = %self.target.target_id, tokens = initial_tokens, "Refinement phase started");

        let synthesizer = self.services.synthesizer();
        let mut rejections: Vec<String> = Vec::new();
        let mut consecutive_rejections: u32 = 0;
        let mut attempts: u32 = 0;
        let mut accepted: u32 = 0;

        while consecutive_rejections < limits.max_consecutive_rejections {
            attempts += 1;
            lock.update(|s| s.set_action(format!("proposal {}", attempts)))?;

            let proposal = match synthesizer
                .propose_simplification(&committed, &rejections)
                .await
            {
                Ok(p) if !p.guidelines.trim().is_empty() && p.guidelines != committed.text => p,
                Ok(p) => {
                    let summary = if p.summary.trim().is_empty() {
                        "unchanged proposal".to_string()
                    } else {
                        p.summary
                    };
                    warn!(attempt = attempts, "Proposal is empty or unchanged");
                    rejections.push(format!("{} ({})", summary, RejectionKind::NoProposal));
                    consecutive_rejections += 1;
                    continue;
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "No proposal produced");
                    rejections.push(format!("proposal failed: {} ({})", e, RejectionKind::NoProposal));
                    consecutive_rejections += 1;
                    continue;
                }
            };

            let candidate = proposal.artifact();
            let path = run_log.save_proposal(attempts, &candidate)?;
            let delta = candidate.token_delta_from(&committed);

            if self.passes_stably(lock, &path, run_log).await? {
                self.slots.save_committed(&candidate)?;
                self.slots.save_working(&candidate)?;
                info!(
                    attempt = attempts,
                    delta,
                    tokens = candidate.token_count,
                    summary = %proposal.summary,
                    "Proposal accepted"
                );
                committed = candidate;
                rejections.clear();
                consecutive_rejections = 0;
                accepted += 1;
            } else {
                let kind = classify_token_delta(delta, limits.aggressive_token_threshold);
                info!(attempt = attempts, delta, kind = %kind, "Proposal rejected");
                rejections.push(format!("{} ({})", proposal.summary, kind));
                consecutive_rejections += 1;
            }
        }

        info!(
            attempts,
            accepted,
            tokens = committed.token_count,
            "Refinement plateau reached"
        );
        Ok(RefinementOutcome {
            attempts,
            accepted,
            initial_tokens,
            final_tokens: committed.token_count,
            plateau_reached: true,
        })
    }

    /// Evaluate the proposal file until a run fails or
    /// `stability_check_runs` clean runs have been seen.
    async fn passes_stably(
        &self,
        lock: &mut LockGuard,
        proposal: &Path,
        run_log: &RunLog,
    ) -> Result<bool, OrchestratorError> {
        let runs = self.services.limits.stability_check_runs;
        for run in 1..=runs {
            lock.update(|s| s.set_action(format!("checking proposal {}/{}", run, runs)))?;
            let result = self
                .services
                .evaluate(self.target, proposal, &run_log.oracle_dir())
                .await?;
            lock.update(|s| s.last_eval_result = Some(LastEvalResult::from(&result)))?;
            if !result.is_clean() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
