//! Construction phase: grow the working artifact until every eval passes
//! or the pass rate settles on an acceptable plateau.
//!
//! Per iteration:
//! 1. evaluate the working artifact;
//! 2. a clean run is confirmed by further runs and committed;
//! 3. a drop of more than `max_regression_allowed` below the best pass
//!    count reverts to the checkpoint and skips analysis;
//! 4. track the best pass count and how long it has been stable;
//! 5. a stable plateau at or above `min_pass_rate` is committed;
//! 6. the iteration cap commits or fails depending on the pass rate;
//! 7. otherwise failing cases are analyzed in parallel and the surviving
//!    analyses are synthesized into a new working artifact.

use guideforge_common::{
    EvalRunResult, FailureAnalysis, GuidelineArtifact, IterationRecord, LastEvalResult, RunPhase,
};
use tracing::{debug, info, warn};

use crate::analysis::group_by_topic;
use crate::artifact::ArtifactSlots;
use crate::audit::RunLog;
use crate::config::TargetConfig;
use crate::errors::OrchestratorError;
use crate::orchestrator::{
    CheckpointManager, ConcurrencyLimitedDispatcher, IterationHistoryStore, LockGuard,
    PhaseServices,
};
use crate::synthesis::diff_summary;

/// How construction ended successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructionOutcome {
    /// Every eval passed on consecutive confirmation runs.
    AllPassing { iteration: u32, total: u32 },
    /// Accepted at a pass rate above the threshold without reaching 100%.
    AcceptedPlateau {
        iteration: u32,
        passed: u32,
        total: u32,
    },
}

impl std::fmt::Display for ConstructionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstructionOutcome::AllPassing { iteration, total } => {
                write!(f, "all {} evals passing at iteration {}", total, iteration)
            }
            ConstructionOutcome::AcceptedPlateau {
                iteration,
                passed,
                total,
            } => write!(
                f,
                "accepted plateau of {}/{} at iteration {}",
                passed, total, iteration
            ),
        }
    }
}

/// Where a run picks up after an earlier one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeState {
    pub iteration: u32,
    pub best_pass_count: u32,
    pub best_iteration: u32,
}

pub struct ConstructionEngine<'a> {
    services: &'a PhaseServices,
    target: &'a TargetConfig,
    slots: ArtifactSlots,
    checkpoint: CheckpointManager,
    history: IterationHistoryStore,
}

impl<'a> ConstructionEngine<'a> {
    pub fn new(services: &'a PhaseServices, target: &'a TargetConfig) -> Result<Self, OrchestratorError> {
        let layout = target.layout();
        let history = IterationHistoryStore::load(&layout.history)?
            .with_max_records(services.limits.max_history_records);
        Ok(Self {
            services,
            target,
            slots: ArtifactSlots::new(&layout),
            checkpoint: CheckpointManager::new(&layout),
            history,
        })
    }

    /// Best pass count from the checkpoint metadata and the iteration
    /// counter from whichever of history and checkpoint is further along.
    pub fn resume_state(&self) -> ResumeState {
        let meta = self.checkpoint.meta();
        let history_iteration = self.history.last_iteration().unwrap_or(0);
        ResumeState {
            iteration: history_iteration.max(meta.as_ref().map(|m| m.iteration).unwrap_or(0)),
            best_pass_count: meta.as_ref().map(|m| m.pass_count).unwrap_or(0),
            best_iteration: meta.as_ref().map(|m| m.iteration).unwrap_or(0),
        }
    }

    pub fn history(&self) -> &IterationHistoryStore {
        &self.history
    }

    pub async fn run(
        &mut self,
        start: GuidelineArtifact,
        resume: ResumeState,
        lock: &mut LockGuard,
        run_log: &RunLog,
    ) -> Result<ConstructionOutcome, OrchestratorError> {
        let limits = self.services.limits.clone();
        let run_id = lock.run_id();

        let mut artifact = start;
        self.slots.save_working(&artifact)?;

        let mut iteration = resume.iteration;
        let mut best_pass_count = resume.best_pass_count;
        let mut best_iteration = resume.best_iteration;
        let mut stable_iterations: u32 = 0;
        let mut previous_pass_count: Option<u32> = None;

        lock.update(|s| {
            s.advance_phase(RunPhase::Construction);
            s.best_pass_count = best_pass_count;
            s.best_iteration = best_iteration;
            s.set_action("starting construction");
        })?;
        info!(
            target = %self.target.target_id,
            resume_iteration = iteration,
            best_pass_count,
            tokens = artifact.token_count,
            "Construction phase started"
        );

        loop {
            iteration += 1;

            // 1. Evaluate.
            lock.update(|s| {
                s.iteration = iteration;
                s.set_action("running evals");
            })?;
            let mut result = self.evaluate(run_log).await?;
            self.report(lock, &result)?;
            info!(
                iteration,
                passed = result.passed,
                total = result.total,
                delta = previous_pass_count.map(|p| result.passed as i64 - p as i64),
                "Iteration evaluated"
            );

            // 2. A clean run must hold up across the confirmation runs.
            if result.is_clean() {
                match self.confirm_clean(lock, run_log).await? {
                    None => {
                        self.commit_all_passing(&artifact, &result, iteration)?;
                        info!(iteration, total = result.total, "All evals passing; committed");
                        return Ok(ConstructionOutcome::AllPassing {
                            iteration,
                            total: result.total,
                        });
                    }
                    Some(flaky) => {
                        warn!(
                            iteration,
                            passed = flaky.passed,
                            total = flaky.total,
                            "Confirmation run failed; continuing with its result"
                        );
                        result = flaky;
                    }
                }
            }

            // 3. Regression beyond tolerance: back to the checkpoint.
            let floor = best_pass_count as i64 - limits.max_regression_allowed as i64;
            if (result.passed as i64) < floor {
                match self.checkpoint.revert()? {
                    Some(restored) => {
                        warn!(
                            iteration,
                            passed = result.passed,
                            best_pass_count,
                            "Regression detected; reverting to checkpoint"
                        );
                        artifact = restored;
                        self.slots.save_working(&artifact)?;
                        stable_iterations = 0;
                        previous_pass_count = Some(best_pass_count);
                        lock.update(|s| {
                            s.stable_iterations = 0;
                            s.set_action("reverted to checkpoint");
                        })?;
                        continue;
                    }
                    None => warn!(iteration, "Regression detected but no checkpoint exists"),
                }
            }

            // 4. Track the best result.
            if result.passed > best_pass_count {
                self.checkpoint
                    .save(&artifact, result.passed, result.total, iteration)?;
                best_pass_count = result.passed;
                best_iteration = iteration;
                stable_iterations = 1;
            } else if result.passed == best_pass_count {
                stable_iterations += 1;
            } else {
                stable_iterations = 0;
            }
            previous_pass_count = Some(result.passed);
            lock.update(|s| {
                s.best_pass_count = best_pass_count;
                s.best_iteration = best_iteration;
                s.stable_iterations = stable_iterations;
            })?;

            // 5. Plateau.
            let above_threshold = result.pass_rate() >= limits.min_pass_rate;
            if above_threshold && stable_iterations >= limits.stable_plateau_iterations {
                self.commit_accepted(&artifact)?;
                info!(
                    iteration,
                    passed = result.passed,
                    total = result.total,
                    stable_iterations,
                    "Plateau accepted; committed"
                );
                return Ok(ConstructionOutcome::AcceptedPlateau {
                    iteration,
                    passed: result.passed,
                    total: result.total,
                });
            }

            // 6. Iteration cap.
            if iteration >= limits.max_construction_iterations {
                if above_threshold {
                    self.commit_accepted(&artifact)?;
                    info!(iteration, passed = result.passed, "Iteration cap reached; committed");
                    return Ok(ConstructionOutcome::AcceptedPlateau {
                        iteration,
                        passed: result.passed,
                        total: result.total,
                    });
                }
                return Err(OrchestratorError::ConstructionExhausted {
                    iterations: iteration,
                    best_pass_count,
                    total: result.total,
                });
            }

            // 7. Analyze and incorporate.
            lock.update(|s| s.set_action(format!("analyzing {} failures", result.failed)))?;
            let analyses = self.analyze_failures(&result, &artifact).await;
            let surviving: Vec<FailureAnalysis> =
                analyses.into_iter().filter(|a| a.is_actionable()).collect();
            if surviving.is_empty() {
                info!(iteration, "No actionable analyses; artifact unchanged");
                continue;
            }

            lock.update(|s| s.set_action(format!("synthesizing {} analyses", surviving.len())))?;
            let grouped = group_by_topic(&surviving);
            let feedback = self.history.get_recent_feedback(limits.recent_feedback);
            let updated = match self
                .services
                .synthesizer()
                .synthesize(&artifact, &grouped, &feedback)
                .await
            {
                Ok(updated) if !updated.is_empty() => updated,
                Ok(_) => {
                    warn!(iteration, "Synthesis returned empty guidelines; artifact unchanged");
                    continue;
                }
                Err(e) => {
                    warn!(iteration, error = %e, "Synthesis failed; artifact unchanged");
                    continue;
                }
            };

            let summary = diff_summary(&artifact, &updated);
            self.history.append(
                IterationRecord::from_eval(iteration, run_id, &result).with_diff_summary(&summary),
            )?;
            artifact = updated;
            self.slots.save_working(&artifact)?;
            info!(iteration, change = %summary, "Working artifact updated");
        }
    }

    async fn evaluate(&self, run_log: &RunLog) -> Result<EvalRunResult, OrchestratorError> {
        self.services
            .evaluate(self.target, self.slots.working_path(), &run_log.oracle_dir())
            .await
    }

    fn report(&self, lock: &mut LockGuard, result: &EvalRunResult) -> Result<(), OrchestratorError> {
        lock.update(|s| s.last_eval_result = Some(LastEvalResult::from(result)))
    }

    /// Run the remaining confirmation evaluations. Returns the first run
    /// that reported failures, or `None` if all were clean.
    async fn confirm_clean(
        &self,
        lock: &mut LockGuard,
        run_log: &RunLog,
    ) -> Result<Option<EvalRunResult>, OrchestratorError> {
        let runs = self.services.limits.stability_check_runs;
        for run in 2..=runs {
            lock.update(|s| s.set_action(format!("stability check {}/{}", run, runs)))?;
            let result = self.evaluate(run_log).await?;
            self.report(lock, &result)?;
            debug!(run, runs, passed = result.passed, total = result.total, "Stability check");
            if !result.is_clean() {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// A fully passing artifact is also the best snapshot there can be.
    fn commit_all_passing(
        &self,
        artifact: &GuidelineArtifact,
        result: &EvalRunResult,
        iteration: u32,
    ) -> Result<(), OrchestratorError> {
        self.slots.save_committed(artifact)?;
        self.checkpoint
            .save(artifact, result.passed, result.total, iteration)
    }

    /// Plateau and cap acceptance leave the checkpoint on the best result.
    fn commit_accepted(&self, artifact: &GuidelineArtifact) -> Result<(), OrchestratorError> {
        self.slots.save_committed(artifact)
    }

    async fn analyze_failures(
        &self,
        result: &EvalRunResult,
        artifact: &GuidelineArtifact,
    ) -> Vec<FailureAnalysis> {
        let failing: Vec<_> = result.failing_cases().cloned().collect();
        let count = failing.len();
        let analyzer = self.services.analyzer();
        let dispatcher = ConcurrencyLimitedDispatcher::new(self.services.limits.max_parallel_analyzers);

        let outcomes = dispatcher
            .run(
                &failing,
                |case, _| {
                    let case = case.clone();
                    let analyzer = &analyzer;
                    async move { Ok(analyzer.analyze(&case, artifact).await) }
                },
                |case, index| debug!("Analyzing {}/{}: {}", index + 1, count, case.eval_name),
            )
            .await;

        outcomes
            .into_iter()
            .zip(&failing)
            .map(|(outcome, case)| {
                outcome.unwrap_or_else(|e| FailureAnalysis::fallback(&case.eval_name, e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ANALYSIS_MARKER;
    use crate::completion::CallContext;
    use crate::orchestrator::testing::{
        OracleStep, Reply, ScriptedCompletion, ScriptedOracle, run_result,
    };
    use crate::orchestrator::{LockFileManager, Limits};
    use crate::synthesis::SYNTHESIS_MARKER;
    use guideforge_common::RunPhase;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    const HIGH: &str =
        r#"{"analysis": "missing validator", "suggestedGuideline": "Add validators", "confidence": "high"}"#;
    const LOW: &str =
        r#"{"analysis": "flaky", "suggestedGuideline": "", "confidence": "low"}"#;

    struct Fixture {
        _dir: TempDir,
        target: TargetConfig,
        oracle: Arc<ScriptedOracle>,
        completion: Arc<ScriptedCompletion>,
        services: PhaseServices,
    }

    fn fixture(oracle: ScriptedOracle, completion: ScriptedCompletion, limits: Limits) -> Fixture {
        let dir = tempdir().unwrap();
        let target = TargetConfig::new("model-a", dir.path());
        target.layout().ensure_directories().unwrap();
        let oracle = Arc::new(oracle);
        let completion = Arc::new(completion);
        let services = PhaseServices::new(oracle.clone(), completion.clone())
            .with_limits(limits)
            .with_call_context(CallContext::new(Duration::from_secs(5)));
        Fixture {
            _dir: dir,
            target,
            oracle,
            completion,
            services,
        }
    }

    async fn run(fx: &Fixture, start: &str) -> Result<ConstructionOutcome, OrchestratorError> {
        let mut lock = LockFileManager::new().acquire(&fx.target).unwrap();
        let run_log = RunLog::create(&fx.target.layout().runs_dir, lock.run_id(), "model-a").unwrap();
        let mut engine = ConstructionEngine::new(&fx.services, &fx.target).unwrap();
        let resume = engine.resume_state();
        engine
            .run(GuidelineArtifact::new(start), resume, &mut lock, &run_log)
            .await
    }

    fn committed(fx: &Fixture) -> Option<String> {
        ArtifactSlots::new(&fx.target.layout())
            .load_committed()
            .unwrap()
            .map(|a| a.text)
    }

    #[tokio::test]
    async fn test_clean_suite_commits_after_stability_runs() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(12, 12)]),
            ScriptedCompletion::new(),
            Limits::default(),
        );
        let outcome = run(&fx, "A0").await.unwrap();

        assert_eq!(outcome, ConstructionOutcome::AllPassing { iteration: 1, total: 12 });
        assert_eq!(fx.oracle.calls(), 3);
        assert_eq!(fx.completion.total_calls(), 0);
        assert_eq!(committed(&fx).as_deref(), Some("A0"));
    }

    #[tokio::test]
    async fn test_regression_reverts_without_analysis() {
        let fx = fixture(
            ScriptedOracle::new(vec![
                run_result(10, 12),
                run_result(6, 12),
                run_result(12, 12),
            ]),
            ScriptedCompletion::new()
                .on(ANALYSIS_MARKER, vec![Reply::text(HIGH)])
                .on(SYNTHESIS_MARKER, vec![Reply::text(r#"{"guidelines": "A1"}"#)]),
            Limits::default(),
        );
        let outcome = run(&fx, "A0").await.unwrap();

        assert_eq!(outcome, ConstructionOutcome::AllPassing { iteration: 3, total: 12 });
        // Two analyses and one synthesis after iteration 1; none after the drop.
        assert_eq!(fx.completion.calls(ANALYSIS_MARKER), 2);
        assert_eq!(fx.completion.calls(SYNTHESIS_MARKER), 1);
        assert_eq!(fx.oracle.calls(), 5);

        let seen: Vec<String> = fx.oracle.seen().into_iter().map(|(_, text)| text).collect();
        assert_eq!(seen, vec!["A0", "A1", "A0", "A0", "A0"]);
        assert_eq!(committed(&fx).as_deref(), Some("A0"));
    }

    #[tokio::test]
    async fn test_drop_within_tolerance_is_not_reverted() {
        let fx = fixture(
            ScriptedOracle::new(vec![
                run_result(10, 12),
                run_result(8, 12),
                run_result(12, 12),
            ]),
            ScriptedCompletion::new()
                .on(ANALYSIS_MARKER, vec![Reply::text(HIGH)])
                .on(
                    SYNTHESIS_MARKER,
                    vec![
                        Reply::text(r#"{"guidelines": "A1"}"#),
                        Reply::text(r#"{"guidelines": "A2"}"#),
                    ],
                ),
            Limits::default(),
        );
        run(&fx, "A0").await.unwrap();
        assert_eq!(committed(&fx).as_deref(), Some("A2"));
        assert_eq!(fx.completion.calls(SYNTHESIS_MARKER), 2);
    }

    #[tokio::test]
    async fn test_low_confidence_plateau_is_accepted() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(19, 20)]),
            ScriptedCompletion::new().on(ANALYSIS_MARKER, vec![Reply::text(LOW)]),
            Limits::default(),
        );
        let outcome = run(&fx, "A0").await.unwrap();

        assert_eq!(
            outcome,
            ConstructionOutcome::AcceptedPlateau { iteration: 5, passed: 19, total: 20 }
        );
        assert_eq!(fx.oracle.calls(), 5);
        assert_eq!(fx.completion.calls(SYNTHESIS_MARKER), 0);
        assert_eq!(committed(&fx).as_deref(), Some("A0"));
    }

    #[tokio::test]
    async fn test_iteration_cap_below_threshold_fails() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(5, 20)]),
            ScriptedCompletion::new().on(ANALYSIS_MARKER, vec![Reply::text(LOW)]),
            Limits::default().with_max_construction_iterations(3),
        );
        match run(&fx, "A0").await {
            Err(OrchestratorError::ConstructionExhausted {
                iterations,
                best_pass_count,
                total,
            }) => {
                assert_eq!(iterations, 3);
                assert_eq!(best_pass_count, 5);
                assert_eq!(total, 20);
            }
            other => panic!("Expected ConstructionExhausted, got {:?}", other),
        }
        assert!(committed(&fx).is_none());
    }

    #[tokio::test]
    async fn test_iteration_cap_above_threshold_commits() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(18, 20), run_result(19, 20)]),
            ScriptedCompletion::new()
                .on(ANALYSIS_MARKER, vec![Reply::text(HIGH)])
                .on(SYNTHESIS_MARKER, vec![Reply::text(r#"{"guidelines": "A1"}"#)]),
            Limits::default().with_max_construction_iterations(2),
        );
        let outcome = run(&fx, "A0").await.unwrap();
        assert_eq!(
            outcome,
            ConstructionOutcome::AcceptedPlateau { iteration: 2, passed: 19, total: 20 }
        );
        assert_eq!(committed(&fx).as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_cap_acceptance_keeps_best_checkpoint() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(19, 20), run_result(18, 20)]),
            ScriptedCompletion::new()
                .on(ANALYSIS_MARKER, vec![Reply::text(HIGH)])
                .on(SYNTHESIS_MARKER, vec![Reply::text(r#"{"guidelines": "A1"}"#)]),
            Limits::default().with_max_construction_iterations(2),
        );
        let outcome = run(&fx, "A0").await.unwrap();
        assert_eq!(
            outcome,
            ConstructionOutcome::AcceptedPlateau { iteration: 2, passed: 18, total: 20 }
        );
        assert_eq!(committed(&fx).as_deref(), Some("A1"));

        let checkpoint = CheckpointManager::new(&fx.target.layout());
        assert_eq!(checkpoint.revert().unwrap().unwrap().text, "A0");
        let meta = checkpoint.meta().unwrap();
        assert_eq!(meta.pass_count, 19);
        assert_eq!(meta.iteration, 1);
    }

    #[tokio::test]
    async fn test_plateau_acceptance_keeps_checkpoint_iteration() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(19, 20)]),
            ScriptedCompletion::new().on(ANALYSIS_MARKER, vec![Reply::text(LOW)]),
            Limits::default(),
        );
        run(&fx, "A0").await.unwrap();

        let meta = CheckpointManager::new(&fx.target.layout()).meta().unwrap();
        assert_eq!(meta.pass_count, 19);
        assert_eq!(meta.iteration, 1);
    }

    #[tokio::test]
    async fn test_iteration_cap_counts_across_resumes() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(5, 20)]),
            ScriptedCompletion::new().on(ANALYSIS_MARKER, vec![Reply::text(LOW)]),
            Limits::default(),
        );
        CheckpointManager::new(&fx.target.layout())
            .save(&GuidelineArtifact::new("best"), 5, 20, 49)
            .unwrap();

        match run(&fx, "best").await {
            Err(OrchestratorError::ConstructionExhausted {
                iterations,
                best_pass_count,
                total,
            }) => {
                assert_eq!(iterations, 50);
                assert_eq!(best_pass_count, 5);
                assert_eq!(total, 20);
            }
            other => panic!("Expected ConstructionExhausted, got {:?}", other),
        }
        assert_eq!(fx.oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_dip_resets_plateau_count() {
        let mut script = vec![run_result(19, 20); 4];
        script.push(run_result(18, 20));
        script.extend(vec![run_result(19, 20); 5]);
        let fx = fixture(
            ScriptedOracle::new(script),
            ScriptedCompletion::new().on(ANALYSIS_MARKER, vec![Reply::text(LOW)]),
            Limits::default(),
        );
        let outcome = run(&fx, "A0").await.unwrap();

        // Four equal results, a dip, then five more equal results.
        assert_eq!(
            outcome,
            ConstructionOutcome::AcceptedPlateau { iteration: 10, passed: 19, total: 20 }
        );
        assert_eq!(fx.oracle.calls(), 10);
    }

    #[tokio::test]
    async fn test_equal_pass_count_does_not_resave_checkpoint() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(10, 12), run_result(10, 12)]),
            ScriptedCompletion::new()
                .on(ANALYSIS_MARKER, vec![Reply::text(HIGH)])
                .on(SYNTHESIS_MARKER, vec![Reply::text(r#"{"guidelines": "A1"}"#)]),
            Limits::default().with_max_construction_iterations(2),
        );
        let err = run(&fx, "A0").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ConstructionExhausted { .. }));

        let seen: Vec<String> = fx.oracle.seen().into_iter().map(|(_, text)| text).collect();
        assert_eq!(seen, vec!["A0", "A1"]);

        let checkpoint = CheckpointManager::new(&fx.target.layout());
        assert_eq!(checkpoint.revert().unwrap().unwrap().text, "A0");
        assert_eq!(checkpoint.meta().unwrap().iteration, 1);
    }

    #[tokio::test]
    async fn test_flaky_confirmation_continues_loop() {
        let fx = fixture(
            ScriptedOracle::new(vec![
                run_result(12, 12),
                run_result(11, 12),
                run_result(12, 12),
            ]),
            ScriptedCompletion::new()
                .on(ANALYSIS_MARKER, vec![Reply::text(HIGH)])
                .on(SYNTHESIS_MARKER, vec![Reply::text(r#"{"guidelines": "A1"}"#)]),
            Limits::default(),
        );
        let outcome = run(&fx, "A0").await.unwrap();
        assert_eq!(outcome, ConstructionOutcome::AllPassing { iteration: 2, total: 12 });
        // 2 runs in iteration 1 (clean, then flaky), 3 in iteration 2.
        assert_eq!(fx.oracle.calls(), 5);
        assert_eq!(committed(&fx).as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_synthesis_records_history_with_diff() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(10, 12), run_result(12, 12)]),
            ScriptedCompletion::new()
                .on(ANALYSIS_MARKER, vec![Reply::text(HIGH)])
                .on(SYNTHESIS_MARKER, vec![Reply::text(r#"{"guidelines": "A0\nA1"}"#)]),
            Limits::default(),
        );
        run(&fx, "A0").await.unwrap();

        let history = IterationHistoryStore::load(fx.target.layout().history).unwrap();
        let records: Vec<_> = history.records().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].iteration, 1);
        assert_eq!(records[0].pass_count, 10);
        assert_eq!(records[0].diff_summary.as_deref(), Some("+1/-0 lines, tokens 1->2"));
    }

    #[tokio::test]
    async fn test_oracle_timeout_is_fatal() {
        let fx = fixture(
            ScriptedOracle::with_steps(vec![OracleStep::Timeout]),
            ScriptedCompletion::new(),
            Limits::default(),
        );
        let err = run(&fx, "A0").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Oracle(_)));
        assert_eq!(fx.oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_resume_picks_up_best_and_iteration() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(12, 12)]),
            ScriptedCompletion::new(),
            Limits::default(),
        );
        let layout = fx.target.layout();
        CheckpointManager::new(&layout)
            .save(&GuidelineArtifact::new("best"), 9, 12, 7)
            .unwrap();

        let engine = ConstructionEngine::new(&fx.services, &fx.target).unwrap();
        assert_eq!(
            engine.resume_state(),
            ResumeState { iteration: 7, best_pass_count: 9, best_iteration: 7 }
        );

        let outcome = run(&fx, "resumed").await.unwrap();
        assert_eq!(outcome, ConstructionOutcome::AllPassing { iteration: 8, total: 12 });
    }

    #[tokio::test]
    async fn test_lock_reflects_progress() {
        let fx = fixture(
            ScriptedOracle::new(vec![run_result(12, 12)]),
            ScriptedCompletion::new(),
            Limits::default(),
        );
        let mut lock = LockFileManager::new().acquire(&fx.target).unwrap();
        let run_log = RunLog::create(&fx.target.layout().runs_dir, lock.run_id(), "model-a").unwrap();
        let mut engine = ConstructionEngine::new(&fx.services, &fx.target).unwrap();
        engine
            .run(GuidelineArtifact::new("A0"), ResumeState::default(), &mut lock, &run_log)
            .await
            .unwrap();

        let status = lock.status();
        assert_eq!(status.phase, RunPhase::Construction);
        assert_eq!(status.iteration, 1);
        assert_eq!(status.last_eval_result.unwrap().passed, 12);
    }
}
