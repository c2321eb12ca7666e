use guideforge_common::{GuidelineArtifact, RunPhase};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactSlots, digest};
use crate::audit::{RunLog, RunOutcome};
use crate::completion::{CallContext, ClaudeCliCompletion, RetryPolicy};
use crate::config::TargetConfig;
use crate::errors::OrchestratorError;
use crate::forge_config::ForgeToml;
use crate::oracle::CommandOracle;
use crate::orchestrator::{
    ConstructionEngine, ConstructionOutcome, LockFileManager, LockGuard, PhaseServices,
    RefinementEngine, RefinementOutcome,
};

/// What one completed run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target: String,
    pub construction: ConstructionOutcome,
    pub refinement: Option<RefinementOutcome>,
    pub committed_tokens: usize,
    pub committed_path: PathBuf,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.target, self.construction)?;
        if let Some(refinement) = &self.refinement {
            write!(f, "; refinement {}", refinement)?;
        }
        write!(f, "; committed {} tokens", self.committed_tokens)
    }
}

/// Runs both phases for one target under its lock.
pub struct Orchestrator {
    target: TargetConfig,
    services: PhaseServices,
    locks: LockFileManager,
    refinement_enabled: bool,
    seed_file: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(target: TargetConfig, services: PhaseServices) -> Self {
        Self {
            target,
            services,
            locks: LockFileManager::new(),
            refinement_enabled: true,
            seed_file: None,
        }
    }

    /// Wire the command-line oracle and completion service from settings.
    pub fn from_settings(target: TargetConfig, settings: &ForgeToml) -> Result<Self, OrchestratorError> {
        let oracle = CommandOracle::from_settings(settings, &target.base_dir).ok_or_else(|| {
            anyhow::anyhow!("No oracle command configured; set [oracle] command in guideforge.toml")
        })?;
        let completion =
            ClaudeCliCompletion::from_settings(settings).with_working_dir(target.base_dir.clone());

        let services = PhaseServices::new(Arc::new(oracle), Arc::new(completion))
            .with_limits(settings.limits())
            .with_call_context(CallContext::new(settings.completion_timeout()))
            .with_retry_policy(RetryPolicy::new(settings.max_parse_attempts()))
            .with_test_filter(settings.test_filter());

        let seed_file = settings
            .target
            .seed_file
            .as_ref()
            .map(|p| target.base_dir.join(p));

        Ok(Self::new(target, services)
            .with_refinement(settings.refinement.enabled)
            .with_seed_file(seed_file))
    }

    pub fn with_lock_manager(mut self, locks: LockFileManager) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_refinement(mut self, enabled: bool) -> Self {
        self.refinement_enabled = enabled;
        self
    }

    pub fn with_seed_file(mut self, seed: Option<PathBuf>) -> Self {
        self.seed_file = seed;
        self
    }

    pub fn with_test_filter(mut self, filter: Option<String>) -> Self {
        self.services.test_filter = filter;
        self
    }

    /// Cancelling `token` aborts in-flight completion calls.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.services.ctx = self.services.ctx.clone().with_cancel(token);
        self
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Run construction, then refinement, for this target.
    ///
    /// Fails with [`OrchestratorError::DuplicateRun`] without touching any
    /// state if another live process holds the target's lock. The lock is
    /// released on every exit path.
    pub async fn start(&self) -> Result<RunSummary, OrchestratorError> {
        let layout = self.target.layout();
        layout.ensure_directories()?;

        let mut lock = self.locks.acquire(&self.target)?;
        let mut run_log = RunLog::create(&layout.runs_dir, lock.run_id(), &self.target.target_id)?;
        info!(
            target = %self.target.target_id,
            run_id = %lock.run_id(),
            dir = %run_log.dir().display(),
            "Run started"
        );

        let result = self.run_phases(&mut lock, &run_log).await;

        let committed = ArtifactSlots::new(&layout).load_committed().ok().flatten();
        let outcome = match &result {
            Ok(summary) => RunOutcome::Succeeded {
                summary: summary.to_string(),
            },
            Err(e) => {
                error!(target = %self.target.target_id, error = %e, "Run failed");
                RunOutcome::Failed { error: e.to_string() }
            }
        };
        if let Err(e) = run_log.finish(outcome, committed.as_ref().map(digest)) {
            warn!(error = %e, "Failed to finalize run manifest");
        }
        if let Err(e) = lock.release() {
            warn!(error = %e, "Failed to release lock");
        }
        result
    }

    async fn run_phases(
        &self,
        lock: &mut LockGuard,
        run_log: &RunLog,
    ) -> Result<RunSummary, OrchestratorError> {
        let slots = ArtifactSlots::new(&self.target.layout());
        let start = slots.resume_point(self.seed_file.as_deref())?;

        let mut construction = ConstructionEngine::new(&self.services, &self.target)?;
        let resume = construction.resume_state();
        if resume.iteration > 0 {
            info!(
                iteration = resume.iteration,
                best_pass_count = resume.best_pass_count,
                "Resuming from earlier run"
            );
        }
        let construction = construction.run(start, resume, lock, run_log).await?;

        let refinement = if self.refinement_enabled {
            Some(
                RefinementEngine::new(&self.services, &self.target)
                    .run(lock, run_log)
                    .await?,
            )
        } else {
            info!("Refinement disabled; stopping after construction");
            None
        };

        lock.update(|s| {
            s.advance_phase(RunPhase::Complete);
            s.set_action("complete");
        })?;

        let committed = slots
            .load_committed()?
            .unwrap_or_else(GuidelineArtifact::empty);
        Ok(RunSummary {
            run_id: lock.run_id(),
            target: self.target.target_id.clone(),
            construction,
            refinement,
            committed_tokens: committed.token_count,
            committed_path: slots.committed_path().to_path_buf(),
        })
    }
}
