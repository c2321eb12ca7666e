//! Test doubles for the orchestrator's external collaborators.

use async_trait::async_trait;
use guideforge_common::{EvalCaseResult, EvalRunResult};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::completion::{CompletionRequest, CompletionService};
use crate::errors::{CompletionError, OracleError};
use crate::oracle::{EvalOracle, OracleRequest};
use crate::orchestrator::ProcessLivenessChecker;

/// Liveness answer fixed at construction.
#[derive(Debug)]
pub struct StubLiveness {
    alive: bool,
}

impl StubLiveness {
    pub fn always(alive: bool) -> Self {
        Self { alive }
    }
}

impl ProcessLivenessChecker for StubLiveness {
    fn is_alive(&self, _pid: u32) -> bool {
        self.alive
    }
}

/// An oracle run with `passed` of `total` cases passing. Cases are named
/// `basics/eval-NN`; the first `passed` pass.
pub fn run_result(passed: u32, total: u32) -> EvalRunResult {
    let results = (0..total)
        .map(|i| EvalCaseResult {
            eval_name: format!("basics/eval-{:02}", i),
            passed: i < passed,
            task_path: PathBuf::new(),
            expected_files: Vec::new(),
            output_files: Vec::new(),
            run_log_path: None,
        })
        .collect();
    EvalRunResult {
        passed,
        failed: total - passed,
        total,
        results,
    }
}

#[derive(Debug, Clone)]
pub enum OracleStep {
    Result(EvalRunResult),
    Timeout,
}

/// Plays back a fixed sequence of oracle outcomes, repeating the last one
/// once the script runs out. Records the artifact text it was shown.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    steps: Mutex<VecDeque<OracleStep>>,
    last: Mutex<Option<OracleStep>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(PathBuf, String)>>,
}

impl ScriptedOracle {
    pub fn new(results: Vec<EvalRunResult>) -> Self {
        Self::with_steps(results.into_iter().map(OracleStep::Result).collect())
    }

    pub fn with_steps(steps: Vec<OracleStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(artifact path, artifact text)` for every invocation, in order.
    pub fn seen(&self) -> Vec<(PathBuf, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EvalOracle for ScriptedOracle {
    async fn evaluate(&self, request: &OracleRequest) -> Result<EvalRunResult, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = std::fs::read_to_string(&request.artifact_path).unwrap_or_default();
        self.seen
            .lock()
            .unwrap()
            .push((request.artifact_path.clone(), text));

        let step = {
            let mut steps = self.steps.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            match steps.pop_front() {
                Some(step) => {
                    *last = Some(step.clone());
                    step
                }
                None => last.clone().expect("ScriptedOracle has no steps"),
            }
        };
        match step {
            OracleStep::Result(result) => Ok(result),
            OracleStep::Timeout => Err(OracleError::Timeout {
                after: std::time::Duration::from_secs(1),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never answers; only a deadline or cancellation ends the call.
    Hang,
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }

    pub fn fail(s: impl Into<String>) -> Self {
        Reply::Fail(s.into())
    }
}

#[derive(Debug)]
struct Script {
    marker: String,
    replies: VecDeque<Reply>,
    last: Option<Reply>,
    calls: usize,
}

/// Answers by the first registered marker found in the prompt. Each marker
/// has its own queue; the last reply repeats once the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    scripts: Mutex<Vec<Script>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, marker: &str, replies: Vec<Reply>) -> Self {
        self.scripts.lock().unwrap().push(Script {
            marker: marker.to_string(),
            replies: replies.into(),
            last: None,
            calls: 0,
        });
        self
    }

    pub fn calls(&self, marker: &str) -> usize {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.marker == marker)
            .map(|s| s.calls)
            .sum()
    }

    pub fn total_calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let prompt = request.rendered_prompt();
        self.prompts.lock().unwrap().push(prompt.clone());

        let reply = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts
                .iter_mut()
                .find(|s| prompt.contains(&s.marker))
                .ok_or_else(|| CompletionError::Failed("no scripted reply".to_string()))?;
            script.calls += 1;
            match script.replies.pop_front() {
                Some(reply) => {
                    script.last = Some(reply.clone());
                    reply
                }
                None => script
                    .last
                    .clone()
                    .ok_or_else(|| CompletionError::Failed("script exhausted".to_string()))?,
            }
        };

        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(message) => Err(CompletionError::Failed(message)),
            Reply::Hang => std::future::pending().await,
        }
    }
}
