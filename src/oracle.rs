//! The evaluation oracle: a black-box process that scores one artifact.
//!
//! Contract: the oracle receives a target id, the path of the candidate
//! artifact and an optional test-name filter, and appends one JSON
//! [`EvalRunResult`] line to a results file in its output directory. Several
//! invocations in one run share the file, so only the last line is read.

use async_trait::async_trait;
use guideforge_common::EvalRunResult;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::OracleError;
use crate::forge_config::ForgeToml;
use crate::logging::append_log_block;

/// Inputs for one oracle invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub target_id: String,
    pub artifact_path: PathBuf,
    pub test_filter: Option<String>,
    /// Directory the oracle writes its results file and scratch output to.
    pub output_dir: PathBuf,
}

#[async_trait]
pub trait EvalOracle: Send + Sync {
    async fn evaluate(&self, request: &OracleRequest) -> Result<EvalRunResult, OracleError>;
}

/// Reject filters that would fail inside the oracle after a long startup.
pub fn validate_test_filter(filter: &str) -> Result<(), OracleError> {
    regex::Regex::new(filter)
        .map(|_| ())
        .map_err(|e| OracleError::Other(anyhow::anyhow!("Invalid test filter '{}': {}", filter, e)))
}

/// Runs a configured command as the oracle.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    results_file: String,
    working_dir: Option<PathBuf>,
}

impl CommandOracle {
    /// `command` may carry leading arguments (`"npm run eval"`).
    pub fn new(command: &str, args: Vec<String>) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        let mut all_args: Vec<String> = parts.collect();
        all_args.extend(args);
        Self {
            program,
            args: all_args,
            timeout: Duration::from_secs(crate::forge_config::DEFAULT_ORACLE_TIMEOUT_SECS),
            results_file: "results.jsonl".to_string(),
            working_dir: None,
        }
    }

    /// Build from `guideforge.toml`; `None` when no oracle command is set.
    pub fn from_settings(settings: &ForgeToml, base_dir: &Path) -> Option<Self> {
        let command = settings.oracle_cmd()?;
        let oracle = Self::new(&command, settings.oracle.args.clone())
            .with_timeout(settings.oracle_timeout())
            .with_results_file(settings.oracle_results_file());
        Some(match &settings.oracle.working_dir {
            Some(dir) => oracle.with_working_dir(base_dir.join(dir)),
            None => oracle.with_working_dir(base_dir.to_path_buf()),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_results_file(mut self, name: impl Into<String>) -> Self {
        self.results_file = name.into();
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn results_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.results_file)
    }

    fn expand(arg: &str, request: &OracleRequest) -> String {
        arg.replace("{target}", &request.target_id)
            .replace("{artifact}", &request.artifact_path.to_string_lossy())
            .replace("{filter}", request.test_filter.as_deref().unwrap_or(""))
            .replace("{output_dir}", &request.output_dir.to_string_lossy())
    }

    fn build_command(&self, request: &OracleRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| Self::expand(a, request)))
            .env("GUIDEFORGE_TARGET", &request.target_id)
            .env("GUIDELINES_PATH", &request.artifact_path)
            .env("OUTPUT_TEMPDIR", &request.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &request.test_filter {
            Some(filter) => cmd.env("TEST_FILTER", filter),
            None => cmd.env_remove("TEST_FILTER"),
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

fn count_records(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|c| c.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

fn read_last_record(path: &Path) -> Result<EvalRunResult, OracleError> {
    let content = std::fs::read_to_string(path).map_err(|_| OracleError::NoResult {
        path: path.to_path_buf(),
    })?;
    let last = content
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| OracleError::NoResult {
            path: path.to_path_buf(),
        })?;
    serde_json::from_str(last).map_err(|source| OracleError::MalformedResult {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl EvalOracle for CommandOracle {
    async fn evaluate(&self, request: &OracleRequest) -> Result<EvalRunResult, OracleError> {
        if let Some(filter) = &request.test_filter {
            validate_test_filter(filter)?;
        }
        std::fs::create_dir_all(&request.output_dir).map_err(|e| {
            OracleError::Other(anyhow::anyhow!(
                "Failed to create oracle output directory {}: {}",
                request.output_dir.display(),
                e
            ))
        })?;

        let results_path = self.results_path(&request.output_dir);
        let log_path = request.output_dir.join("oracle.log");
        let before = count_records(&results_path);

        info!(
            target = %request.target_id,
            artifact = %request.artifact_path.display(),
            filter = request.test_filter.as_deref().unwrap_or(""),
            "Running evaluation oracle"
        );
        let start = Instant::now();

        let child = self
            .build_command(request)
            .spawn()
            .map_err(|source| OracleError::SpawnFailed {
                command: self.program.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(OracleError::Other(anyhow::anyhow!(
                    "Failed waiting for oracle: {}",
                    e
                )));
            }
            Err(_) => {
                warn!(after = ?self.timeout, "Oracle timed out; process killed");
                append_log_block(&log_path, "guideforge", "oracle timed out and was killed");
                return Err(OracleError::Timeout {
                    after: self.timeout,
                });
            }
        };

        append_log_block(&log_path, "stdout", &String::from_utf8_lossy(&output.stdout));
        append_log_block(&log_path, "stderr", &String::from_utf8_lossy(&output.stderr));

        // Test runners exit non-zero when tests fail, so the status alone
        // says nothing about whether a result was recorded.
        if !output.status.success() {
            debug!(code = ?output.status.code(), "Oracle exited with non-zero status");
        }

        if count_records(&results_path) <= before {
            return Err(OracleError::NoResult { path: results_path });
        }
        let result = read_last_record(&results_path)?;
        info!(
            passed = result.passed,
            failed = result.failed,
            total = result.total,
            elapsed_secs = start.elapsed().as_secs(),
            "Oracle finished"
        );
        Ok(result)
    }
}
