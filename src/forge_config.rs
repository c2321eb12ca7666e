//! Layered configuration for guideforge.
//!
//! Settings are read from `guideforge.toml` in the base directory, then
//! environment variables, then CLI flags (applied by the caller). Every loop
//! constant of the phase engines is a named, overridable value here.
//!
//! # Configuration File Format
//!
//! ```toml
//! [construction]
//! max_iterations = 50
//! max_regression_allowed = 2
//! min_pass_rate = 0.9
//! stable_plateau_iterations = 5
//! stability_check_runs = 3
//! recent_feedback = 5
//!
//! [refinement]
//! enabled = true
//! max_consecutive_rejections = 10
//! aggressive_token_threshold = 50
//!
//! [dispatch]
//! max_parallel_analyzers = 5
//!
//! [history]
//! max_records = 20
//!
//! [oracle]
//! command = "bun"
//! args = ["run", "evals", "--model", "{target}", "--guidelines", "{artifact}", "--out", "{output_dir}"]
//! timeout_secs = 3600
//! results_file = "results.jsonl"
//! test_filter = "000-fundamentals/.*"
//!
//! [completion]
//! command = "claude"
//! model = "claude-sonnet-4-5"
//! timeout_secs = 300
//! max_parse_attempts = 3
//!
//! [target]
//! seed_file = "seed-guidelines.md"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::{
    AGGRESSIVE_TOKEN_THRESHOLD, Limits, MAX_CONSECUTIVE_REJECTIONS, MAX_CONSTRUCTION_ITERATIONS,
    MAX_HISTORY_RECORDS, MAX_PARALLEL_ANALYZERS, MAX_REGRESSION_ALLOWED, MIN_PASS_RATE_THRESHOLD,
    RECENT_FEEDBACK_WINDOW, STABILITY_CHECK_RUNS, STABLE_PLATEAU_ITERATIONS,
};

/// File name looked up in the base directory.
pub const CONFIG_FILE: &str = "guideforge.toml";

/// Default ceiling for one oracle invocation.
pub const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 3600;

/// Default deadline for one completion call.
pub const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 300;

/// Default bound on structured-output parse attempts.
pub const DEFAULT_MAX_PARSE_ATTEMPTS: u32 = 3;

/// Construction loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructionSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_regression_allowed")]
    pub max_regression_allowed: u32,
    #[serde(default = "default_min_pass_rate")]
    pub min_pass_rate: f64,
    #[serde(default = "default_stable_plateau_iterations")]
    pub stable_plateau_iterations: u32,
    #[serde(default = "default_stability_check_runs")]
    pub stability_check_runs: u32,
    #[serde(default = "default_recent_feedback")]
    pub recent_feedback: usize,
}

fn default_max_iterations() -> u32 {
    MAX_CONSTRUCTION_ITERATIONS
}

fn default_max_regression_allowed() -> u32 {
    MAX_REGRESSION_ALLOWED
}

fn default_min_pass_rate() -> f64 {
    MIN_PASS_RATE_THRESHOLD
}

fn default_stable_plateau_iterations() -> u32 {
    STABLE_PLATEAU_ITERATIONS
}

fn default_stability_check_runs() -> u32 {
    STABILITY_CHECK_RUNS
}

fn default_recent_feedback() -> usize {
    RECENT_FEEDBACK_WINDOW
}

impl Default for ConstructionSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_regression_allowed: default_max_regression_allowed(),
            min_pass_rate: default_min_pass_rate(),
            stable_plateau_iterations: default_stable_plateau_iterations(),
            stability_check_runs: default_stability_check_runs(),
            recent_feedback: default_recent_feedback(),
        }
    }
}

/// Refinement loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_consecutive_rejections")]
    pub max_consecutive_rejections: u32,
    #[serde(default = "default_aggressive_token_threshold")]
    pub aggressive_token_threshold: i64,
}

fn default_true() -> bool {
    true
}

fn default_max_consecutive_rejections() -> u32 {
    MAX_CONSECUTIVE_REJECTIONS
}

fn default_aggressive_token_threshold() -> i64 {
    AGGRESSIVE_TOKEN_THRESHOLD
}

impl Default for RefinementSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_consecutive_rejections: default_max_consecutive_rejections(),
            aggressive_token_threshold: default_aggressive_token_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_max_parallel_analyzers")]
    pub max_parallel_analyzers: usize,
}

fn default_max_parallel_analyzers() -> usize {
    MAX_PARALLEL_ANALYZERS
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_parallel_analyzers: default_max_parallel_analyzers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySection {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_max_records() -> usize {
    MAX_HISTORY_RECORDS
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
        }
    }
}

/// How to launch the evaluation oracle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleSection {
    /// Program to run. Falls back to `GUIDEFORGE_ORACLE_CMD`.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments; `{target}`, `{artifact}`, `{filter}` and `{output_dir}`
    /// are substituted per invocation.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub results_file: Option<String>,
    /// Regex restricting which evals run. Falls back to `TEST_FILTER`.
    #[serde(default)]
    pub test_filter: Option<String>,
    /// Working directory for the oracle, relative to the base directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// How to reach the completion service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionSection {
    /// Claude CLI command (default: "claude").
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_parse_attempts: Option<u32>,
    #[serde(default)]
    pub skip_permissions: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSection {
    /// Initial guidelines used when a target has no artifact yet.
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

/// Root of `guideforge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeToml {
    #[serde(default)]
    pub construction: ConstructionSection,
    #[serde(default)]
    pub refinement: RefinementSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub completion: CompletionSection,
    #[serde(default)]
    pub target: TargetSection,
}

impl ForgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse guideforge.toml")
    }

    /// Load `guideforge.toml` from `base_dir`, or defaults if it is absent.
    pub fn load_or_default(base_dir: &Path) -> Result<Self> {
        let config_path = base_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize guideforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Loop constants for the phase engines.
    pub fn limits(&self) -> Limits {
        Limits {
            max_construction_iterations: self.construction.max_iterations,
            max_regression_allowed: self.construction.max_regression_allowed,
            min_pass_rate: self.construction.min_pass_rate,
            stable_plateau_iterations: self.construction.stable_plateau_iterations,
            stability_check_runs: self.construction.stability_check_runs,
            recent_feedback: self.construction.recent_feedback,
            max_parallel_analyzers: self.dispatch.max_parallel_analyzers,
            max_history_records: self.history.max_records,
            max_consecutive_rejections: self.refinement.max_consecutive_rejections,
            aggressive_token_threshold: self.refinement.aggressive_token_threshold,
        }
    }

    /// Oracle command, with fallback to `GUIDEFORGE_ORACLE_CMD`.
    pub fn oracle_cmd(&self) -> Option<String> {
        self.oracle
            .command
            .clone()
            .or_else(|| std::env::var("GUIDEFORGE_ORACLE_CMD").ok())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(
            self.oracle
                .timeout_secs
                .unwrap_or(DEFAULT_ORACLE_TIMEOUT_SECS),
        )
    }

    pub fn oracle_results_file(&self) -> String {
        self.oracle
            .results_file
            .clone()
            .unwrap_or_else(|| "results.jsonl".to_string())
    }

    /// Test filter, with fallback to `TEST_FILTER`.
    pub fn test_filter(&self) -> Option<String> {
        self.oracle
            .test_filter
            .clone()
            .or_else(|| std::env::var("TEST_FILTER").ok())
            .filter(|f| !f.trim().is_empty())
    }

    /// Get the Claude command, with fallback to environment variable.
    pub fn claude_cmd(&self) -> String {
        self.completion
            .command
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Model name, with fallback to `GUIDEFORGE_MODEL`.
    pub fn completion_model(&self) -> Option<String> {
        self.completion
            .model
            .clone()
            .or_else(|| std::env::var("GUIDEFORGE_MODEL").ok())
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(
            self.completion
                .timeout_secs
                .unwrap_or(DEFAULT_COMPLETION_TIMEOUT_SECS),
        )
    }

    pub fn max_parse_attempts(&self) -> u32 {
        self.completion
            .max_parse_attempts
            .unwrap_or(DEFAULT_MAX_PARSE_ATTEMPTS)
    }

    pub fn skip_permissions(&self) -> bool {
        self.completion.skip_permissions.unwrap_or(true)
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let rate = self.construction.min_pass_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            problems.push(format!(
                "Invalid min_pass_rate {}: must be in (0, 1]",
                rate
            ));
        }
        if self.construction.stability_check_runs == 0 {
            problems.push("stability_check_runs must be at least 1".to_string());
        }
        if self.construction.max_iterations == 0 {
            problems.push("max_iterations must be at least 1".to_string());
        }
        if self.dispatch.max_parallel_analyzers == 0 {
            problems.push("max_parallel_analyzers must be at least 1".to_string());
        }
        if self.history.max_records < 2 {
            problems.push("history.max_records must be at least 2 to derive feedback".to_string());
        }
        if let Some(filter) = self.test_filter()
            && let Err(e) = regex::Regex::new(&filter)
        {
            problems.push(format!("Invalid test_filter '{}': {}", filter, e));
        }

        problems
    }
}
