//! Typed error hierarchy for guideforge.
//!
//! Three top-level enums cover the three failure domains:
//! - `OrchestratorError`: lock, artifact and phase-engine failures
//! - `OracleError`: evaluation oracle invocation failures
//! - `CompletionError`: language-model completion failures

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from the orchestrator and its phase engines.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("A run for target '{target}' is already in progress (pid {pid}, run {run_id})")]
    DuplicateRun {
        target: String,
        pid: u32,
        run_id: Uuid,
    },

    #[error(
        "Construction exhausted after {iterations} iterations: best {best_pass_count}/{total} passing is below the acceptance threshold"
    )]
    ConstructionExhausted {
        iterations: u32,
        best_pass_count: u32,
        total: u32,
    },

    #[error("Lock file error at {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact slot error at {path}: {source}")]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single oracle invocation.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle did not finish within {after:?}")]
    Timeout { after: Duration },

    #[error("Failed to spawn oracle command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Oracle exited without appending a result to {path}")]
    NoResult { path: PathBuf },

    #[error("Oracle result in {path} is malformed: {source}")]
    MalformedResult {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a language-model completion call.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion call exceeded its deadline of {after:?}")]
    Timeout { after: Duration },

    #[error("Completion call was cancelled")]
    Cancelled,

    #[error("Could not parse structured output after {attempts} attempt(s): {message}")]
    StructuredOutputParse { attempts: u32, message: String },

    #[error("Completion call failed: {0}")]
    Failed(String),
}

impl CompletionError {
    /// Only structured-output parse failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompletionError::StructuredOutputParse { .. })
    }
}
