//! Language-model completion service.
//!
//! Deadlines and cancellation live in a [`CallContext`] owned by the caller,
//! and retry is a [`RetryPolicy`] the caller passes in. Adapters only turn a
//! prompt into text. Only structured-output parse failures are retried; a
//! timed-out or failed call is returned to the caller as is.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::CompletionError;
use crate::forge_config::{DEFAULT_COMPLETION_TIMEOUT_SECS, DEFAULT_MAX_PARSE_ATTEMPTS, ForgeToml};
use crate::util::{extract_json_object, tail_chars};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Tool names the model may call while answering.
    pub tools: Vec<String>,
    /// JSON schema the reply must satisfy, if structured output is wanted.
    pub schema: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Prompt text with the schema instruction appended.
    pub fn rendered_prompt(&self) -> String {
        match &self.schema {
            Some(schema) => format!(
                "{}\n\nRespond with a single JSON object matching this schema and nothing else:\n```json\n{}\n```\n",
                self.prompt, schema
            ),
            None => self.prompt.clone(),
        }
    }
}

/// Per-call deadline plus a cancellation handle.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_COMPLETION_TIMEOUT_SECS))
    }
}

impl CallContext {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `fut` under this context. The future is dropped on timeout or
    /// cancellation; there is no partial result.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, CompletionError>
    where
        F: Future<Output = Result<T, CompletionError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CompletionError::Cancelled),
            _ = tokio::time::sleep(self.deadline) => Err(CompletionError::Timeout { after: self.deadline }),
            result = fut => result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_parse_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_parse_attempts: DEFAULT_MAX_PARSE_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_parse_attempts: u32) -> Self {
        Self {
            max_parse_attempts: max_parse_attempts.max(1),
        }
    }
}

/// Abstraction over the model backend. Real implementation:
/// [`ClaudeCliCompletion`]. Test double: `ScriptedCompletion`.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// One free-text completion under `ctx`.
pub async fn complete_text(
    service: &dyn CompletionService,
    request: &CompletionRequest,
    ctx: &CallContext,
) -> Result<String, CompletionError> {
    ctx.run(service.complete(request)).await
}

/// Ask for a JSON object and deserialize it into `T`.
///
/// Each attempt gets the full deadline from `ctx`. Unparseable replies are
/// retried up to `policy.max_parse_attempts`; any other error returns
/// immediately.
pub async fn complete_structured<T: DeserializeOwned>(
    service: &dyn CompletionService,
    request: &CompletionRequest,
    ctx: &CallContext,
    policy: RetryPolicy,
) -> Result<T, CompletionError> {
    let attempts = policy.max_parse_attempts.max(1);
    let mut last_problem = String::new();

    for attempt in 1..=attempts {
        let text = complete_text(service, request, ctx).await?;
        match parse_structured::<T>(&text) {
            Ok(value) => return Ok(value),
            Err(problem) => {
                warn!(attempt, attempts, problem = %problem, "Unparseable structured reply");
                last_problem = problem;
            }
        }
    }

    Err(CompletionError::StructuredOutputParse {
        attempts,
        message: last_problem,
    })
}

fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object in reply".to_string())?;
    serde_json::from_str(&json).map_err(|e| e.to_string())
}

/// Completion through the `claude` CLI in print mode, prompt on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeCliCompletion {
    command: String,
    model: Option<String>,
    skip_permissions: bool,
    working_dir: Option<PathBuf>,
}

impl ClaudeCliCompletion {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            model: None,
            skip_permissions: true,
            working_dir: None,
        }
    }

    pub fn from_settings(settings: &ForgeToml) -> Self {
        let mut service = Self::new(settings.claude_cmd());
        service.model = settings.completion_model();
        service.skip_permissions = settings.skip_permissions();
        service
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn flags(&self, request: &CompletionRequest) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        if let Some(model) = &self.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if !request.tools.is_empty() {
            flags.push("--allowedTools".to_string());
            flags.push(request.tools.join(","));
        }
        flags
    }
}

#[async_trait]
impl CompletionService for ClaudeCliCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let prompt = request.rendered_prompt();
        let mut cmd = Command::new(&self.command);
        cmd.args(self.flags(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CompletionError::Failed(format!("Failed to spawn {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| CompletionError::Failed(format!("Failed to write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| CompletionError::Failed(format!("Failed to close stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CompletionError::Failed(format!("Failed waiting for {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CompletionError::Failed(format!(
                "{} exited with {:?}: {}",
                self.command,
                output.status.code(),
                tail_chars(stderr.trim(), 500)
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(chars = text.len(), "Completion received");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::{Reply, ScriptedCompletion};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        value: u32,
    }

    #[tokio::test]
    async fn test_parse_failures_are_retried_until_success() {
        let service = ScriptedCompletion::new().on(
            "ASK",
            vec![
                Reply::text("no json here"),
                Reply::text("{\"value\": \"wrong type\"}"),
                Reply::text("Sure: {\"value\": 7}"),
            ],
        );
        let answer: Answer = complete_structured(
            &service,
            &CompletionRequest::new("ASK"),
            &CallContext::new(Duration::from_secs(5)),
            RetryPolicy::new(3),
        )
        .await
        .unwrap();
        assert_eq!(answer, Answer { value: 7 });
        assert_eq!(service.calls("ASK"), 3);
    }

    #[tokio::test]
    async fn test_parse_retries_are_bounded() {
        let service = ScriptedCompletion::new().on("ASK", vec![Reply::text("never json")]);
        let err = complete_structured::<Answer>(
            &service,
            &CompletionRequest::new("ASK"),
            &CallContext::new(Duration::from_secs(5)),
            RetryPolicy::new(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CompletionError::StructuredOutputParse { attempts: 3, .. }));
        assert_eq!(service.calls("ASK"), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let service = ScriptedCompletion::new().on("ASK", vec![Reply::Hang]);
        let err = complete_structured::<Answer>(
            &service,
            &CompletionRequest::new("ASK"),
            &CallContext::new(Duration::from_millis(50)),
            RetryPolicy::new(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CompletionError::Timeout { .. }));
        assert_eq!(service.calls("ASK"), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_retried() {
        let service = ScriptedCompletion::new().on("ASK", vec![Reply::fail("rate limited")]);
        let err = complete_structured::<Answer>(
            &service,
            &CompletionRequest::new("ASK"),
            &CallContext::default(),
            RetryPolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CompletionError::Failed(_)));
        assert_eq!(service.calls("ASK"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let service = ScriptedCompletion::new().on("ASK", vec![Reply::Hang]);
        let ctx = CallContext::new(Duration::from_secs(60));
        ctx.cancel.cancel();
        let err = complete_text(&service, &CompletionRequest::new("ASK"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Cancelled));
    }

    #[test]
    fn test_rendered_prompt_carries_schema() {
        let request = CompletionRequest::new("Explain").with_schema("{\"type\":\"object\"}");
        let rendered = request.rendered_prompt();
        assert!(rendered.starts_with("Explain"));
        assert!(rendered.contains("```json\n{\"type\":\"object\"}"));
        assert_eq!(CompletionRequest::new("plain").rendered_prompt(), "plain");
    }

    #[test]
    fn test_cli_flags() {
        let service = ClaudeCliCompletion::new("claude").with_model("claude-sonnet-4");
        let request = CompletionRequest::new("x").with_tools(&["Read", "Grep"]);
        let flags = service.flags(&request);
        assert_eq!(
            flags,
            vec![
                "--dangerously-skip-permissions",
                "--print",
                "--model",
                "claude-sonnet-4",
                "--allowedTools",
                "Read,Grep"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_non_zero_exit_is_failure() {
        // `false` ignores its arguments and exits 1.
        let service = ClaudeCliCompletion::new("false");
        let err = service.complete(&CompletionRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, CompletionError::Failed(_)));
    }

    #[tokio::test]
    async fn test_cli_missing_binary_is_failure() {
        let service = ClaudeCliCompletion::new("definitely-not-a-real-claude-binary");
        let err = service.complete(&CompletionRequest::new("x")).await.unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
