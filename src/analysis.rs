//! Per-failure analysis through the completion service.
//!
//! Each failing case gets its own prompt carrying the task description, the
//! expected and produced files, and the tail of the run log. The analyzer
//! never fails: a reply that cannot be parsed or a call that times out turns
//! into a low-confidence [`FailureAnalysis`], which the construction engine
//! discards before synthesis.

use guideforge_common::{EvalCaseResult, FailureAnalysis, GuidelineArtifact, eval_category};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::completion::{
    CallContext, CompletionRequest, CompletionService, RetryPolicy, complete_structured,
};
use crate::logging::sanitize_output;
use crate::util::{head_chars, tail_chars};

/// Marker line that opens every analysis prompt.
pub const ANALYSIS_MARKER: &str = "## FAILURE ANALYSIS";

const ANALYSIS_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["analysis", "suggestedGuideline", "confidence"],
  "properties": {
    "analysis": { "type": "string" },
    "suggestedGuideline": { "type": "string" },
    "confidence": { "enum": ["high", "medium", "low"] },
    "relatedLegacyGuidelines": { "type": "array", "items": { "type": "string" } }
  }
}"#;

const MAX_FILE_CHARS: usize = 4_000;
const MAX_LOG_CHARS: usize = 6_000;
const MAX_TASK_CHARS: usize = 4_000;

/// The model's reply; `evalName` is filled in locally.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisReply {
    analysis: String,
    suggested_guideline: String,
    confidence: guideforge_common::Confidence,
    #[serde(default)]
    related_legacy_guidelines: Vec<String>,
}

pub struct FailureAnalyzer {
    service: Arc<dyn CompletionService>,
    ctx: CallContext,
    policy: RetryPolicy,
}

impl FailureAnalyzer {
    pub fn new(service: Arc<dyn CompletionService>, ctx: CallContext, policy: RetryPolicy) -> Self {
        Self {
            service,
            ctx,
            policy,
        }
    }

    /// Analyze one failing case against the artifact that produced it.
    pub async fn analyze(
        &self,
        case: &EvalCaseResult,
        artifact: &GuidelineArtifact,
    ) -> FailureAnalysis {
        let request = CompletionRequest::new(build_prompt(case, artifact))
            .with_tools(&["Read", "Grep", "Glob"])
            .with_schema(ANALYSIS_SCHEMA);

        match complete_structured::<AnalysisReply>(self.service.as_ref(), &request, &self.ctx, self.policy)
            .await
        {
            Ok(reply) => {
                debug!(eval = %case.eval_name, confidence = %reply.confidence, "Analysis complete");
                FailureAnalysis {
                    eval_name: case.eval_name.clone(),
                    analysis: reply.analysis,
                    suggested_guideline: reply.suggested_guideline,
                    confidence: reply.confidence,
                    related_legacy_guidelines: reply.related_legacy_guidelines,
                }
            }
            Err(e) => {
                warn!(eval = %case.eval_name, error = %e, "Analysis unavailable; using low-confidence fallback");
                FailureAnalysis::fallback(&case.eval_name, format!("Analysis unavailable: {}", e))
            }
        }
    }
}

/// Group analyses by the category of their eval.
pub fn group_by_topic(analyses: &[FailureAnalysis]) -> BTreeMap<String, Vec<&FailureAnalysis>> {
    let mut groups: BTreeMap<String, Vec<&FailureAnalysis>> = BTreeMap::new();
    for analysis in analyses {
        groups
            .entry(eval_category(&analysis.eval_name).to_string())
            .or_default()
            .push(analysis);
    }
    groups
}

fn read_bounded(path: &Path, max_chars: usize) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let head = head_chars(&content, max_chars);
    if head.len() < content.len() {
        Some(format!("{}\n... (truncated)", head))
    } else {
        Some(content)
    }
}

fn task_description(task_path: &Path) -> Option<String> {
    if task_path.as_os_str().is_empty() {
        return None;
    }
    let file = if task_path.is_dir() {
        task_path.join("TASK.txt")
    } else {
        task_path.to_path_buf()
    };
    read_bounded(&file, MAX_TASK_CHARS)
}

fn push_files(prompt: &mut String, title: &str, files: &[std::path::PathBuf]) {
    if files.is_empty() {
        return;
    }
    prompt.push_str(&format!("\n### {}\n", title));
    for file in files {
        match read_bounded(file, MAX_FILE_CHARS) {
            Some(content) => prompt.push_str(&format!(
                "\n#### {}\n```\n{}\n```\n",
                file.display(),
                content.trim_end()
            )),
            None => prompt.push_str(&format!("\n#### {}\n(missing)\n", file.display())),
        }
    }
}

pub(crate) fn build_prompt(case: &EvalCaseResult, artifact: &GuidelineArtifact) -> String {
    let mut prompt = format!(
        "{}\n\nA code-generating model was given the guidelines below and failed the eval `{}`.\n\
         Explain the root cause and propose ONE guideline that would have prevented it.\n\
         Use confidence \"low\" if the failure looks unrelated to the guidelines (flaky test, infrastructure).\n",
        ANALYSIS_MARKER, case.eval_name
    );

    prompt.push_str("\n### Current guidelines\n");
    if artifact.is_empty() {
        prompt.push_str("(none yet)\n");
    } else {
        prompt.push_str(&format!("```markdown\n{}\n```\n", artifact.text.trim_end()));
    }

    if let Some(task) = task_description(&case.task_path) {
        prompt.push_str(&format!("\n### Task\n{}\n", task.trim_end()));
    }

    push_files(&mut prompt, "Expected files", &case.expected_files);
    push_files(&mut prompt, "Produced files", &case.output_files);

    if let Some(log_path) = &case.run_log_path
        && let Ok(log) = std::fs::read_to_string(log_path)
    {
        let clean = sanitize_output(&log);
        prompt.push_str(&format!(
            "\n### Run log (tail)\n```\n{}\n```\n",
            tail_chars(clean.trim_end(), MAX_LOG_CHARS)
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::{Reply, ScriptedCompletion};
    use guideforge_common::Confidence;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    fn case(name: &str) -> EvalCaseResult {
        EvalCaseResult {
            eval_name: name.to_string(),
            passed: false,
            task_path: PathBuf::new(),
            expected_files: Vec::new(),
            output_files: Vec::new(),
            run_log_path: None,
        }
    }

    fn analyzer(service: ScriptedCompletion, deadline: Duration) -> FailureAnalyzer {
        FailureAnalyzer::new(Arc::new(service), CallContext::new(deadline), RetryPolicy::new(3))
    }

    #[tokio::test]
    async fn test_analysis_parses_reply_and_sets_eval_name() {
        let service = ScriptedCompletion::new().on(
            ANALYSIS_MARKER,
            vec![Reply::text(
                r#"```json
{"analysis": "Missing returns validator", "suggestedGuideline": "Always declare returns", "confidence": "high"}
```"#,
            )],
        );
        let result = analyzer(service, Duration::from_secs(5))
            .analyze(&case("functions/returns"), &GuidelineArtifact::new("Be nice."))
            .await;
        assert_eq!(result.eval_name, "functions/returns");
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.is_actionable());
    }

    #[tokio::test]
    async fn test_parse_exhaustion_falls_back_to_low_confidence() {
        let service = ScriptedCompletion::new().on(ANALYSIS_MARKER, vec![Reply::text("I think it broke.")]);
        let result = analyzer(service, Duration::from_secs(5))
            .analyze(&case("a/b"), &GuidelineArtifact::empty())
            .await;
        assert_eq!(result.confidence, Confidence::Low);
        assert!(!result.is_actionable());
        assert!(result.analysis.contains("3 attempt"));
    }

    #[tokio::test]
    async fn test_timeout_falls_back_without_retry() {
        let service = Arc::new(ScriptedCompletion::new().on(ANALYSIS_MARKER, vec![Reply::Hang]));
        let analyzer = FailureAnalyzer::new(
            service.clone(),
            CallContext::new(Duration::from_millis(30)),
            RetryPolicy::new(3),
        );
        let result = analyzer.analyze(&case("a/b"), &GuidelineArtifact::empty()).await;
        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(service.calls(ANALYSIS_MARKER), 1);
    }

    #[test]
    fn test_prompt_embeds_task_files_and_sanitized_log() {
        let dir = tempdir().unwrap();
        let task_dir = dir.path().join("evals/000-fundamentals/001-empty");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("TASK.txt"), "Create an empty query.").unwrap();
        let expected = dir.path().join("expected.ts");
        std::fs::write(&expected, "export const f = query({});").unwrap();
        let log = dir.path().join("run.log");
        std::fs::write(&log, "\x1B[31mTypeError\x1B[0m: v.foo is not a function").unwrap();

        let mut failing = case("000-fundamentals/001-empty");
        failing.task_path = task_dir;
        failing.expected_files = vec![expected];
        failing.output_files = vec![dir.path().join("missing.ts")];
        failing.run_log_path = Some(log);

        let prompt = build_prompt(&failing, &GuidelineArtifact::new("Use validators."));
        assert!(prompt.starts_with(ANALYSIS_MARKER));
        assert!(prompt.contains("Create an empty query."));
        assert!(prompt.contains("export const f = query({});"));
        assert!(prompt.contains("(missing)"));
        assert!(prompt.contains("TypeError: v.foo is not a function"));
        assert!(prompt.contains("Use validators."));
        assert!(!prompt.contains('\x1B'));
    }

    #[test]
    fn test_group_by_topic_uses_category() {
        let analyses = vec![
            FailureAnalysis::fallback("functions/a", "x"),
            FailureAnalysis::fallback("schema/b", "x"),
            FailureAnalysis::fallback("functions/c", "x"),
            FailureAnalysis::fallback("loose", "x"),
        ];
        let groups = group_by_topic(&analyses);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["functions", "general", "schema"]);
        assert_eq!(groups["functions"].len(), 2);
    }
}
