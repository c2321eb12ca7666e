//! Turning analyses into a new artifact, and proposing simplifications.

use guideforge_common::{FailureAnalysis, GuidelineArtifact, IterationFeedback};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::completion::{
    CallContext, CompletionRequest, CompletionService, RetryPolicy, complete_structured,
};
use crate::errors::CompletionError;

pub const SYNTHESIS_MARKER: &str = "## GUIDELINE SYNTHESIS";
pub const PROPOSAL_MARKER: &str = "## REFINEMENT PROPOSAL";

const SYNTHESIS_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["guidelines"],
  "properties": { "guidelines": { "type": "string" } }
}"#;

const PROPOSAL_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["guidelines", "summary"],
  "properties": {
    "guidelines": { "type": "string" },
    "summary": { "type": "string" }
  }
}"#;

#[derive(Debug, Deserialize)]
struct SynthesisReply {
    guidelines: String,
}

/// One candidate simplification of the committed artifact.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Proposal {
    pub guidelines: String,
    /// One line describing the change, kept for the rejection list.
    pub summary: String,
}

impl Proposal {
    pub fn artifact(&self) -> GuidelineArtifact {
        GuidelineArtifact::new(self.guidelines.clone())
    }
}

pub struct GuidelineSynthesizer {
    service: Arc<dyn CompletionService>,
    ctx: CallContext,
    policy: RetryPolicy,
}

impl GuidelineSynthesizer {
    pub fn new(service: Arc<dyn CompletionService>, ctx: CallContext, policy: RetryPolicy) -> Self {
        Self {
            service,
            ctx,
            policy,
        }
    }

    /// Fold surviving analyses into `current`, steered by recent feedback.
    pub async fn synthesize(
        &self,
        current: &GuidelineArtifact,
        grouped: &BTreeMap<String, Vec<&FailureAnalysis>>,
        feedback: &[IterationFeedback],
    ) -> Result<GuidelineArtifact, CompletionError> {
        let prompt = synthesis_prompt(current, grouped, feedback);
        debug!(chars = prompt.len(), topics = grouped.len(), "Requesting synthesis");
        let request = CompletionRequest::new(prompt).with_schema(SYNTHESIS_SCHEMA);
        let reply: SynthesisReply =
            complete_structured(self.service.as_ref(), &request, &self.ctx, self.policy).await?;
        Ok(GuidelineArtifact::new(reply.guidelines))
    }

    /// Ask for exactly one simplification of `committed`, avoiding changes
    /// already rejected.
    pub async fn propose_simplification(
        &self,
        committed: &GuidelineArtifact,
        rejections: &[String],
    ) -> Result<Proposal, CompletionError> {
        let prompt = proposal_prompt(committed, rejections);
        let request = CompletionRequest::new(prompt).with_schema(PROPOSAL_SCHEMA);
        complete_structured(self.service.as_ref(), &request, &self.ctx, self.policy).await
    }
}

fn synthesis_prompt(
    current: &GuidelineArtifact,
    grouped: &BTreeMap<String, Vec<&FailureAnalysis>>,
    feedback: &[IterationFeedback],
) -> String {
    let mut prompt = format!(
        "{}\n\nRewrite the guidelines so a code-generating model avoids the failures below.\n\
         Keep every guideline that still helps, merge duplicates, and return the complete new text.\n",
        SYNTHESIS_MARKER
    );

    prompt.push_str("\n### Current guidelines\n");
    if current.is_empty() {
        prompt.push_str("(none yet)\n");
    } else {
        prompt.push_str(&format!("```markdown\n{}\n```\n", current.text.trim_end()));
    }

    prompt.push_str("\n### Failure analyses by topic\n");
    for (topic, analyses) in grouped {
        prompt.push_str(&format!("\n#### {}\n", topic));
        for analysis in analyses {
            prompt.push_str(&format!(
                "- `{}` ({}): {}\n  Suggested: {}\n",
                analysis.eval_name,
                analysis.confidence,
                analysis.analysis.trim(),
                analysis.suggested_guideline.trim()
            ));
            if !analysis.related_legacy_guidelines.is_empty() {
                prompt.push_str(&format!(
                    "  Related: {}\n",
                    analysis.related_legacy_guidelines.join("; ")
                ));
            }
        }
    }

    if !feedback.is_empty() {
        prompt.push_str(
            "\n### Recent iterations\nDo not re-add changes that caused regressions.\n",
        );
        for item in feedback {
            let tag = if item.is_regression() { "[regression] " } else { "" };
            prompt.push_str(&format!("\n{}{}\n", tag, item.describe()));
        }
    }

    prompt
}

fn proposal_prompt(committed: &GuidelineArtifact, rejections: &[String]) -> String {
    let mut prompt = format!(
        "{}\n\nThe guidelines below make every eval pass. Propose exactly ONE simplification: \
         remove, merge, or reword a single entry. Return the complete new text and a one-line summary.\n\
         \n### Committed guidelines\n```markdown\n{}\n```\n",
        PROPOSAL_MARKER,
        committed.text.trim_end()
    );
    if !rejections.is_empty() {
        prompt.push_str("\n### Already rejected (do not repeat)\n");
        for rejection in rejections {
            prompt.push_str(&format!("- {}\n", rejection));
        }
    }
    prompt
}

/// Line-level change summary plus token movement, e.g.
/// `+3/-1 lines, tokens 120->134`.
pub fn diff_summary(old: &GuidelineArtifact, new: &GuidelineArtifact) -> String {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for line in old.text.lines().filter(|l| !l.trim().is_empty()) {
        *counts.entry(line.trim_end()).or_default() -= 1;
    }
    for line in new.text.lines().filter(|l| !l.trim().is_empty()) {
        *counts.entry(line.trim_end()).or_default() += 1;
    }
    let added: i64 = counts.values().filter(|c| **c > 0).sum();
    let removed: i64 = -counts.values().filter(|c| **c < 0).sum::<i64>();
    format!(
        "+{}/-{} lines, tokens {}->{}",
        added, removed, old.token_count, new.token_count
    )
}
