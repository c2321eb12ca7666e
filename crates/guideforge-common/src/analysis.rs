use serde::{Deserialize, Serialize};

/// Reliability label attached to a model-produced failure analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

/// Analysis of one failing test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    /// Name of the eval this analysis explains. Filled in by the analyzer,
    /// not by the model.
    #[serde(default)]
    pub eval_name: String,
    pub analysis: String,
    pub suggested_guideline: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub related_legacy_guidelines: Vec<String>,
}

impl FailureAnalysis {
    /// Placeholder used when the model could not produce a usable analysis.
    ///
    /// It is always low confidence, so the construction engine discards it
    /// before synthesis.
    pub fn fallback(eval_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            eval_name: eval_name.into(),
            analysis: reason.into(),
            suggested_guideline: String::new(),
            confidence: Confidence::Low,
            related_legacy_guidelines: Vec::new(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.confidence != Confidence::Low && !self.suggested_guideline.trim().is_empty()
    }
}
