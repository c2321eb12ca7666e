use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Word runs and individual punctuation marks each count as one token.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+|[^\w\s]").expect("token pattern is valid"));

/// Approximate token count for a guideline text.
///
/// This is not a model tokenizer. It only needs to be stable across runs so
/// that token deltas between two versions of the same artifact are
/// comparable.
pub fn count_tokens(text: &str) -> usize {
    TOKEN_RE.find_iter(text).count()
}

/// A guideline text blob together with its derived token count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidelineArtifact {
    pub text: String,
    pub token_count: usize,
}

impl GuidelineArtifact {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let token_count = count_tokens(&text);
        Self { text, token_count }
    }

    pub fn empty() -> Self {
        Self::new(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Signed token difference `self - other`.
    ///
    /// Negative means `self` is shorter than `other`.
    pub fn token_delta_from(&self, other: &GuidelineArtifact) -> i64 {
        self.token_count as i64 - other.token_count as i64
    }
}

impl From<String> for GuidelineArtifact {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for GuidelineArtifact {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}
