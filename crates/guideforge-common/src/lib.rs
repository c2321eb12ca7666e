//! Shared domain types for guideforge.
//!
//! Everything in this crate is plain data: the guideline artifact, the
//! oracle's result contract, failure analyses, iteration records and the
//! live lock status. No I/O happens here; the orchestrator crate owns the
//! durable layout and the external collaborators.

pub mod analysis;
pub mod artifact;
pub mod eval;
pub mod record;
pub mod status;

pub use analysis::{Confidence, FailureAnalysis};
pub use artifact::{GuidelineArtifact, count_tokens};
pub use eval::{EvalCaseResult, EvalRunResult, eval_category};
pub use record::{IterationFeedback, IterationRecord};
pub use status::{LastEvalResult, LockFileStatus, RunPhase};
