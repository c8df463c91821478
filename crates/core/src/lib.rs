pub mod constitution;
pub mod extractor;
pub mod invariants;
pub mod judges;
pub mod pipeline;
pub mod prompt_guard;
pub mod report;
pub mod scanner;
pub mod static_gate;
pub mod tribunal;

pub use invariants::{Category, Invariant, InvariantSet, Severity};
pub use tribunal::{CriterionResult, JudgeVerdict, TribunalVerdict, Verdict};

/// Error taxonomy for the verification engine. Transient per-call failures
/// are absorbed into verdict metadata and never appear here; these are the
/// structural failures that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("configuration error: {0}")]
    Config(#[from] verdex_config::ConfigError),

    #[error("specification file not found: {0}")]
    SpecMissing(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("context build failed: {0}")]
    ContextBuild(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VerifyError {
    /// Stage name recorded in the minimal verdict emitted on abort.
    pub fn stage(&self) -> &'static str {
        match self {
            VerifyError::Config(_) => "config",
            VerifyError::SpecMissing(_) => "spec",
            VerifyError::ExtractionFailed(_) => "extraction",
            VerifyError::ContextBuild(_) => "context",
            VerifyError::Io(_) => "io",
            VerifyError::Other(_) => "pipeline",
        }
    }
}
