use pulse_core::PhaseName;
use thiserror::Error;

/// Why a single raw record could not become a canonical review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("rating missing or outside 1..=5")]
    BadRating,
    #[error("timestamp missing or unparsable")]
    BadTimestamp,
    #[error("review body is empty")]
    EmptyText,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Record-level; absorbed by the cleaning phase and counted, never fatal.
    #[error("malformed record: {0}")]
    MalformedRecord(#[from] MalformedReason),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("phase `{phase}` requires `{upstream}` to be done first")]
    MissingDependency {
        phase: PhaseName,
        upstream: PhaseName,
    },
    #[error("{phase}: external call failed: {message}")]
    ExternalCallFailure { phase: PhaseName, message: String },
    #[error("{phase}: response failed validation: {message}")]
    SchemaValidationFailure { phase: PhaseName, message: String },
    #[error("invalid run plan: {0}")]
    InvalidPlan(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn external(phase: PhaseName, err: impl std::fmt::Display) -> Self {
        PipelineError::ExternalCallFailure {
            phase,
            message: err.to_string(),
        }
    }

    pub fn schema(phase: PhaseName, message: impl Into<String>) -> Self {
        PipelineError::SchemaValidationFailure {
            phase,
            message: message.into(),
        }
    }
}
