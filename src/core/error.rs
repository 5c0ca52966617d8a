use std::time::Duration;
use thiserror::Error;

/// What went wrong while executing an artifact in the sandbox.
///
/// The classification drives the repair prompt, so the variants mirror the
/// buckets the fixer understands rather than raw process outcomes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    #[error("parse error")]
    Parse,
    #[error("runtime error")]
    Runtime,
    #[error("trial timeout")]
    Timeout,
    #[error("non-finite metric")]
    NonFinite,
    #[error("structural error")]
    Structural,
    #[error("insufficient stochasticity")]
    InsufficientStochasticity,
}

/// Engine error taxonomy. The scheduler branches on `is_transient()` to decide
/// whether a task gets backoff retries; everything else is terminal for that
/// task but never for the batch.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("sandbox provider unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("LLM provider unavailable: {0}")]
    LlmUnavailable(String),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("authorization rejected: {0}")]
    AuthDenied(String),

    #[error("research tool unavailable: {0}")]
    ResearchUnavailable(String),

    #[error("generated code invalid: {0}")]
    GenerationInvalid(String),

    #[error("repair attempts exhausted after {attempts} tries: {last_error}")]
    RepairExhausted { attempts: u32, last_error: String },

    #[error("calibration rejected ({kind}): {detail}")]
    CalibrationRejected { kind: FailureKind, detail: String },

    #[error("calibration batch too small: {runs} runs (minimum 5)")]
    CalibrationTooSmall { runs: u32 },

    #[error("pipeline exceeded wall-clock budget of {budget:?}")]
    PipelineTimeout { budget: Duration },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Transient failures are retried by the scheduler with exponential
    /// backoff; all other kinds terminate the task immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::SandboxUnavailable(_)
            | EngineError::LlmUnavailable(_)
            | EngineError::RateLimited(_) => true,
            EngineError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Short machine-readable tag stored in FailureRecords.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            EngineError::SandboxUnavailable(_) => "sandbox-unavailable",
            EngineError::LlmUnavailable(_) => "llm-unavailable",
            EngineError::RateLimited(_) => "rate-limited",
            EngineError::AuthDenied(_) => "auth-denied",
            EngineError::ResearchUnavailable(_) => "research-unavailable",
            EngineError::GenerationInvalid(_) => "generation-invalid",
            EngineError::RepairExhausted { .. } => "repair-exhausted",
            EngineError::CalibrationRejected { .. } => "calibration-rejected",
            EngineError::CalibrationTooSmall { .. } => "calibration-too-small",
            EngineError::PipelineTimeout { .. } => "pipeline-timeout",
            EngineError::Cancelled => "cancelled",
            EngineError::InvalidInput(_) => "invalid-input",
            EngineError::Http(_) => "http",
            EngineError::Other(_) => "other",
        }
    }
}
