//! Error taxonomy shared by the orchestrator, its handles and the REST layer.
//!
//! Only `BackendFailure` and `TerminationFailed` describe unexpected failures;
//! every other kind is an expected, caller-visible outcome that callers are
//! meant to match on.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Malformed launch request or registration payload.
    #[error("invalid model spec: {0}")]
    InvalidSpec(String),

    /// No capacity left to launch another model.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unknown model uid or registration name.
    #[error("{0} not found")]
    NotFound(String),

    /// Registration name (or requested uid) already in use.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Wrong shape or type passed to generate/chat/embedding.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Backend resources could not be released; the registry entry is kept.
    #[error("failed to terminate model {uid}: {reason}")]
    TerminationFailed { uid: String, reason: String },

    /// The model was terminated while the request was in flight.
    #[error("model {0} was terminated while the request was in flight")]
    TerminatedMidRequest(String),

    /// Opaque failure from the inference backend, passed through verbatim.
    #[error("backend failure: {0}")]
    BackendFailure(String),
}

impl OrchestratorError {
    pub fn model_not_found(uid: &str) -> Self {
        Self::NotFound(format!("model `{}`", uid))
    }

    pub fn registration_not_found(name: &str) -> Self {
        Self::NotFound(format!("model registration `{}`", name))
    }

    pub fn backend(err: anyhow::Error) -> Self {
        Self::BackendFailure(format!("{:#}", err))
    }

    /// Stable machine-readable label, used in REST error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSpec(_) => "invalid_spec",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::NotFound(_) => "not_found",
            Self::DuplicateName(_) => "duplicate_name",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::TerminationFailed { .. } => "termination_failed",
            Self::TerminatedMidRequest(_) => "terminated_mid_request",
            Self::BackendFailure(_) => "backend_failure",
        }
    }

    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            Self::BackendFailure(_) | Self::TerminationFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
