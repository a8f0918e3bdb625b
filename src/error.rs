use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error surface of the engine. Each variant carries a stable code and a
/// suggested (non-normative) HTTP status for callers that adapt this crate
/// to a transport layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("idempotency key must be a non-empty string")]
    InvalidKey,

    #[error("retention must be at least 24 hours, got {retention_ms}ms")]
    InvalidRetention { retention_ms: u64 },

    #[error("{0}")]
    Validation(String),

    #[error("idempotency key was already committed with a different payload fingerprint")]
    FingerprintMismatch { stored_fingerprint: String },

    #[error("an operation with this idempotency key is already in progress")]
    OperationInProgress,

    #[error("handler did not settle within {timeout_ms}ms")]
    HandlerTimeout { timeout_ms: u64 },

    #[error("store operation failed: {0}")]
    Store(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code, also appended to failure audit events.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidKey => "INVALID_KEY",
            EngineError::InvalidRetention { .. } => "INVALID_RETENTION",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::FingerprintMismatch { .. } => "FINGERPRINT_MISMATCH",
            EngineError::OperationInProgress => "OPERATION_IN_PROGRESS",
            EngineError::HandlerTimeout { .. } => "HANDLER_TIMEOUT",
            EngineError::Store(_) => "STORE_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Suggested HTTP status for transport adapters.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::InvalidKey => 400,
            EngineError::InvalidRetention { .. } => 400,
            EngineError::Validation(_) => 400,
            EngineError::FingerprintMismatch { .. } => 422,
            EngineError::OperationInProgress => 409,
            EngineError::HandlerTimeout { .. } => 503,
            EngineError::Store(_) => 503,
            EngineError::Internal(_) => 500,
        }
    }
}
