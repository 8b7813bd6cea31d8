/// Engine-wide error type. Every fallible function returns `Result<T, AppError>`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A remediation action ran but did not resolve the issue. Advances the
    /// healing state machine to the next candidate action.
    #[error("Execution failure: {0}")]
    ExecutionFailure(String),

    /// Every candidate action for a healing session failed; the session is
    /// escalated to a human.
    #[error("Exhausted retries: {0}")]
    ExhaustedRetries(String),

    /// The agent runtime (or another collaborator) could not be reached.
    /// The affected agent's heartbeat is marked degraded/error and retried
    /// on the next cycle.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Two near-simultaneous mutations raced on the same record. Callers on
    /// the approval surface treat this as an idempotent no-op; it is never
    /// surfaced to an operator.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Short machine-readable tag, used in heartbeat sub-results and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::ExecutionFailure(_) => "execution_failure",
            AppError::ExhaustedRetries(_) => "exhausted_retries",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::ConcurrencyConflict(_) => "concurrency_conflict",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }
}
