use thiserror::Error;

/// Common error types used across the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Delivery timed out after {0}s")]
    Timeout(u64),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether an attempt that failed with this error may be retried.
    /// Transport and store failures are transient; validation and
    /// configuration failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Delivery(_) | EngineError::Timeout(_) | EngineError::Store(_)
        )
    }
}
