//! Error types for the spam-report pipeline.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures reported by the user directory, mailbox and spam checker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Transient overload; the only condition the classifier retries.
    #[error("too many requests")]
    TooManyRequests,

    #[error("batch of {size} users exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    /// Whether the failed call may succeed if repeated after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TooManyRequests)
    }
}

/// Pipeline engine errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage {stage} panicked: {reason}")]
    StagePanicked { stage: String, reason: String },
}
