//! Client-facing error taxonomy.

use serde::Serialize;
use thiserror::Error;

/// Errors returned to clients before or instead of an execution result.
///
/// Every variant is raised synchronously by the scheduler; none of them
/// leaves a submission behind in the queue or the result store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("language {0} is not supported")]
    UnsupportedLanguage(String),

    #[error("no code to execute")]
    EmptySource,

    #[error("source code is {size} bytes, the limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("execution queue is full")]
    QueueFull,

    #[error("too many submissions from client {0} in the last minute")]
    RateLimited(String),

    #[error("client {0} has too many submissions in flight")]
    ConcurrencyLimitExceeded(String),

    #[error("submission {0} not found")]
    NotFound(String),

    #[error("service is shutting down")]
    ShuttingDown,
}

impl ServiceError {
    /// Stable machine-readable name carried in the `error` field of responses
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "UnsupportedLanguage",
            Self::EmptySource => "EmptySource",
            Self::SourceTooLarge { .. } => "SourceTooLarge",
            Self::QueueFull => "QueueFull",
            Self::RateLimited(_) => "RateLimited",
            Self::ConcurrencyLimitExceeded(_) => "ConcurrencyLimitExceeded",
            Self::NotFound(_) => "NotFound",
            Self::ShuttingDown => "ShuttingDown",
        }
    }

    /// Admission backpressure the client may retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::RateLimited(_) | Self::ConcurrencyLimitExceeded(_)
        )
    }
}

/// Why a terminal `Failed` result failed
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    CompileFailed,
    RuntimeFailed,
    OutputLimitExceeded,
    MemoryLimitExceeded,
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_names() {
        assert_eq!(
            ServiceError::UnsupportedLanguage("ruby".into()).reason(),
            "UnsupportedLanguage"
        );
        assert_eq!(ServiceError::QueueFull.reason(), "QueueFull");
        assert!(ServiceError::RateLimited("c".into()).is_retryable());
        assert!(!ServiceError::EmptySource.is_retryable());
    }

    #[test]
    fn test_failure_kind_serializes_as_name() {
        let json = serde_json::to_string(&FailureKind::OutputLimitExceeded).unwrap();
        assert_eq!(json, "\"OutputLimitExceeded\"");
    }
}
