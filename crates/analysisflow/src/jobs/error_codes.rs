// crates/analysisflow/src/jobs/error_codes.rs
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    DependencyDown,
    RateLimit,
    WorkerLost,
    DocumentNotFound,
    BadDocument,
    Cancelled,
    EnqueueFailed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

impl ErrorCode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "DEPENDENCY_DOWN" => Self::DependencyDown,
            "RATE_LIMIT" => Self::RateLimit,
            "WORKER_LOST" => Self::WorkerLost,
            "DOCUMENT_NOT_FOUND" => Self::DocumentNotFound,
            "BAD_DOCUMENT" => Self::BadDocument,
            "CANCELLED" => Self::Cancelled,
            "ENQUEUE_FAILED" => Self::EnqueueFailed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::DependencyDown => "DEPENDENCY_DOWN",
            Self::RateLimit => "RATE_LIMIT",
            Self::WorkerLost => "WORKER_LOST",
            Self::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            Self::BadDocument => "BAD_DOCUMENT",
            Self::Cancelled => "CANCELLED",
            Self::EnqueueFailed => "ENQUEUE_FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    // Unknown failures are retried: the budget bounds the cost.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout
            | Self::DependencyDown
            | Self::RateLimit
            | Self::WorkerLost
            | Self::Unknown => ErrorClass::Retryable,
            Self::DocumentNotFound | Self::BadDocument | Self::Cancelled | Self::EnqueueFailed => {
                ErrorClass::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
