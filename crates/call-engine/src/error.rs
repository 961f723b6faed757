use thiserror::Error;

use crate::types::FailureReason;

/// Call engine errors
#[derive(Error, Debug)]
pub enum CallEngineError {
    /// Malformed request, rejected synchronously
    #[error("Validation error: {0}")]
    Validation(String),

    /// An unexpired lease already exists for the order
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Order already finalized or its retry window is exhausted
    #[error("Not eligible: {0}")]
    NotEligible(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Webhook authenticity failure
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Webhook for a provider call id with no local attempt
    #[error("Unknown call id: {0}")]
    UnknownCallId(String),

    /// Provider sent an event type outside the known enumeration
    #[error("Unsupported event: {0}")]
    UnsupportedEvent(String),

    /// Provider-side or network failure
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Provider rate limit
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Destination number rejected by the provider
    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a caller should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Transient; the same request may succeed later
    RetryLater,
    /// Permanent for this order
    WillNotSucceed,
    /// The request itself is wrong
    Rejected,
    Internal,
}

impl CallEngineError {
    /// Create a new Validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new Conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new NotEligible error
    pub fn not_eligible<S: Into<String>>(msg: S) -> Self {
        Self::NotEligible(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new InvalidSignature error
    pub fn invalid_signature<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSignature(msg.into())
    }

    /// Create a new UnknownCallId error
    pub fn unknown_call_id<S: Into<String>>(msg: S) -> Self {
        Self::UnknownCallId(msg.into())
    }

    /// Create a new UnsupportedEvent error
    pub fn unsupported_event<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedEvent(msg.into())
    }

    /// Create a new ProviderError error
    pub fn provider<S: Into<String>>(msg: S) -> Self {
        Self::ProviderError(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            Self::Conflict(_) | Self::RateLimited(_) | Self::ProviderError(_) | Self::Timeout(_) => {
                ErrorDisposition::RetryLater
            }
            Self::InvalidNumber(_) | Self::NotEligible(_) => ErrorDisposition::WillNotSucceed,
            Self::Validation(_)
            | Self::InvalidSignature(_)
            | Self::UnsupportedEvent(_)
            | Self::NotFound(_)
            | Self::UnknownCallId(_) => ErrorDisposition::Rejected,
            Self::Database(_) | Self::Config(_) | Self::Internal(_) => ErrorDisposition::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == ErrorDisposition::RetryLater
    }

    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::NotEligible(_) => "not_eligible",
            Self::NotFound(_) => "not_found",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::UnknownCallId(_) => "unknown_call_id",
            Self::UnsupportedEvent(_) => "unsupported_event",
            Self::ProviderError(_) => "provider_error",
            Self::RateLimited(_) => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::InvalidNumber(_) => "invalid_number",
            Self::Database(_) => "database_error",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Failure returned by the telephony provider's dial operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider error: {0}")]
    ProviderError(String),
}

impl DialError {
    /// The failure reason recorded on the attempt
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            DialError::InvalidNumber(_) => FailureReason::InvalidNumber,
            DialError::RateLimited(_) => FailureReason::RateLimited,
            DialError::ProviderError(_) => FailureReason::ProviderError,
        }
    }
}

/// Failure returned by the voice provider while preparing a conversation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("voice provider rejected request: {0}")]
    Rejected(String),

    #[error("voice provider unavailable: {0}")]
    Unavailable(String),
}

/// Result type for call engine operations
pub type Result<T> = std::result::Result<T, CallEngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispositions_separate_retry_later_from_will_not_succeed() {
        assert_eq!(CallEngineError::conflict("held").disposition(), ErrorDisposition::RetryLater);
        assert_eq!(
            CallEngineError::RateLimited("429".into()).disposition(),
            ErrorDisposition::RetryLater
        );
        assert_eq!(
            CallEngineError::InvalidNumber("+1".into()).disposition(),
            ErrorDisposition::WillNotSucceed
        );
        assert_eq!(
            CallEngineError::not_eligible("declined").disposition(),
            ErrorDisposition::WillNotSucceed
        );
        assert_eq!(
            CallEngineError::invalid_signature("bad").disposition(),
            ErrorDisposition::Rejected
        );
        assert!(!CallEngineError::internal("boom").is_retryable());
    }

    #[test]
    fn test_dial_error_maps_to_failure_reason() {
        assert_eq!(
            DialError::InvalidNumber("21211".into()).failure_reason(),
            FailureReason::InvalidNumber
        );
        assert_eq!(
            DialError::RateLimited("slow down".into()).failure_reason(),
            FailureReason::RateLimited
        );
    }
}
