//! Core types for the call engine
//!
//! Identifiers, the order confirmation status, and the durable call attempt
//! record that the session state machine drives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Order identifier (owned by the order service)
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call attempt identifier
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct AttemptId(pub String);

impl AttemptId {
    pub fn new() -> Self {
        Self(format!("attempt-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the telephony provider assigns once dialing begins
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProviderCallId(pub String);

impl ProviderCallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderCallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a stored enum column holds an unknown value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Generates `as_str`, `Display` and `FromStr` for unit-only enums stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }
    };
}

/// Which provider sent a callback; sequence numbers are only comparable within one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    Telephony,
    Voice,
}

text_enum!(WebhookSource {
    Telephony => "telephony",
    Voice => "voice",
});

/// Confirmation status of an order
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Unconfirmed,
    Confirming,
    Confirmed,
    Declined,
    Unreachable,
}

text_enum!(ConfirmationStatus {
    Unconfirmed => "unconfirmed",
    Confirming => "confirming",
    Confirmed => "confirmed",
    Declined => "declined",
    Unreachable => "unreachable",
});

impl ConfirmationStatus {
    /// Final statuses are never left once reached
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ConfirmationStatus::Confirmed | ConfirmationStatus::Declined | ConfirmationStatus::Unreachable
        )
    }
}

/// State of a single call attempt
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Queued,
    Dialing,
    InProgress,
    Completed,
    Failed,
    Abandoned,
}

text_enum!(CallState {
    Queued => "queued",
    Dialing => "dialing",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Abandoned => "abandoned",
});

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed | CallState::Abandoned)
    }

    /// States that count against the one-active-attempt-per-order rule
    pub const ACTIVE: [CallState; 3] = [CallState::Queued, CallState::Dialing, CallState::InProgress];
}

/// Outcome recorded when an attempt completes
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    ConfirmedByCustomer,
    DeclinedByCustomer,
    NoResponse,
}

text_enum!(CallOutcome {
    ConfirmedByCustomer => "confirmed_by_customer",
    DeclinedByCustomer => "declined_by_customer",
    NoResponse => "no_response",
});

/// Reason recorded when an attempt fails
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ProviderError,
    Timeout,
    InvalidNumber,
    RateLimited,
}

text_enum!(FailureReason {
    ProviderError => "provider_error",
    Timeout => "timeout",
    InvalidNumber => "invalid_number",
    RateLimited => "rate_limited",
});

impl FailureReason {
    /// Failures the retry policy may retry
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::InvalidNumber)
    }
}

/// Recording and transcript details collected while a call runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArtifacts {
    pub transcript: Option<String>,
    pub recording_url: Option<String>,
    pub duration_secs: Option<i64>,
}

impl CallArtifacts {
    /// Fill in fields that are still empty from `other`
    pub fn merge(&mut self, other: &CallArtifacts) {
        if other.transcript.is_some() {
            self.transcript = other.transcript.clone();
        }
        if other.recording_url.is_some() {
            self.recording_url = other.recording_url.clone();
        }
        if other.duration_secs.is_some() {
            self.duration_secs = other.duration_secs;
        }
    }
}

/// One dial-and-converse episode for an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub id: AttemptId,
    pub order_id: OrderId,
    /// 1-based, no gaps per order
    pub attempt_number: u32,
    pub state: CallState,
    /// Set only when `state` is Completed
    pub outcome: Option<CallOutcome>,
    /// Set only when `state` is Failed
    pub failure_reason: Option<FailureReason>,
    pub provider_call_id: Option<ProviderCallId>,
    /// Highest telephony sequence applied; -1 before any telephony event
    pub last_applied_telephony_sequence: i64,
    /// Highest voice provider sequence applied; -1 before any disposition
    pub last_applied_voice_sequence: i64,
    pub language: String,
    pub voice_id: Option<String>,
    pub artifacts: CallArtifacts,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Last time any event moved or touched this attempt
    pub last_event_at: DateTime<Utc>,
}

impl CallAttempt {
    /// A freshly queued attempt
    pub fn queued(
        order_id: OrderId,
        attempt_number: u32,
        language: impl Into<String>,
        voice_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AttemptId::new(),
            order_id,
            attempt_number,
            state: CallState::Queued,
            outcome: None,
            failure_reason: None,
            provider_call_id: None,
            last_applied_telephony_sequence: -1,
            last_applied_voice_sequence: -1,
            language: language.into(),
            voice_id,
            artifacts: CallArtifacts::default(),
            created_at: now,
            started_at: None,
            ended_at: None,
            last_event_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Highest sequence applied from one provider
    pub fn last_applied_sequence(&self, source: WebhookSource) -> i64 {
        match source {
            WebhookSource::Telephony => self.last_applied_telephony_sequence,
            WebhookSource::Voice => self.last_applied_voice_sequence,
        }
    }

    pub(crate) fn set_last_applied_sequence(&mut self, source: WebhookSource, sequence: i64) {
        match source {
            WebhookSource::Telephony => self.last_applied_telephony_sequence = sequence,
            WebhookSource::Voice => self.last_applied_voice_sequence = sequence,
        }
    }

    /// Call duration: provider-reported when known, else wall clock between start and end
    pub fn duration_secs(&self) -> Option<i64> {
        self.artifacts.duration_secs.or_else(|| match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds().max(0)),
            _ => None,
        })
    }

    pub fn summary(&self) -> CallAttemptSummary {
        CallAttemptSummary {
            attempt_id: self.id.clone(),
            order_id: self.order_id.clone(),
            attempt_number: self.attempt_number,
            state: self.state,
            outcome: self.outcome,
            failure_reason: self.failure_reason,
            provider_call_id: self.provider_call_id.clone(),
            created_at: self.created_at,
        }
    }
}

/// What the initiate-call API returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttemptSummary {
    pub attempt_id: AttemptId,
    pub order_id: OrderId,
    pub attempt_number: u32,
    pub state: CallState,
    pub outcome: Option<CallOutcome>,
    pub failure_reason: Option<FailureReason>,
    pub provider_call_id: Option<ProviderCallId>,
    pub created_at: DateTime<Utc>,
}

/// Exclusive, time-bounded right to progress an order's active attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub order_id: OrderId,
    pub owner_id: String,
    pub attempt_id: Option<AttemptId>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_text_enums_parse_their_own_output() {
        for state in [
            CallState::Queued,
            CallState::Dialing,
            CallState::InProgress,
            CallState::Completed,
            CallState::Failed,
            CallState::Abandoned,
        ] {
            assert_eq!(state.as_str().parse::<CallState>().unwrap(), state);
        }
        assert!("ringing".parse::<CallState>().is_err());
        assert_eq!("invalid_number".parse::<FailureReason>().unwrap(), FailureReason::InvalidNumber);
    }

    #[test]
    fn test_terminal_and_final_classification() {
        assert!(!CallState::Dialing.is_terminal());
        assert!(CallState::Abandoned.is_terminal());
        assert!(ConfirmationStatus::Declined.is_final());
        assert!(!ConfirmationStatus::Confirming.is_final());
        assert!(!FailureReason::InvalidNumber.is_retryable());
        assert!(FailureReason::RateLimited.is_retryable());
    }

    #[test]
    fn test_duration_falls_back_to_timestamps() {
        let now = Utc::now();
        let mut attempt = CallAttempt::queued(OrderId::new("o-1"), 1, "en", None, now);
        assert_eq!(attempt.duration_secs(), None);

        attempt.started_at = Some(now);
        attempt.ended_at = Some(now + Duration::seconds(42));
        assert_eq!(attempt.duration_secs(), Some(42));

        attempt.artifacts.duration_secs = Some(40);
        assert_eq!(attempt.duration_secs(), Some(40));
    }
}
