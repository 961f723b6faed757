//! Call attempt state machine
//!
//! ```text
//! Queued     --dial submitted-->             Dialing
//! Queued     --dial failed(reason)-->        Failed(reason)
//! Dialing    --initiated / ringing-->        Dialing (informational)
//! Dialing    --answered-->                   InProgress
//! Dialing    --busy / no-answer-->           Completed(NoResponse)
//! Dialing    --invalid number-->             Failed(InvalidNumber)
//! Dialing    --hangup / canceled-->          Completed(NoResponse)
//! InProgress --voice confirmed-->            Completed(ConfirmedByCustomer)
//! InProgress --voice declined-->             Completed(DeclinedByCustomer)
//! InProgress --voice timeout-->              Failed(Timeout)
//! InProgress --hangup / canceled-->          Completed(NoResponse)
//! non-terminal --provider error / lease expired--> Failed(ProviderError)
//! non-terminal --timed out-->                Failed(Timeout)
//! non-terminal --cancelled-->                Abandoned
//! ```
//!
//! Voice dispositions are also accepted from Dialing, where they imply the
//! answer callback was lost or is late. Terminal attempts never change.
//!
//! Everything here is pure: [`CallSession::apply`] returns the next version
//! of the attempt and the caller persists it with a conditional write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{CallAttempt, CallOutcome, CallState, FailureReason, ProviderCallId, WebhookSource};

/// Events that drive a call attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The telephony provider accepted the dial request
    DialSubmitted { provider_call_id: ProviderCallId },
    /// The dial request failed before a call existed
    DialFailed(FailureReason),

    // Telephony callbacks
    Initiated,
    Ringing,
    Answered,
    Busy,
    NoAnswer,
    InvalidNumber,
    /// Call ended without any voice disposition
    HangupNoDisposition,
    /// Provider reports the call was canceled before it connected
    Canceled,
    ProviderError,

    // Voice provider dispositions
    VoiceConfirmed,
    VoiceDeclined,
    VoiceTimeout,

    // Raised by the engine itself
    /// No qualifying event within the call ceiling
    TimedOut,
    /// The owning lease expired without the attempt finishing
    LeaseExpired,
    /// Operator cancelled the order confirmation
    Cancelled,
}

impl SessionEvent {
    /// Engine-raised events carry no provider sequence
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            SessionEvent::DialSubmitted { .. }
                | SessionEvent::DialFailed(_)
                | SessionEvent::TimedOut
                | SessionEvent::LeaseExpired
                | SessionEvent::Cancelled
        )
    }

    /// Provider that reports this event; `None` for engine-raised events
    pub fn source(&self) -> Option<WebhookSource> {
        match self {
            SessionEvent::VoiceConfirmed | SessionEvent::VoiceDeclined | SessionEvent::VoiceTimeout => {
                Some(WebhookSource::Voice)
            }
            e if e.is_internal() => None,
            _ => Some(WebhookSource::Telephony),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::DialSubmitted { .. } => "dial_submitted",
            SessionEvent::DialFailed(_) => "dial_failed",
            SessionEvent::Initiated => "initiated",
            SessionEvent::Ringing => "ringing",
            SessionEvent::Answered => "answered",
            SessionEvent::Busy => "busy",
            SessionEvent::NoAnswer => "no_answer",
            SessionEvent::InvalidNumber => "invalid_number",
            SessionEvent::HangupNoDisposition => "hangup_no_disposition",
            SessionEvent::Canceled => "canceled",
            SessionEvent::ProviderError => "provider_error",
            SessionEvent::VoiceConfirmed => "voice_confirmed",
            SessionEvent::VoiceDeclined => "voice_declined",
            SessionEvent::VoiceTimeout => "voice_timeout",
            SessionEvent::TimedOut => "timed_out",
            SessionEvent::LeaseExpired => "lease_expired",
            SessionEvent::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of looking an event up in the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to a new state
    To {
        state: CallState,
        outcome: Option<CallOutcome>,
        failure_reason: Option<FailureReason>,
    },
    /// Target equals the current state, or the event is informational
    NoOp,
    /// The event has no meaning in the current state
    Invalid,
}

impl Transition {
    fn to(state: CallState) -> Self {
        Transition::To {
            state,
            outcome: None,
            failure_reason: None,
        }
    }

    fn completed(outcome: CallOutcome) -> Self {
        Transition::To {
            state: CallState::Completed,
            outcome: Some(outcome),
            failure_reason: None,
        }
    }

    fn failed(reason: FailureReason) -> Self {
        Transition::To {
            state: CallState::Failed,
            outcome: None,
            failure_reason: Some(reason),
        }
    }
}

/// What applying an event did
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The attempt moved; persist the new version
    Applied(CallAttempt),
    /// Sequence not newer than the last applied one
    Stale,
    /// Idempotent replay, informational event, or terminal attempt
    NoOp,
    /// Event not valid for the current state
    Ignored,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied(_) => "applied",
            ApplyOutcome::Stale => "stale",
            ApplyOutcome::NoOp => "no_op",
            ApplyOutcome::Ignored => "ignored",
        }
    }
}

pub struct CallSession;

impl CallSession {
    /// The transition table
    pub fn transition(state: CallState, event: &SessionEvent) -> Transition {
        use SessionEvent as E;

        if state.is_terminal() {
            return Transition::NoOp;
        }

        // Events valid from every non-terminal state
        match event {
            E::ProviderError | E::LeaseExpired => return Transition::failed(FailureReason::ProviderError),
            E::TimedOut => return Transition::failed(FailureReason::Timeout),
            E::Cancelled => return Transition::to(CallState::Abandoned),
            _ => {}
        }

        match (state, event) {
            (CallState::Queued, E::DialSubmitted { .. }) => Transition::to(CallState::Dialing),
            (CallState::Queued, E::DialFailed(reason)) => Transition::failed(*reason),
            (CallState::Queued, _) => Transition::Invalid,

            (CallState::Dialing, E::Initiated | E::Ringing) => Transition::NoOp,
            (CallState::Dialing, E::Answered) => Transition::to(CallState::InProgress),
            (CallState::Dialing, E::Busy | E::NoAnswer) => Transition::completed(CallOutcome::NoResponse),
            (CallState::Dialing, E::InvalidNumber) => Transition::failed(FailureReason::InvalidNumber),

            (CallState::Dialing | CallState::InProgress, E::HangupNoDisposition | E::Canceled) => {
                Transition::completed(CallOutcome::NoResponse)
            }
            (CallState::Dialing | CallState::InProgress, E::VoiceConfirmed) => {
                Transition::completed(CallOutcome::ConfirmedByCustomer)
            }
            (CallState::Dialing | CallState::InProgress, E::VoiceDeclined) => {
                Transition::completed(CallOutcome::DeclinedByCustomer)
            }
            (CallState::Dialing | CallState::InProgress, E::VoiceTimeout) => {
                Transition::failed(FailureReason::Timeout)
            }

            (CallState::InProgress, E::Initiated | E::Ringing | E::Answered) => Transition::NoOp,

            _ => Transition::Invalid,
        }
    }

    /// Apply an event to an attempt.
    ///
    /// `sequence` is the provider-assigned ordering number; `None` for
    /// engine-raised events, which never move an applied sequence. It is
    /// compared only against the sequence last applied from the same provider.
    pub fn apply(
        attempt: &CallAttempt,
        event: &SessionEvent,
        sequence: Option<i64>,
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        if attempt.is_terminal() {
            return ApplyOutcome::NoOp;
        }

        let source = event.source();
        if let (Some(seq), Some(source)) = (sequence, source) {
            if seq <= attempt.last_applied_sequence(source) {
                return ApplyOutcome::Stale;
            }
        }

        let (state, outcome, failure_reason) = match Self::transition(attempt.state, event) {
            Transition::To {
                state,
                outcome,
                failure_reason,
            } => (state, outcome, failure_reason),
            Transition::NoOp => return ApplyOutcome::NoOp,
            Transition::Invalid => return ApplyOutcome::Ignored,
        };

        if state == attempt.state {
            return ApplyOutcome::NoOp;
        }

        let mut next = attempt.clone();
        next.state = state;
        next.outcome = outcome;
        next.failure_reason = failure_reason;
        next.last_event_at = now;
        if let (Some(seq), Some(source)) = (sequence, source) {
            next.set_last_applied_sequence(source, seq);
        }
        if let SessionEvent::DialSubmitted { provider_call_id } = event {
            next.provider_call_id = Some(provider_call_id.clone());
            next.started_at = Some(now);
        }
        if state.is_terminal() {
            next.ended_at = Some(now);
        }

        ApplyOutcome::Applied(next)
    }
}
