//! Retry policy
//!
//! [`RetryScheduler::next_action`] is a pure function of an order's attempt
//! history and the policy. It performs no I/O; the orchestrator persists and
//! dispatches whatever it returns.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::types::{CallAttempt, CallOutcome, CallState, ConfirmationStatus};

/// Upper bound of the jitter, as a fraction of the computed delay
pub const MAX_JITTER_FRACTION: f64 = 0.2;

/// Retry policy parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Retry eligibility ends this long after the first attempt was created
    pub total_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::minutes(5),
            backoff_multiplier: 2.0,
            max_backoff: Duration::hours(1),
            total_window: Duration::hours(24),
        }
    }
}

/// What to do with an order after its latest attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Create the next attempt at this time
    RetryAt(DateTime<Utc>),
    /// Stop calling; the order is unreachable
    Abandon,
    /// The customer answered; finalize with this outcome
    Finalize(CallOutcome),
}

impl RetryAction {
    /// Final order status implied by this action, if any
    pub fn final_status(&self) -> Option<ConfirmationStatus> {
        match self {
            RetryAction::RetryAt(_) => None,
            RetryAction::Abandon => Some(ConfirmationStatus::Unreachable),
            RetryAction::Finalize(CallOutcome::ConfirmedByCustomer) => Some(ConfirmationStatus::Confirmed),
            RetryAction::Finalize(CallOutcome::DeclinedByCustomer) => Some(ConfirmationStatus::Declined),
            RetryAction::Finalize(CallOutcome::NoResponse) => Some(ConfirmationStatus::Unreachable),
        }
    }
}

pub struct RetryScheduler;

impl RetryScheduler {
    /// Decide the next action with random jitter
    pub fn next_action(history: &[CallAttempt], policy: &RetryPolicy, now: DateTime<Utc>) -> RetryAction {
        let jitter_fraction = rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION);
        Self::next_action_with_jitter(history, policy, now, jitter_fraction)
    }

    /// Decide the next action with a caller-supplied jitter fraction (clamped to `0.0..=0.2`)
    pub fn next_action_with_jitter(
        history: &[CallAttempt],
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        jitter_fraction: f64,
    ) -> RetryAction {
        let Some(latest) = history.iter().max_by_key(|a| a.attempt_number) else {
            return RetryAction::Abandon;
        };

        let retryable = match (latest.state, latest.outcome, latest.failure_reason) {
            (CallState::Completed, Some(outcome @ CallOutcome::ConfirmedByCustomer), _)
            | (CallState::Completed, Some(outcome @ CallOutcome::DeclinedByCustomer), _) => {
                return RetryAction::Finalize(outcome);
            }
            (CallState::Completed, Some(CallOutcome::NoResponse), _) => true,
            (CallState::Failed, _, Some(reason)) => reason.is_retryable(),
            // Abandoned means a policy-forced or operator stop
            _ => false,
        };
        if !retryable {
            return RetryAction::Abandon;
        }

        if latest.attempt_number >= policy.max_attempts {
            return RetryAction::Abandon;
        }

        let first_created = history.iter().map(|a| a.created_at).min().unwrap_or(latest.created_at);
        if now - first_created >= policy.total_window {
            return RetryAction::Abandon;
        }

        let delay = Self::backoff_delay(policy, latest.attempt_number);
        let jitter_ms = (delay.num_milliseconds() as f64 * jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION)) as i64;
        RetryAction::RetryAt(now + delay + Duration::milliseconds(jitter_ms))
    }

    /// `min(max_backoff, base * multiplier^(attempt_number - 1))`, without jitter
    pub fn backoff_delay(policy: &RetryPolicy, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1) as i32;
        let base_ms = policy.base_backoff.num_milliseconds() as f64;
        let raw_ms = base_ms * policy.backoff_multiplier.powi(exponent);
        let max_ms = policy.max_backoff.num_milliseconds();
        if !raw_ms.is_finite() || raw_ms >= max_ms as f64 {
            policy.max_backoff
        } else {
            Duration::milliseconds(raw_ms as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureReason, OrderId};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::seconds(60),
            backoff_multiplier: 2.0,
            max_backoff: Duration::seconds(600),
            total_window: Duration::hours(2),
        }
    }

    fn ended(number: u32, state: CallState, outcome: Option<CallOutcome>, reason: Option<FailureReason>, created: DateTime<Utc>) -> CallAttempt {
        let mut attempt = CallAttempt::queued(OrderId::new("o-1"), number, "en", None, created);
        attempt.state = state;
        attempt.outcome = outcome;
        attempt.failure_reason = reason;
        attempt
    }

    #[test]
    fn test_customer_answers_finalize() {
        let now = Utc::now();
        let history = vec![ended(1, CallState::Completed, Some(CallOutcome::ConfirmedByCustomer), None, now)];
        assert_eq!(
            RetryScheduler::next_action(&history, &policy(), now),
            RetryAction::Finalize(CallOutcome::ConfirmedByCustomer)
        );
    }

    #[test]
    fn test_declined_is_final_even_with_budget_left() {
        let now = Utc::now();
        let history = vec![ended(1, CallState::Completed, Some(CallOutcome::DeclinedByCustomer), None, now)];
        let action = RetryScheduler::next_action(&history, &policy(), now);
        assert_eq!(action, RetryAction::Finalize(CallOutcome::DeclinedByCustomer));
        assert_eq!(action.final_status(), Some(ConfirmationStatus::Declined));
    }

    #[test]
    fn test_no_response_retries_with_backoff() {
        let now = Utc::now();
        let history = vec![ended(1, CallState::Completed, Some(CallOutcome::NoResponse), None, now)];
        let action = RetryScheduler::next_action_with_jitter(&history, &policy(), now, 0.0);
        assert_eq!(action, RetryAction::RetryAt(now + Duration::seconds(60)));
    }

    #[test]
    fn test_invalid_number_abandons_immediately() {
        let now = Utc::now();
        let history = vec![ended(1, CallState::Failed, None, Some(FailureReason::InvalidNumber), now)];
        let action = RetryScheduler::next_action(&history, &policy(), now);
        assert_eq!(action, RetryAction::Abandon);
        assert_eq!(action.final_status(), Some(ConfirmationStatus::Unreachable));
    }

    #[test]
    fn test_budget_and_window_exhaustion_abandon() {
        let now = Utc::now();
        let history: Vec<_> = (1..=3)
            .map(|n| ended(n, CallState::Failed, None, Some(FailureReason::Timeout), now))
            .collect();
        assert_eq!(RetryScheduler::next_action(&history, &policy(), now), RetryAction::Abandon);

        let old = now - Duration::hours(3);
        let history = vec![ended(1, CallState::Failed, None, Some(FailureReason::RateLimited), old)];
        assert_eq!(RetryScheduler::next_action(&history, &policy(), now), RetryAction::Abandon);
    }

    #[test]
    fn test_abandoned_attempt_is_not_retried() {
        let now = Utc::now();
        let history = vec![ended(1, CallState::Abandoned, None, None, now)];
        assert_eq!(RetryScheduler::next_action(&history, &policy(), now), RetryAction::Abandon);
        assert_eq!(RetryScheduler::next_action(&[], &policy(), now), RetryAction::Abandon);
    }

    #[test]
    fn test_delay_bounds_hold_for_every_attempt() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ..policy()
        };
        let now = Utc::now();
        for k in 1..10u32 {
            let floor = RetryScheduler::backoff_delay(&policy, k);
            let expected = Duration::seconds((60.0 * 2f64.powi(k as i32 - 1)).min(600.0) as i64);
            assert_eq!(floor, expected);

            let history = vec![ended(k, CallState::Completed, Some(CallOutcome::NoResponse), None, now)];
            for _ in 0..20 {
                match RetryScheduler::next_action(&history, &policy, now) {
                    RetryAction::RetryAt(at) => {
                        let delay = (at - now).num_milliseconds();
                        assert!(delay >= floor.num_milliseconds());
                        assert!(delay as f64 <= floor.num_milliseconds() as f64 * 1.2 + 1.0);
                    }
                    other => panic!("expected retry, got {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_huge_exponent_caps_at_max_backoff() {
        assert_eq!(RetryScheduler::backoff_delay(&policy(), 400), Duration::seconds(600));
    }
}
