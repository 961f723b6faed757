//! Starting, finishing and cancelling call attempts

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::CallOrchestrator;
use crate::database::ConversationAsset;
use crate::error::{CallEngineError, Result};
use crate::orders::Order;
use crate::providers::{ConversationRequest, DialRequest};
use crate::retry::{RetryAction, RetryScheduler};
use crate::session::{ApplyOutcome, CallSession, SessionEvent};
use crate::types::{
    CallArtifacts, CallAttempt, CallAttemptSummary, ConfirmationStatus, FailureReason, Lease, OrderId,
};

/// How many times a conditional write is retried against a concurrently updated attempt
pub(super) const MAX_SWAP_ATTEMPTS: usize = 3;

const MAX_ORDER_ID_LEN: usize = 128;

/// Per-request overrides for a new attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    pub voice_id: Option<String>,
    pub language: Option<String>,
}

/// What cancellation did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// An active attempt was abandoned
    Abandoned,
    /// No call was running; a pending retry was dropped
    RetryCleared,
    /// Nothing to cancel
    NothingToCancel,
}

fn validate_order_id(order_id: &OrderId) -> Result<()> {
    let id = order_id.as_str();
    if id.trim().is_empty() {
        return Err(CallEngineError::validation("order id cannot be empty"));
    }
    if id.len() > MAX_ORDER_ID_LEN {
        return Err(CallEngineError::validation(format!(
            "order id longer than {} characters",
            MAX_ORDER_ID_LEN
        )));
    }
    if id.chars().any(|c| c.is_control() || c == '/') {
        return Err(CallEngineError::validation("order id contains invalid characters"));
    }
    Ok(())
}

impl CallOrchestrator {
    /// Start the next attempt for an order.
    ///
    /// Dial and voice failures do not surface here: they end the attempt as
    /// Failed and the retry policy takes over. Errors are reserved for requests
    /// that cannot start an attempt at all, including one made while a retry
    /// is pending but not yet due (`Conflict`).
    pub async fn initiate_call(&self, order_id: &OrderId, options: CallOptions) -> Result<CallAttemptSummary> {
        validate_order_id(order_id)?;

        let order = self
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("Order {}", order_id)))?;

        if order.confirmation_status.is_final() {
            return Err(CallEngineError::not_eligible(format!(
                "Order {} is already {}",
                order_id, order.confirmation_status
            )));
        }
        if order.customer_phone.trim().is_empty() {
            return Err(CallEngineError::validation(format!("Order {} has no phone number", order_id)));
        }

        let lease = self
            .gate
            .acquire(order_id, self.instance_id(), self.config.gate.lease_ttl())
            .await?;

        let attempt = match self.open_attempt(&order, &lease, &options).await {
            Ok(attempt) => attempt,
            Err(e) => {
                if let Err(release_err) = self.gate.release(&lease).await {
                    warn!(order_id = %order_id, "Failed to release lease after error: {}", release_err);
                }
                return Err(e);
            }
        };

        let attempt = self.place_call(&order, attempt).await?;
        Ok(attempt.summary())
    }

    /// Reconcile leftovers, check eligibility, and create the Queued attempt under `lease`
    async fn open_attempt(&self, order: &Order, lease: &Lease, options: &CallOptions) -> Result<CallAttempt> {
        let now = self.clock.now();

        // Holding a fresh lease while an attempt is active means its owner died
        if let Some(orphan) = self.attempts.active_for_order(&order.id).await? {
            warn!(
                order_id = %order.id,
                attempt_id = %orphan.id,
                state = %orphan.state,
                "🧟 Active attempt without a live lease; failing it"
            );
            if let Some(failed) = self.advance(&orphan, &SessionEvent::LeaseExpired, &CallArtifacts::default()).await? {
                self.call_log.append(&failed, now).await?;
            }
        }

        let history = self.attempts.history(&order.id).await?;
        if !history.is_empty() {
            match RetryScheduler::next_action(&history, &self.policy, now) {
                RetryAction::RetryAt(_) => {
                    if let Some(pending) = self.retries.get(&order.id).await? {
                        if pending.due_at > now {
                            return Err(CallEngineError::conflict(format!(
                                "Order {} has a retry pending until {}",
                                order.id, pending.due_at
                            )));
                        }
                    }
                }
                action => {
                    self.settle_order(&order.id, &action).await?;
                    return Err(CallEngineError::not_eligible(format!(
                        "Order {} has no retries left",
                        order.id
                    )));
                }
            }
        }

        if order.confirmation_status == ConfirmationStatus::Unconfirmed {
            self.orders
                .transition_status(&order.id, ConfirmationStatus::Unconfirmed, ConfirmationStatus::Confirming)
                .await?;
        }

        let language = options
            .language
            .clone()
            .or_else(|| order.language.clone())
            .unwrap_or_else(|| self.config.voice.default_language.clone());
        let voice_id = options
            .voice_id
            .clone()
            .or_else(|| order.voice_id.clone())
            .unwrap_or_else(|| self.config.voice.default_voice_id.clone());

        let attempt = self
            .attempts
            .create_next(&order.id, &language, Some(&voice_id), now)
            .await?;

        if let Err(e) = self.gate.bind_attempt(lease, &attempt.id).await {
            self.fail_attempt(&attempt, SessionEvent::LeaseExpired).await?;
            return Err(e);
        }

        self.retries.clear(&order.id).await?;

        info!(
            order_id = %order.id,
            attempt_id = %attempt.id,
            attempt_number = attempt.attempt_number,
            language = %language,
            voice_id = %voice_id,
            "📋 Call attempt queued"
        );
        Ok(attempt)
    }

    /// Prepare the conversation and dial; the attempt ends Dialing or Failed
    async fn place_call(&self, order: &Order, attempt: CallAttempt) -> Result<CallAttempt> {
        let request = ConversationRequest {
            customer_name: order.customer_name.clone(),
            external_order_id: order.external_order_id.clone(),
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            items: order.items.clone(),
            language: attempt.language.clone(),
            voice_id: attempt
                .voice_id
                .clone()
                .unwrap_or_else(|| self.config.voice.default_voice_id.clone()),
        };

        let prepared = match self.voice.prepare(&request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(order_id = %order.id, attempt_id = %attempt.id, "🔇 Conversation preparation failed: {}", e);
                return self
                    .fail_attempt(&attempt, SessionEvent::DialFailed(FailureReason::ProviderError))
                    .await;
            }
        };

        self.assets
            .put(
                &ConversationAsset {
                    attempt_id: attempt.id.clone(),
                    script: prepared.script.clone(),
                    audio: prepared.audio.to_vec(),
                    content_type: prepared.content_type.clone(),
                },
                self.clock.now(),
            )
            .await?;

        let dial = DialRequest {
            to: order.customer_phone.clone(),
            answer_url: self.public_url(&format!("/v1/conversations/{}/twiml", attempt.id)),
            callback_url: self.public_url("/v1/webhooks/telephony"),
        };

        let provider_call_id = match self.telephony.dial(&dial).await {
            Ok(provider_call_id) => provider_call_id,
            Err(e) => {
                warn!(order_id = %order.id, attempt_id = %attempt.id, "📵 Dial failed: {}", e);
                return self.fail_attempt(&attempt, SessionEvent::DialFailed(e.failure_reason())).await;
            }
        };

        let artifacts = CallArtifacts {
            transcript: Some(prepared.script),
            ..CallArtifacts::default()
        };
        let submitted = SessionEvent::DialSubmitted {
            provider_call_id: provider_call_id.clone(),
        };

        match self.advance(&attempt, &submitted, &artifacts).await? {
            Some(dialing) => {
                info!(
                    order_id = %order.id,
                    attempt_id = %dialing.id,
                    provider_call_id = %provider_call_id,
                    "📞 Dialing customer"
                );
                Ok(dialing)
            }
            None => {
                // Cancelled or swept while the dial request was in flight
                warn!(
                    attempt_id = %attempt.id,
                    provider_call_id = %provider_call_id,
                    "Attempt ended before the dial was recorded; hanging up"
                );
                self.terminate_best_effort(&provider_call_id).await;
                self.attempts
                    .get(&attempt.id)
                    .await?
                    .ok_or_else(|| CallEngineError::internal(format!("Attempt {} disappeared", attempt.id)))
            }
        }
    }

    /// Apply an engine-raised event and persist it with a conditional write.
    ///
    /// Returns the new version, or `None` if the event no longer applies
    /// (the attempt moved on or is already terminal).
    pub(super) async fn advance(
        &self,
        attempt: &CallAttempt,
        event: &SessionEvent,
        artifacts: &CallArtifacts,
    ) -> Result<Option<CallAttempt>> {
        let mut current = attempt.clone();
        for _ in 0..MAX_SWAP_ATTEMPTS {
            match CallSession::apply(&current, event, None, self.clock.now()) {
                ApplyOutcome::Applied(mut next) => {
                    next.artifacts.merge(artifacts);
                    if self.attempts.compare_and_swap(&current, &next, None).await? {
                        debug!(
                            attempt_id = %next.id,
                            event = %event,
                            from = %current.state,
                            to = %next.state,
                            "Attempt advanced"
                        );
                        return Ok(Some(next));
                    }
                    current = self
                        .attempts
                        .get(&current.id)
                        .await?
                        .ok_or_else(|| CallEngineError::internal(format!("Attempt {} disappeared", current.id)))?;
                }
                outcome => {
                    debug!(attempt_id = %current.id, event = %event, outcome = outcome.as_str(), "Event not applied");
                    return Ok(None);
                }
            }
        }
        Err(CallEngineError::conflict(format!(
            "Attempt {} kept changing while applying {}",
            attempt.id, event
        )))
    }

    /// End an attempt with an engine-raised failure and run terminal handling
    pub(super) async fn fail_attempt(&self, attempt: &CallAttempt, event: SessionEvent) -> Result<CallAttempt> {
        match self.advance(attempt, &event, &CallArtifacts::default()).await? {
            Some(failed) => {
                self.finish_attempt(&failed).await?;
                Ok(failed)
            }
            None => self
                .attempts
                .get(&attempt.id)
                .await?
                .ok_or_else(|| CallEngineError::internal(format!("Attempt {} disappeared", attempt.id))),
        }
    }

    /// Terminal handling: log the attempt, then retry or finalize the order, then free the lease
    pub(super) async fn finish_attempt(&self, attempt: &CallAttempt) -> Result<()> {
        let now = self.clock.now();
        self.call_log.append(attempt, now).await?;

        let history = self.attempts.history(&attempt.order_id).await?;
        let action = RetryScheduler::next_action(&history, &self.policy, now);
        match &action {
            RetryAction::RetryAt(due_at) => {
                self.retries
                    .schedule(&attempt.order_id, *due_at, attempt.attempt_number, now)
                    .await?;
                info!(
                    order_id = %attempt.order_id,
                    after_attempt = attempt.attempt_number,
                    due_at = %due_at,
                    "⏰ Retry scheduled"
                );
            }
            _ => self.settle_order(&attempt.order_id, &action).await?,
        }

        self.gate.release_for_attempt(&attempt.order_id, &attempt.id).await?;
        Ok(())
    }

    /// Move a Confirming order to the final status implied by `action` and drop any pending retry
    pub(super) async fn settle_order(&self, order_id: &OrderId, action: &RetryAction) -> Result<()> {
        if let Some(status) = action.final_status() {
            let changed = self
                .orders
                .transition_status(order_id, ConfirmationStatus::Confirming, status)
                .await?;
            if changed {
                info!(order_id = %order_id, status = %status, "🏁 Order confirmation finalized");
            }
        }
        self.retries.clear(order_id).await?;
        Ok(())
    }

    /// Operator cancellation: abandon the active attempt, hang up, and finalize the order.
    ///
    /// Idempotent. A late webhook for the abandoned call is a no-op.
    pub async fn cancel_call(&self, order_id: &OrderId) -> Result<CancelOutcome> {
        validate_order_id(order_id)?;

        let outcome = match self.attempts.active_for_order(order_id).await? {
            Some(active) => {
                match self
                    .advance(&active, &SessionEvent::Cancelled, &CallArtifacts::default())
                    .await?
                {
                    Some(abandoned) => {
                        if let Some(provider_call_id) = &abandoned.provider_call_id {
                            self.terminate_best_effort(provider_call_id).await;
                        }
                        self.finish_attempt(&abandoned).await?;
                        info!(order_id = %order_id, attempt_id = %abandoned.id, "🛑 Call cancelled");
                        CancelOutcome::Abandoned
                    }
                    // Finished on its own in the meantime
                    None => CancelOutcome::NothingToCancel,
                }
            }
            None => {
                if self.retries.clear(order_id).await? {
                    self.settle_order(order_id, &RetryAction::Abandon).await?;
                    info!(order_id = %order_id, "🛑 Pending retry cancelled");
                    CancelOutcome::RetryCleared
                } else {
                    debug!(order_id = %order_id, "Nothing to cancel");
                    CancelOutcome::NothingToCancel
                }
            }
        };

        // The lease may still be unbound if cancellation raced initiation
        if outcome != CancelOutcome::NothingToCancel {
            self.gate.force_release(order_id).await?;
        }
        Ok(outcome)
    }

    pub(super) async fn terminate_best_effort(&self, provider_call_id: &crate::types::ProviderCallId) {
        if let Err(e) = self.telephony.terminate(provider_call_id).await {
            error!(provider_call_id = %provider_call_id, "Failed to terminate call: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_id_validation() {
        assert!(validate_order_id(&OrderId::new("order-42")).is_ok());
        assert!(validate_order_id(&OrderId::new("  ")).is_err());
        assert!(validate_order_id(&OrderId::new("a/b")).is_err());
        assert!(validate_order_id(&OrderId::new("x".repeat(200))).is_err());
    }
}
