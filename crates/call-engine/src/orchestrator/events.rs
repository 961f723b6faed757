//! Applying provider callbacks

use serde::Serialize;
use tracing::{debug, info, warn};

use super::calls::MAX_SWAP_ATTEMPTS;
use super::CallOrchestrator;
use crate::error::{CallEngineError, Result};
use crate::session::{ApplyOutcome, CallSession};
use crate::types::{AttemptId, CallState};
use crate::webhook::{DuplicateReason, InboundWebhook, Ingested, WebhookIngest};

/// Result of handling one webhook delivery; every variant is acknowledged to the provider
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookAck {
    /// The event moved the attempt
    Applied { attempt_id: AttemptId, state: CallState },
    /// Valid but changed nothing (informational, stale, or terminal attempt)
    NoOp { attempt_id: AttemptId, state: CallState },
    /// Already seen or applied
    Duplicate { reason: String },
    /// No local attempt for this provider call id
    UnknownCall,
}

impl CallOrchestrator {
    /// Verify, deduplicate and apply a provider callback.
    ///
    /// Errors mean the delivery should not be acknowledged (bad signature,
    /// malformed payload, storage failure) so the provider redelivers or gives up.
    pub async fn handle_webhook(&self, webhook: &InboundWebhook<'_>) -> Result<WebhookAck> {
        let (event, mut attempt) = match self.ingest.ingest(webhook).await {
            Ok(Ingested::Fresh { event, attempt }) => (event, attempt),
            Ok(Ingested::Duplicate { reason, .. }) => {
                return Ok(WebhookAck::Duplicate {
                    reason: duplicate_reason_name(reason).to_string(),
                });
            }
            Err(CallEngineError::UnknownCallId(provider_call_id)) => {
                debug!(provider_call_id = %provider_call_id, "Webhook for unknown call acknowledged and dropped");
                return Ok(WebhookAck::UnknownCall);
            }
            Err(e) => return Err(e),
        };

        let entry = WebhookIngest::ledger_entry(&event);

        for _ in 0..MAX_SWAP_ATTEMPTS {
            match CallSession::apply(&attempt, &event.event, Some(event.sequence), event.received_at) {
                ApplyOutcome::Applied(mut next) => {
                    next.artifacts.merge(&event.artifacts);
                    if !self.attempts.compare_and_swap(&attempt, &next, Some(&entry)).await? {
                        attempt = self.attempts.get(&attempt.id).await?.ok_or_else(|| {
                            CallEngineError::internal(format!("Attempt {} disappeared", attempt.id))
                        })?;
                        continue;
                    }

                    self.ingest.mark_seen(&event);
                    info!(
                        order_id = %next.order_id,
                        attempt_id = %next.id,
                        provider_call_id = %event.provider_call_id,
                        sequence = event.sequence,
                        event = %event.event,
                        from = %attempt.state,
                        to = %next.state,
                        "🔔 Provider event applied"
                    );

                    if next.is_terminal() {
                        self.finish_attempt(&next).await?;
                    }
                    return Ok(WebhookAck::Applied {
                        attempt_id: next.id,
                        state: next.state,
                    });
                }
                outcome => {
                    self.ingest.ledger().record(&entry).await?;
                    self.ingest.mark_seen(&event);
                    match outcome {
                        ApplyOutcome::Stale => warn!(
                            attempt_id = %attempt.id,
                            provider_call_id = %event.provider_call_id,
                            source = event.source.as_str(),
                            sequence = event.sequence,
                            last_applied = attempt.last_applied_sequence(event.source),
                            "⚠️ Out-of-order event dropped"
                        ),
                        ApplyOutcome::Ignored => warn!(
                            attempt_id = %attempt.id,
                            event = %event.event,
                            state = %attempt.state,
                            "Event not valid for attempt state; ignored"
                        ),
                        _ => debug!(
                            attempt_id = %attempt.id,
                            event = %event.event,
                            state = %attempt.state,
                            "Event changed nothing"
                        ),
                    }
                    return Ok(WebhookAck::NoOp {
                        attempt_id: attempt.id,
                        state: attempt.state,
                    });
                }
            }
        }

        Err(CallEngineError::conflict(format!(
            "Attempt {} kept changing while applying sequence {}",
            attempt.id, event.sequence
        )))
    }
}

fn duplicate_reason_name(reason: DuplicateReason) -> &'static str {
    match reason {
        DuplicateReason::SeenRecently => "seen_recently",
        DuplicateReason::AlreadyApplied => "already_applied",
        DuplicateReason::ConflictingPayload => "conflicting_payload",
        DuplicateReason::BelowAppliedSequence => "below_applied_sequence",
    }
}
