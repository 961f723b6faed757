//! Inbound provider webhooks
//!
//! [`WebhookIngest::ingest`] verifies, normalizes and deduplicates a callback
//! and resolves the attempt it belongs to. Applying the event is the
//! orchestrator's job. Duplicate detection has three layers, cheapest first:
//! the in-memory [`SeenSet`], the durable event ledger, and the sequence the
//! attempt last applied from the same provider. Every layer is keyed by
//! source: the telephony and voice providers number their callbacks
//! independently.

pub mod mapping;
pub mod signature;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::database::{AttemptStore, EventLedger, LedgerEntry};
use crate::error::{CallEngineError, Result};
use crate::types::{CallAttempt, ProviderCallId};

pub use mapping::{NormalizedEvent, WebhookSource};

/// What the seen-set knows about a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeenCheck {
    Unseen,
    Duplicate,
    /// Same key delivered earlier with a different body
    Conflicting,
}

/// Short-term memory of delivered `(source, provider_call_id, sequence)` keys
#[derive(Debug)]
pub struct SeenSet {
    entries: DashMap<(WebhookSource, String, i64), (String, DateTime<Utc>)>,
    ttl: Duration,
}

impl SeenSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn check(
        &self,
        source: WebhookSource,
        provider_call_id: &ProviderCallId,
        sequence: i64,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> SeenCheck {
        let key = (source, provider_call_id.0.clone(), sequence);
        match self.entries.get(&key) {
            Some(entry) if now - entry.1 < self.ttl => {
                if entry.0 == payload_hash {
                    SeenCheck::Duplicate
                } else {
                    SeenCheck::Conflicting
                }
            }
            _ => SeenCheck::Unseen,
        }
    }

    pub fn mark(
        &self,
        source: WebhookSource,
        provider_call_id: &ProviderCallId,
        sequence: i64,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) {
        self.entries
            .insert((source, provider_call_id.0.clone(), sequence), (payload_hash.to_string(), now));
    }

    /// Drop entries older than the TTL; returns how many were removed
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, seen_at)| now - *seen_at < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Secrets and tolerances for signature checks
#[derive(Debug, Clone)]
pub struct WebhookSecrets {
    pub telephony_auth_token: String,
    pub voice_webhook_secret: String,
    pub max_signature_age: Duration,
}

/// A raw callback as received over HTTP
#[derive(Debug, Clone, Copy)]
pub struct InboundWebhook<'a> {
    pub source: WebhookSource,
    /// Full public URL the provider posted to (used by URL-bound signatures)
    pub url: &'a str,
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
}

/// Why a delivery was acknowledged without being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    SeenRecently,
    AlreadyApplied,
    ConflictingPayload,
    /// At or below the attempt's applied sequence and outside the remembered window
    BelowAppliedSequence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// New event for a known attempt
    Fresh { event: NormalizedEvent, attempt: CallAttempt },
    /// Acknowledge and drop
    Duplicate { event: NormalizedEvent, reason: DuplicateReason },
}

pub struct WebhookIngest {
    secrets: WebhookSecrets,
    attempts: AttemptStore,
    ledger: EventLedger,
    seen: SeenSet,
    clock: SharedClock,
}

impl WebhookIngest {
    pub fn new(
        secrets: WebhookSecrets,
        attempts: AttemptStore,
        ledger: EventLedger,
        redelivery_window: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            secrets,
            attempts,
            ledger,
            seen: SeenSet::new(redelivery_window),
            clock,
        }
    }

    /// Verify the signature and map the payload
    pub fn normalize(&self, webhook: &InboundWebhook<'_>) -> Result<NormalizedEvent> {
        let now = self.clock.now();
        let signature = webhook
            .signature
            .ok_or_else(|| CallEngineError::invalid_signature("signature header missing"))?;

        match webhook.source {
            WebhookSource::Telephony => {
                let params: Vec<(String, String)> =
                    url::form_urlencoded::parse(webhook.body).into_owned().collect();
                signature::verify_twilio_signature(&self.secrets.telephony_auth_token, webhook.url, &params, signature)?;
                mapping::map_telephony(&params, webhook.body, now)
            }
            WebhookSource::Voice => {
                signature::verify_timestamped_signature(
                    &self.secrets.voice_webhook_secret,
                    signature,
                    webhook.body,
                    now,
                    self.secrets.max_signature_age,
                )?;
                mapping::map_voice(webhook.body, now)
            }
        }
    }

    /// Verify, normalize, resolve the attempt, and deduplicate
    pub async fn ingest(&self, webhook: &InboundWebhook<'_>) -> Result<Ingested> {
        let event = match self.normalize(webhook) {
            Ok(event) => event,
            Err(e @ CallEngineError::InvalidSignature(_)) => {
                warn!(source = webhook.source.as_str(), "🚫 Rejected webhook: {}", e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let attempt = self
            .attempts
            .get_by_provider_call_id(&event.provider_call_id)
            .await?
            .ok_or_else(|| CallEngineError::unknown_call_id(event.provider_call_id.to_string()))?;

        if let Some(reason) = self.duplicate_reason(&event, &attempt).await? {
            match reason {
                DuplicateReason::ConflictingPayload => warn!(
                    source = event.source.as_str(),
                    provider_call_id = %event.provider_call_id,
                    sequence = event.sequence,
                    "⚠️ Redelivery with a different payload for an applied sequence; dropped"
                ),
                DuplicateReason::BelowAppliedSequence => warn!(
                    source = event.source.as_str(),
                    provider_call_id = %event.provider_call_id,
                    sequence = event.sequence,
                    last_applied = attempt.last_applied_sequence(event.source),
                    "⚠️ Event at or below applied sequence; dropped"
                ),
                _ => debug!(
                    provider_call_id = %event.provider_call_id,
                    sequence = event.sequence,
                    "Duplicate webhook acknowledged"
                ),
            }
            return Ok(Ingested::Duplicate { event, reason });
        }

        Ok(Ingested::Fresh { event, attempt })
    }

    async fn duplicate_reason(&self, event: &NormalizedEvent, attempt: &CallAttempt) -> Result<Option<DuplicateReason>> {
        match self.seen.check(
            event.source,
            &event.provider_call_id,
            event.sequence,
            &event.payload_hash,
            event.received_at,
        ) {
            SeenCheck::Duplicate => return Ok(Some(DuplicateReason::SeenRecently)),
            SeenCheck::Conflicting => return Ok(Some(DuplicateReason::ConflictingPayload)),
            SeenCheck::Unseen => {}
        }

        if let Some(stored) = self
            .ledger
            .lookup(event.source, &event.provider_call_id, event.sequence)
            .await?
        {
            let reason = if stored == event.payload_hash {
                DuplicateReason::AlreadyApplied
            } else {
                DuplicateReason::ConflictingPayload
            };
            return Ok(Some(reason));
        }

        // Anything older is either a late out-of-order delivery or a redelivery
        // that outlived the remembered window; it cannot be applied either way.
        if event.sequence <= attempt.last_applied_sequence(event.source) {
            return Ok(Some(DuplicateReason::BelowAppliedSequence));
        }

        Ok(None)
    }

    /// Remember a delivery so redeliveries short-circuit
    pub fn mark_seen(&self, event: &NormalizedEvent) {
        self.seen.mark(
            event.source,
            &event.provider_call_id,
            event.sequence,
            &event.payload_hash,
            event.received_at,
        );
    }

    /// Ledger entry for an event, for recording alongside its effect
    pub fn ledger_entry(event: &NormalizedEvent) -> LedgerEntry {
        LedgerEntry {
            source: event.source,
            provider_call_id: event.provider_call_id.clone(),
            sequence: event.sequence,
            payload_hash: event.payload_hash.clone(),
            received_at: event.received_at,
        }
    }

    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    /// Drop seen-set entries and ledger rows older than the redelivery window
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<u64> {
        let dropped = self.seen.purge(now);
        let purged = self.ledger.purge_older_than(now - self.seen.ttl).await?;
        if dropped > 0 {
            debug!("🧹 Dropped {} seen-set entries", dropped);
        }
        Ok(purged)
    }
}
