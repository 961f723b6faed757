use std::sync::Arc;

use tracing::info;

use crate::call_log::{CallFilter, CallLogStore, CallRecord, CallStats};
use crate::clock::SharedClock;
use crate::config::CallEngineConfig;
use crate::database::{AttemptStore, CallEngineDatabase, ConversationAsset, ConversationAssetStore, EventLedger, RetrySchedule};
use crate::error::{CallEngineError, Result};
use crate::gate::CallRequestGate;
use crate::orders::OrderService;
use crate::providers::{TelephonyClient, VoiceClient};
use crate::retry::RetryPolicy;
use crate::types::{AttemptId, CallAttempt, OrderId};
use crate::webhook::{WebhookIngest, WebhookSecrets};

/// Top-level coordinator for order confirmation calls.
///
/// Holds no per-call state in memory: everything it needs to resume lives
/// in the database, so any instance can pick up any order.
pub struct CallOrchestrator {
    pub(super) config: CallEngineConfig,
    pub(super) policy: RetryPolicy,
    pub(super) clock: SharedClock,
    pub(super) db: CallEngineDatabase,
    pub(super) gate: CallRequestGate,
    pub(super) attempts: AttemptStore,
    pub(super) call_log: CallLogStore,
    pub(super) retries: RetrySchedule,
    pub(super) assets: ConversationAssetStore,
    pub(super) ingest: WebhookIngest,
    pub(super) orders: Arc<dyn OrderService>,
    pub(super) telephony: Arc<dyn TelephonyClient>,
    pub(super) voice: Arc<dyn VoiceClient>,
}

impl CallOrchestrator {
    pub fn new(
        config: CallEngineConfig,
        db: CallEngineDatabase,
        orders: Arc<dyn OrderService>,
        telephony: Arc<dyn TelephonyClient>,
        voice: Arc<dyn VoiceClient>,
        clock: SharedClock,
    ) -> Self {
        let attempts = AttemptStore::new(db.clone());
        let ingest = WebhookIngest::new(
            WebhookSecrets {
                telephony_auth_token: config.telephony_signing_token().to_string(),
                voice_webhook_secret: config.webhook.voice_webhook_secret.clone(),
                max_signature_age: chrono::Duration::seconds(config.webhook.max_signature_age_secs as i64),
            },
            attempts.clone(),
            EventLedger::new(db.clone()),
            config.webhook.redelivery_window(),
            clock.clone(),
        );

        info!(instance_id = %config.general.instance_id, "🎛️ Call orchestrator ready");

        Self {
            policy: config.retry.policy(),
            gate: CallRequestGate::new(db.clone(), clock.clone()),
            call_log: CallLogStore::new(db.clone()),
            retries: RetrySchedule::new(db.clone()),
            assets: ConversationAssetStore::new(db.clone()),
            attempts,
            ingest,
            orders,
            telephony,
            voice,
            clock,
            db,
            config,
        }
    }

    pub fn config(&self) -> &CallEngineConfig {
        &self.config
    }

    pub fn database(&self) -> &CallEngineDatabase {
        &self.db
    }

    pub fn gate(&self) -> &CallRequestGate {
        &self.gate
    }

    pub fn attempts(&self) -> &AttemptStore {
        &self.attempts
    }

    pub fn call_log(&self) -> &CallLogStore {
        &self.call_log
    }

    pub fn retries(&self) -> &RetrySchedule {
        &self.retries
    }

    pub fn instance_id(&self) -> &str {
        &self.config.general.instance_id
    }

    /// A call by attempt id: the logged record once finished, the live attempt before that
    pub async fn get_call(&self, attempt_id: &AttemptId) -> Result<CallRecord> {
        if let Some(record) = self.call_log.get(attempt_id).await? {
            return Ok(record);
        }
        self.attempts
            .get(attempt_id)
            .await?
            .map(|attempt| CallRecord::from(&attempt))
            .ok_or_else(|| CallEngineError::not_found(format!("Call {}", attempt_id)))
    }

    /// Logged calls for an order, by attempt number
    pub async fn calls_for_order(&self, order_id: &OrderId) -> Result<Vec<CallRecord>> {
        self.call_log.by_order(order_id).await
    }

    pub async fn list_calls(&self, filter: &CallFilter) -> Result<Vec<CallRecord>> {
        self.call_log.list(filter).await
    }

    pub async fn call_stats(&self, filter: &CallFilter) -> Result<CallStats> {
        self.call_log.stats(filter).await
    }

    /// Every attempt for an order, including the active one
    pub async fn attempt_history(&self, order_id: &OrderId) -> Result<Vec<CallAttempt>> {
        self.attempts.history(order_id).await
    }

    /// Prepared audio and script served to the telephony provider
    pub async fn conversation_asset(&self, attempt_id: &AttemptId) -> Result<ConversationAsset> {
        self.assets
            .get(attempt_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("Conversation for {}", attempt_id)))
    }

    /// Public URL for a path on this engine
    pub(super) fn public_url(&self, path: &str) -> String {
        format!("{}{}", self.config.general.public_base_url.trim_end_matches('/'), path)
    }
}
