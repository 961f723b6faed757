//! Shared fixtures: in-memory engine, scripted providers, signed webhooks

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use voiceconfirm_call_engine::clock::{Clock, ManualClock, SharedClock};
use voiceconfirm_call_engine::config::CallEngineConfig;
use voiceconfirm_call_engine::database::CallEngineDatabase;
use voiceconfirm_call_engine::error::{DialError, Result, VoiceError};
use voiceconfirm_call_engine::orchestrator::{CallOrchestrator, WebhookAck};
use voiceconfirm_call_engine::orders::{Order, OrderItem, OrderService, SqliteOrderService};
use voiceconfirm_call_engine::providers::{
    ConversationRequest, DialRequest, PreparedConversation, TelephonyClient, VoiceClient,
};
use voiceconfirm_call_engine::types::{CallAttempt, ConfirmationStatus, OrderId, ProviderCallId};
use voiceconfirm_call_engine::webhook::signature::{timestamped_signature_header, twilio_signature};
use voiceconfirm_call_engine::webhook::{InboundWebhook, WebhookSource};

pub const TELEPHONY_WEBHOOK_URL: &str = "https://engine.test/v1/webhooks/telephony";
pub const VOICE_WEBHOOK_URL: &str = "https://engine.test/v1/webhooks/voice";
pub const FAKE_AUDIO: &[u8] = b"ID3-fake-mp3";

/// Telephony provider that answers dials from a script and records hang-ups
#[derive(Default)]
pub struct ScriptedTelephony {
    scripted: Mutex<VecDeque<std::result::Result<ProviderCallId, DialError>>>,
    dialed: Mutex<Vec<DialRequest>>,
    terminated: Mutex<Vec<ProviderCallId>>,
}

impl ScriptedTelephony {
    /// Queue the result of the next dial; unscripted dials succeed as `CA<n>`
    pub fn push_dial_result(&self, result: std::result::Result<ProviderCallId, DialError>) {
        self.scripted.lock().push_back(result);
    }

    pub fn dialed(&self) -> Vec<DialRequest> {
        self.dialed.lock().clone()
    }

    pub fn terminated(&self) -> Vec<ProviderCallId> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl TelephonyClient for ScriptedTelephony {
    async fn dial(&self, request: &DialRequest) -> std::result::Result<ProviderCallId, DialError> {
        let number = {
            let mut dialed = self.dialed.lock();
            dialed.push(request.clone());
            dialed.len()
        };
        match self.scripted.lock().pop_front() {
            Some(result) => result,
            None => Ok(ProviderCallId::new(format!("CA{}", number))),
        }
    }

    async fn terminate(&self, provider_call_id: &ProviderCallId) -> std::result::Result<(), DialError> {
        self.terminated.lock().push(provider_call_id.clone());
        Ok(())
    }
}

/// Voice provider that returns fixed audio, or fails while `failing` is set
#[derive(Default)]
pub struct ScriptedVoice {
    failing: Mutex<bool>,
    requests: Mutex<Vec<ConversationRequest>>,
}

impl ScriptedVoice {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn requests(&self) -> Vec<ConversationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl VoiceClient for ScriptedVoice {
    async fn prepare(&self, request: &ConversationRequest) -> std::result::Result<PreparedConversation, VoiceError> {
        self.requests.lock().push(request.clone());
        if *self.failing.lock() {
            return Err(VoiceError::Unavailable("synthesis backend down".to_string()));
        }
        Ok(PreparedConversation {
            script: format!("Hello {}, calling about order {}.", request.customer_name, request.external_order_id),
            audio: Bytes::from_static(FAKE_AUDIO),
            content_type: "audio/mpeg".to_string(),
        })
    }
}

pub struct Harness {
    pub engine: Arc<CallOrchestrator>,
    pub db: CallEngineDatabase,
    pub orders: SqliteOrderService,
    pub clock: ManualClock,
    pub telephony: Arc<ScriptedTelephony>,
    pub voice: Arc<ScriptedVoice>,
    pub config: CallEngineConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(CallEngineConfig::for_testing()).await
    }

    pub async fn with_config(config: CallEngineConfig) -> Self {
        let db = CallEngineDatabase::connect_in_memory().await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        let orders = SqliteOrderService::new(db.clone(), shared.clone());
        let telephony = Arc::new(ScriptedTelephony::default());
        let voice = Arc::new(ScriptedVoice::default());

        let engine = Arc::new(CallOrchestrator::new(
            config.clone(),
            db.clone(),
            Arc::new(orders.clone()),
            telephony.clone(),
            voice.clone(),
            shared,
        ));

        Self {
            engine,
            db,
            orders,
            clock,
            telephony,
            voice,
            config,
        }
    }

    /// A second engine instance over the same database (fresh in-memory dedup state)
    pub fn peer(&self, instance_id: &str) -> Arc<CallOrchestrator> {
        let mut config = self.config.clone();
        config.general.instance_id = instance_id.to_string();
        let shared: SharedClock = Arc::new(self.clock.clone());
        Arc::new(CallOrchestrator::new(
            config,
            self.db.clone(),
            Arc::new(self.orders.clone()),
            self.telephony.clone(),
            self.voice.clone(),
            shared,
        ))
    }

    pub async fn seed_order(&self, id: &str) -> OrderId {
        let mut order = Order::new(id, format!("#{}", id), "Ana Ruiz", "+15550001111", self.clock.now());
        order.items.push(OrderItem {
            name: "Desk lamp".to_string(),
            quantity: 1,
            price: 39.0,
        });
        order.total_amount = 39.0;
        self.orders.upsert(&order).await.unwrap();
        order.id
    }

    pub async fn order_status(&self, order_id: &OrderId) -> ConfirmationStatus {
        self.orders
            .get_order(order_id)
            .await
            .unwrap()
            .unwrap()
            .confirmation_status
    }

    pub async fn history(&self, order_id: &OrderId) -> Vec<CallAttempt> {
        self.engine.attempt_history(order_id).await.unwrap()
    }

    pub async fn telephony_status(&self, call_sid: &str, status: &str, sequence: i64) -> Result<WebhookAck> {
        let sequence = sequence.to_string();
        self.telephony_callback(&[
            ("CallSid", call_sid),
            ("CallStatus", status),
            ("SequenceNumber", sequence.as_str()),
        ])
        .await
    }

    pub async fn telephony_callback(&self, fields: &[(&str, &str)]) -> Result<WebhookAck> {
        let (body, signature) = signed_telephony_form(&self.config, fields);
        self.engine
            .handle_webhook(&InboundWebhook {
                source: WebhookSource::Telephony,
                url: TELEPHONY_WEBHOOK_URL,
                body: body.as_bytes(),
                signature: Some(&signature),
            })
            .await
    }

    pub async fn voice_disposition(&self, call_sid: &str, disposition: &str, sequence: i64) -> Result<WebhookAck> {
        let body = serde_json::json!({
            "call_sid": call_sid,
            "disposition": disposition,
            "event_timestamp": self.clock.now().timestamp(),
            "sequence": sequence,
            "transcript": "yes, please confirm",
            "duration_secs": 42,
        })
        .to_string();
        deliver_voice(&self.engine, &self.config, &self.clock, &body).await
    }
}

/// Form body and `X-Twilio-Signature` for a telephony callback
pub fn signed_telephony_form(config: &CallEngineConfig, fields: &[(&str, &str)]) -> (String, String) {
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish();
    let params: Vec<(String, String)> = fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let signature = twilio_signature(config.telephony_signing_token(), TELEPHONY_WEBHOOK_URL, &params).unwrap();
    (body, signature)
}

pub fn voice_signature(config: &CallEngineConfig, clock: &ManualClock, body: &str) -> String {
    timestamped_signature_header(&config.webhook.voice_webhook_secret, clock.now().timestamp(), body.as_bytes()).unwrap()
}

pub async fn deliver_voice(
    engine: &CallOrchestrator,
    config: &CallEngineConfig,
    clock: &ManualClock,
    body: &str,
) -> Result<WebhookAck> {
    let signature = voice_signature(config, clock, body);
    engine
        .handle_webhook(&InboundWebhook {
            source: WebhookSource::Voice,
            url: VOICE_WEBHOOK_URL,
            body: body.as_bytes(),
            signature: Some(&signature),
        })
        .await
}
