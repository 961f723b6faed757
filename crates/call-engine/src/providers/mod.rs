//! Telephony and voice provider clients
//!
//! The orchestrator only sees the [`TelephonyClient`] and [`VoiceClient`]
//! traits. HTTP bindings live in [`twilio`] and [`elevenlabs`].

pub mod elevenlabs;
pub mod script;
pub mod twilio;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{DialError, VoiceError};
use crate::orders::OrderItem;
use crate::types::ProviderCallId;

pub use elevenlabs::ElevenLabsVoiceClient;
pub use twilio::TwilioTelephonyClient;

/// Outbound call request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub to: String,
    /// Where the provider fetches call instructions once answered
    pub answer_url: String,
    /// Where the provider posts status callbacks
    pub callback_url: String,
}

#[async_trait]
pub trait TelephonyClient: Send + Sync {
    /// Start an outbound call; returns the provider's call id
    async fn dial(&self, request: &DialRequest) -> Result<ProviderCallId, DialError>;

    /// Ask the provider to hang up; best effort
    async fn terminate(&self, provider_call_id: &ProviderCallId) -> Result<(), DialError>;
}

/// Everything needed to prepare the confirmation conversation
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRequest {
    pub customer_name: String,
    pub external_order_id: String,
    pub total_amount: f64,
    pub currency: String,
    pub items: Vec<OrderItem>,
    pub language: String,
    pub voice_id: String,
}

/// Script and synthesised audio for one attempt
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedConversation {
    pub script: String,
    pub audio: Bytes,
    pub content_type: String,
}

#[async_trait]
pub trait VoiceClient: Send + Sync {
    async fn prepare(&self, request: &ConversationRequest) -> Result<PreparedConversation, VoiceError>;
}
