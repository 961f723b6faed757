//! # Call Orchestration
//!
//! The [`CallOrchestrator`] ties the engine together. An initiation request
//! goes through the [`CallRequestGate`](crate::gate::CallRequestGate), creates
//! a Queued attempt, prepares the conversation with the voice provider and
//! dials through the telephony provider. Provider callbacks come back through
//! [`handle_webhook`](CallOrchestrator::handle_webhook) and drive the attempt's
//! state machine. When an attempt ends the orchestrator logs it, asks the
//! [`RetryScheduler`](crate::retry::RetryScheduler) what comes next, and either
//! schedules a retry or finalizes the order.
//!
//! ## Module Organization
//!
//! - **engine**: the orchestrator itself and read-only queries
//! - **calls**: initiation, terminal handling and cancellation
//! - **events**: applying provider callbacks
//! - **recovery**: timeout, lease and retry sweeps plus their background tasks
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voiceconfirm_call_engine::prelude::*;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let config = CallEngineConfig::load(None)?;
//! let db = CallEngineDatabase::connect(&config.database.url, config.database.max_connections).await?;
//! let clock: SharedClock = Arc::new(SystemClock);
//!
//! let orchestrator = CallOrchestrator::new(
//!     config.clone(),
//!     db.clone(),
//!     Arc::new(SqliteOrderService::new(db, clock.clone())),
//!     Arc::new(TwilioTelephonyClient::new(config.telephony.clone())?),
//!     Arc::new(ElevenLabsVoiceClient::new(config.voice.clone())?),
//!     clock,
//! );
//!
//! let summary = orchestrator
//!     .initiate_call(&OrderId::new("order-1001"), CallOptions::default())
//!     .await?;
//! println!("📞 Attempt {} is {}", summary.attempt_number, summary.state);
//! # Ok(())
//! # }
//! ```

mod calls;
mod engine;
mod events;
mod recovery;

pub use calls::{CallOptions, CancelOutcome};
pub use engine::CallOrchestrator;
pub use events::WebhookAck;
