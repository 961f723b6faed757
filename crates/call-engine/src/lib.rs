//! # VoiceConfirm Call Engine
//!
//! Outbound order-confirmation calls for e-commerce orders. The engine takes
//! an order that still needs confirming, places an automated voice call to the
//! customer, follows the call through provider callbacks and records the
//! customer's answer on the order.
//!
//! This crate provides:
//! - A per-order call gate with expiring leases so only one call runs per order
//! - The call attempt state machine with ordered, idempotent event application
//! - Signed webhook ingest for the telephony and conversational voice providers
//! - Retry policy with exponential backoff, jitter and an attempt cap
//! - A call log with filtering and statistics
//! - An internal REST API and the process wiring to run it all
//!
//! ## Architecture
//!
//! ```text
//!   REST API ──▶ CallOrchestrator ──▶ TelephonyClient / VoiceClient
//!                  │      ▲
//!                  │      └── WebhookIngest ◀── provider callbacks
//!                  ▼
//!   CallRequestGate · AttemptStore · RetrySchedule · CallLogStore (SQLite)
//! ```

// Core modules
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Call confirmation functionality
pub mod call_log;
pub mod gate;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod webhook;

// External interfaces
pub mod api;
pub mod orders;
pub mod providers;
pub mod server;

// Database integration
pub mod database;

// Re-exports for convenience
pub use config::CallEngineConfig;
pub use error::{CallEngineError, Result};
pub use orchestrator::CallOrchestrator;

/// Common imports for embedding the engine
pub mod prelude {
    pub use crate::call_log::{CallFilter, CallRecord, CallStats};
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::config::CallEngineConfig;
    pub use crate::database::CallEngineDatabase;
    pub use crate::error::{CallEngineError, DialError, Result, VoiceError};
    pub use crate::gate::CallRequestGate;
    pub use crate::orchestrator::{CallOptions, CallOrchestrator, CancelOutcome, WebhookAck};
    pub use crate::orders::{Order, OrderItem, OrderService, SqliteOrderService};
    pub use crate::providers::{
        ElevenLabsVoiceClient, TelephonyClient, TwilioTelephonyClient, VoiceClient,
    };
    pub use crate::retry::{RetryAction, RetryPolicy, RetryScheduler};
    pub use crate::server::{CallEngineServer, CallEngineServerBuilder};
    pub use crate::types::{
        AttemptId, CallAttempt, CallAttemptSummary, CallOutcome, CallState, ConfirmationStatus,
        FailureReason, OrderId, ProviderCallId,
    };
}
