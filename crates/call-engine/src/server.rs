//! # Call Engine Server
//!
//! Process assembly for the engine: opens the database, wires the order
//! service and provider clients into a [`CallOrchestrator`], runs the
//! background sweeps and serves the HTTP API until shutdown.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            CallEngineServer             │
//! ├─────────────────────────────────────────┤
//! │   HTTP API   │   Background sweeps      │
//! ├─────────────────────────────────────────┤
//! │            CallOrchestrator             │
//! ├─────────────────────────────────────────┤
//! │  Database │ Telephony │ Voice │ Orders  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use voiceconfirm_call_engine::prelude::*;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let mut server = CallEngineServerBuilder::new()
//!     .with_config(CallEngineConfig::load(None)?)
//!     .build()
//!     .await?;
//!
//! server.start();
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::build_router;
use crate::clock::{SharedClock, SystemClock};
use crate::config::CallEngineConfig;
use crate::database::CallEngineDatabase;
use crate::error::{CallEngineError, Result};
use crate::orchestrator::CallOrchestrator;
use crate::orders::{OrderService, SqliteOrderService};
use crate::providers::{ElevenLabsVoiceClient, TelephonyClient, TwilioTelephonyClient, VoiceClient};

/// A running call engine: orchestrator, background tasks and HTTP API
pub struct CallEngineServer {
    orchestrator: Arc<CallOrchestrator>,

    config: CallEngineConfig,

    /// Fires when the server is stopping
    shutdown: CancellationToken,

    /// Background sweep tasks
    task_handles: Vec<JoinHandle<()>>,
}

impl CallEngineServer {
    /// Start the background sweeps
    pub fn start(&mut self) {
        if !self.task_handles.is_empty() {
            warn!("Background tasks already running");
            return;
        }
        self.task_handles = self.orchestrator.spawn_background_tasks(self.shutdown.clone());
        info!("✅ Started {} background tasks", self.task_handles.len());
    }

    /// Stop the background sweeps and wait for them to finish
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping call engine server...");
        self.shutdown.cancel();
        for handle in self.task_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.orchestrator.database().close().await;
        info!("✅ Call engine server stopped");
        Ok(())
    }

    /// Serve the HTTP API until Ctrl-C or [`shutdown_token`](Self::shutdown_token) fires
    pub async fn run(&mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.general.bind_address)
            .await
            .map_err(|e| {
                CallEngineError::config(format!("Failed to bind {}: {}", self.config.general.bind_address, e))
            })?;
        info!(
            "📞 Call engine listening on {} (public URL {})",
            self.config.general.bind_address, self.config.general.public_base_url
        );

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    _ = shutdown.cancelled() => {}
                }
            })
            .await
            .map_err(|e| CallEngineError::internal(format!("HTTP server failed: {}", e)))?;

        self.stop().await
    }

    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.orchestrator))
    }

    pub fn orchestrator(&self) -> &Arc<CallOrchestrator> {
        &self.orchestrator
    }

    pub fn config(&self) -> &CallEngineConfig {
        &self.config
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Builder for CallEngineServer with fluent API
#[derive(Default)]
pub struct CallEngineServerBuilder {
    config: Option<CallEngineConfig>,
    database_url: Option<String>,
    orders: Option<Arc<dyn OrderService>>,
    telephony: Option<Arc<dyn TelephonyClient>>,
    voice: Option<Arc<dyn VoiceClient>>,
    clock: Option<SharedClock>,
}

impl CallEngineServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: CallEngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the configured database URL
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Use an in-memory database
    pub fn with_in_memory_database(self) -> Self {
        self.with_database_url("sqlite::memory:")
    }

    /// Use an external order service instead of the engine's own table
    pub fn with_order_service(mut self, orders: Arc<dyn OrderService>) -> Self {
        self.orders = Some(orders);
        self
    }

    pub fn with_telephony(mut self, telephony: Arc<dyn TelephonyClient>) -> Self {
        self.telephony = Some(telephony);
        self
    }

    pub fn with_voice(mut self, voice: Arc<dyn VoiceClient>) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> Result<CallEngineServer> {
        let mut config = self
            .config
            .ok_or_else(|| CallEngineError::config("Configuration not provided"))?;
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
        config.validate().map_err(CallEngineError::config)?;

        info!("🚀 Creating call engine {}", config.general.instance_id);
        let db = CallEngineDatabase::connect(&config.database.url, config.database.max_connections).await?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let orders: Arc<dyn OrderService> = match self.orders {
            Some(orders) => orders,
            None => Arc::new(SqliteOrderService::new(db.clone(), clock.clone())),
        };
        let telephony: Arc<dyn TelephonyClient> = match self.telephony {
            Some(telephony) => telephony,
            None => Arc::new(TwilioTelephonyClient::new(config.telephony.clone())?),
        };
        let voice: Arc<dyn VoiceClient> = match self.voice {
            Some(voice) => voice,
            None => Arc::new(ElevenLabsVoiceClient::new(config.voice.clone())?),
        };

        let orchestrator = Arc::new(CallOrchestrator::new(
            config.clone(),
            db,
            orders,
            telephony,
            voice,
            clock,
        ));

        Ok(CallEngineServer {
            orchestrator,
            config,
            shutdown: CancellationToken::new(),
            task_handles: Vec::new(),
        })
    }
}
