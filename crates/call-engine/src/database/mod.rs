//! Durable storage for the call engine (SQLite via sqlx)
//!
//! Every piece of state needed to resume after a crash lives here: attempts,
//! leases, the applied-event ledger, pending retries, the call log and the
//! prepared conversation assets. Cross-instance safety comes from
//! conditional writes, never from in-process locks.

pub mod assets;
pub mod attempts;
pub mod events;
pub mod retries;
pub mod schema;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::error::{CallEngineError, Result};

pub use assets::{ConversationAsset, ConversationAssetStore};
pub use attempts::AttemptStore;
pub use events::{EventLedger, LedgerEntry, LedgerRecord};
pub use retries::RetrySchedule;

/// Call engine database handle
#[derive(Clone, Debug)]
pub struct CallEngineDatabase {
    pool: SqlitePool,
}

impl CallEngineDatabase {
    /// Open (creating if needed) the database at `url` and initialize the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        if is_memory_url(url) {
            return Self::connect_in_memory().await;
        }

        info!("🗄️ Opening call engine database at: {}", url);
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.initialize_schema().await?;

        info!("✅ Call engine database initialized successfully");
        Ok(database)
    }

    /// Create in-memory database for testing
    pub async fn connect_in_memory() -> Result<Self> {
        info!("🗄️ Creating in-memory call engine database");

        // Each connection to :memory: is a separate database, so keep exactly one alive.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.initialize_schema().await?;

        info!("✅ In-memory database created successfully");
        Ok(database)
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("📋 Creating call engine database schema");

        schema::create_orders_table(&self.pool).await?;
        schema::create_call_attempts_table(&self.pool).await?;
        schema::create_call_leases_table(&self.pool).await?;
        schema::create_applied_events_table(&self.pool).await?;
        schema::create_call_log_table(&self.pool).await?;
        schema::create_retry_schedule_table(&self.pool).await?;
        schema::create_conversation_assets_table(&self.pool).await?;
        schema::create_indexes(&self.pool).await?;

        debug!("✅ Database schema created successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Execute a health check query
    pub async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                debug!("💚 Database health check passed");
                Ok(true)
            }
            Err(e) => {
                error!("❌ Database health check failed: {}", e);
                Ok(false)
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_memory_url(url: &str) -> bool {
    url == ":memory:" || url.starts_with("sqlite::memory:") || url.contains("mode=memory")
}

/// Store timestamps as epoch milliseconds so SQL comparisons stay numeric
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CallEngineError::internal(format!("Stored timestamp out of range: {}", ms)))
}

pub(crate) fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// Parse a text column into one of the text-backed enums
pub(crate) fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| CallEngineError::internal(format!("Corrupt {} column: {}", column, e)))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || matches!(db.code().as_deref(), Some("1555") | Some("2067"))
        }
        _ => false,
    }
}
