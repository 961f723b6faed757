//! Database schema definitions for the call engine
//!
//! All timestamps are INTEGER epoch milliseconds.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::Result;

/// Create the orders table
pub async fn create_orders_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating orders table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            external_order_id TEXT NOT NULL,
            customer_name TEXT NOT NULL,
            customer_phone TEXT NOT NULL,
            language TEXT,
            voice_id TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            total_amount REAL NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'USD',
            confirmation_status TEXT NOT NULL DEFAULT 'unconfirmed',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("✅ Orders table created");
    Ok(())
}

/// Create the call attempts table
///
/// `UNIQUE(order_id, attempt_number)` keeps numbering gap-free under
/// concurrent creation; the partial index in [`create_indexes`] allows only
/// one active attempt per order.
pub async fn create_call_attempts_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating call_attempts table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_attempts (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            state TEXT NOT NULL,
            outcome TEXT,
            failure_reason TEXT,
            provider_call_id TEXT UNIQUE,
            last_applied_telephony_sequence INTEGER NOT NULL DEFAULT -1,
            last_applied_voice_sequence INTEGER NOT NULL DEFAULT -1,
            language TEXT NOT NULL,
            voice_id TEXT,
            transcript TEXT,
            recording_url TEXT,
            duration_secs INTEGER,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            ended_at INTEGER,
            last_event_at INTEGER NOT NULL,
            UNIQUE (order_id, attempt_number),
            CHECK (outcome IS NULL OR state = 'completed'),
            CHECK (failure_reason IS NULL OR state = 'failed')
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("✅ Call attempts table created");
    Ok(())
}

/// Create the lease table
pub async fn create_call_leases_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating call_leases table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_leases (
            order_id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            attempt_id TEXT,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("✅ Call leases table created");
    Ok(())
}

/// Create the applied webhook event ledger
pub async fn create_applied_events_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating applied_events table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS applied_events (
            source TEXT NOT NULL,
            provider_call_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            payload_hash TEXT NOT NULL,
            received_at INTEGER NOT NULL,
            PRIMARY KEY (source, provider_call_id, sequence)
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("✅ Applied events table created");
    Ok(())
}

/// Create the append-only call log
pub async fn create_call_log_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating call_log table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_log (
            attempt_id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            state TEXT NOT NULL,
            outcome TEXT,
            failure_reason TEXT,
            provider_call_id TEXT,
            language TEXT NOT NULL,
            voice_id TEXT,
            transcript TEXT,
            recording_url TEXT,
            duration_secs INTEGER,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            ended_at INTEGER,
            logged_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("✅ Call log table created");
    Ok(())
}

/// Create the pending retry table
pub async fn create_retry_schedule_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating retry_schedule table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retry_schedule (
            order_id TEXT PRIMARY KEY,
            due_at INTEGER NOT NULL,
            after_attempt INTEGER NOT NULL,
            scheduled_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("✅ Retry schedule table created");
    Ok(())
}

/// Create the conversation asset table
pub async fn create_conversation_assets_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating conversation_assets table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_assets (
            attempt_id TEXT PRIMARY KEY,
            script TEXT NOT NULL,
            audio BLOB NOT NULL,
            content_type TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("✅ Conversation assets table created");
    Ok(())
}

/// Create indexes
pub async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating database indexes");

    let statements = [
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_call_attempts_one_active
            ON call_attempts(order_id) WHERE state IN ('queued', 'dialing', 'in_progress')",
        "CREATE INDEX IF NOT EXISTS idx_call_attempts_state_event
            ON call_attempts(state, last_event_at)",
        "CREATE INDEX IF NOT EXISTS idx_call_leases_expires ON call_leases(expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_call_leases_owner ON call_leases(owner_id)",
        "CREATE INDEX IF NOT EXISTS idx_applied_events_received ON applied_events(received_at)",
        "CREATE INDEX IF NOT EXISTS idx_call_log_order ON call_log(order_id, attempt_number)",
        "CREATE INDEX IF NOT EXISTS idx_call_log_created ON call_log(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_retry_schedule_due ON retry_schedule(due_at)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    debug!("✅ Database indexes created");
    Ok(())
}
