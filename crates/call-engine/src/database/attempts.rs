//! Call attempt persistence
//!
//! Attempts change only through [`AttemptStore::compare_and_swap`], which
//! succeeds only if the stored row still matches the version the caller read.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use super::events::LedgerEntry;
use super::{from_millis, from_millis_opt, is_unique_violation, parse_column, to_millis, CallEngineDatabase};
use crate::error::{CallEngineError, Result};
use crate::types::{AttemptId, CallArtifacts, CallAttempt, CallState, OrderId, ProviderCallId};

const ATTEMPT_COLUMNS: &str = "id, order_id, attempt_number, state, outcome, failure_reason, provider_call_id, \
     last_applied_telephony_sequence, last_applied_voice_sequence, language, voice_id, transcript, recording_url, duration_secs, \
     created_at, started_at, ended_at, last_event_at";

#[derive(Clone, Debug)]
pub struct AttemptStore {
    db: CallEngineDatabase,
}

impl AttemptStore {
    pub fn new(db: CallEngineDatabase) -> Self {
        Self { db }
    }

    /// Insert the next Queued attempt for an order.
    ///
    /// The number is computed inside the INSERT so concurrent callers cannot
    /// both take the same one. Fails with `Conflict` when the order already has
    /// an active attempt.
    pub async fn create_next(
        &self,
        order_id: &OrderId,
        language: &str,
        voice_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CallAttempt> {
        let id = AttemptId::new();
        let inserted = sqlx::query(
            r#"
            INSERT INTO call_attempts
                (id, order_id, attempt_number, state, last_applied_telephony_sequence,
                 last_applied_voice_sequence, language, voice_id, created_at, last_event_at)
            SELECT ?1, ?2, COALESCE(MAX(attempt_number), 0) + 1, 'queued', -1, -1, ?3, ?4, ?5, ?5
            FROM call_attempts WHERE order_id = ?2
            RETURNING attempt_number
            "#,
        )
        .bind(id.as_str())
        .bind(order_id.as_str())
        .bind(language)
        .bind(voice_id)
        .bind(to_millis(now))
        .fetch_one(self.db.pool())
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                return Err(CallEngineError::conflict(format!(
                    "Order {} already has an active call attempt",
                    order_id
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let attempt_number: i64 = row.try_get("attempt_number")?;

        debug!(order_id = %order_id, attempt_id = %id, attempt_number, "Created call attempt");

        let mut attempt = CallAttempt::queued(
            order_id.clone(),
            attempt_number as u32,
            language,
            voice_id.map(str::to_string),
            now,
        );
        attempt.id = id;
        Ok(attempt)
    }

    pub async fn get(&self, id: &AttemptId) -> Result<Option<CallAttempt>> {
        let row = sqlx::query(&format!("SELECT {} FROM call_attempts WHERE id = ?1", ATTEMPT_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    pub async fn get_by_provider_call_id(&self, provider_call_id: &ProviderCallId) -> Result<Option<CallAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM call_attempts WHERE provider_call_id = ?1",
            ATTEMPT_COLUMNS
        ))
        .bind(provider_call_id.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    /// All attempts for an order, oldest first
    pub async fn history(&self, order_id: &OrderId) -> Result<Vec<CallAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM call_attempts WHERE order_id = ?1 ORDER BY attempt_number ASC",
            ATTEMPT_COLUMNS
        ))
        .bind(order_id.as_str())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    /// The order's non-terminal attempt, if any
    pub async fn active_for_order(&self, order_id: &OrderId) -> Result<Option<CallAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM call_attempts
             WHERE order_id = ?1 AND state IN ('queued', 'dialing', 'in_progress')",
            ATTEMPT_COLUMNS
        ))
        .bind(order_id.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    /// Non-terminal attempts whose last event is at or before `cutoff`.
    ///
    /// Queued attempts are included: one left behind by a failed dial
    /// preparation would otherwise sit under a lease its owner keeps renewing.
    pub async fn stale_active(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM call_attempts
             WHERE state IN ('queued', 'dialing', 'in_progress') AND last_event_at <= ?1
             ORDER BY last_event_at ASC",
            ATTEMPT_COLUMNS
        ))
        .bind(to_millis(cutoff))
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    /// Count of attempts per order and time of the latest one
    pub async fn accounting(&self, order_id: &OrderId) -> Result<(u32, Option<DateTime<Utc>>)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS attempts, MAX(created_at) AS last_call_at FROM call_attempts WHERE order_id = ?1",
        )
        .bind(order_id.as_str())
        .fetch_one(self.db.pool())
        .await?;
        let attempts: i64 = row.try_get("attempts")?;
        let last: Option<i64> = row.try_get("last_call_at")?;
        Ok((attempts as u32, from_millis_opt(last)?))
    }

    /// Replace `prev` with `next` if nobody else changed the row in between.
    ///
    /// When `ledger` is given the provider event is recorded in the same
    /// transaction, so an event is remembered exactly when its effect is.
    pub async fn compare_and_swap(
        &self,
        prev: &CallAttempt,
        next: &CallAttempt,
        ledger: Option<&LedgerEntry>,
    ) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE call_attempts
            SET state = ?1, outcome = ?2, failure_reason = ?3, provider_call_id = ?4,
                last_applied_telephony_sequence = ?5, last_applied_voice_sequence = ?6,
                transcript = ?7, recording_url = ?8, duration_secs = ?9,
                started_at = ?10, ended_at = ?11, last_event_at = ?12
            WHERE id = ?13 AND state = ?14
              AND last_applied_telephony_sequence = ?15 AND last_applied_voice_sequence = ?16
            "#,
        )
        .bind(next.state.as_str())
        .bind(next.outcome.map(|o| o.as_str()))
        .bind(next.failure_reason.map(|r| r.as_str()))
        .bind(next.provider_call_id.as_ref().map(|p| p.as_str()))
        .bind(next.last_applied_telephony_sequence)
        .bind(next.last_applied_voice_sequence)
        .bind(next.artifacts.transcript.as_deref())
        .bind(next.artifacts.recording_url.as_deref())
        .bind(next.artifacts.duration_secs)
        .bind(next.started_at.map(to_millis))
        .bind(next.ended_at.map(to_millis))
        .bind(to_millis(next.last_event_at))
        .bind(prev.id.as_str())
        .bind(prev.state.as_str())
        .bind(prev.last_applied_telephony_sequence)
        .bind(prev.last_applied_voice_sequence)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(attempt_id = %prev.id, "Attempt changed concurrently; swap rejected");
            return Ok(false);
        }

        if let Some(entry) = ledger {
            super::events::insert_entry(&mut *tx, entry).await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

pub(crate) fn attempt_from_row(row: &SqliteRow) -> Result<CallAttempt> {
    let state: String = row.try_get("state")?;
    let outcome: Option<String> = row.try_get("outcome")?;
    let failure_reason: Option<String> = row.try_get("failure_reason")?;
    let provider_call_id: Option<String> = row.try_get("provider_call_id")?;
    let attempt_number: i64 = row.try_get("attempt_number")?;

    Ok(CallAttempt {
        id: AttemptId(row.try_get("id")?),
        order_id: OrderId(row.try_get("order_id")?),
        attempt_number: attempt_number as u32,
        state: parse_column::<CallState>(&state, "state")?,
        outcome: outcome.as_deref().map(|o| parse_column(o, "outcome")).transpose()?,
        failure_reason: failure_reason
            .as_deref()
            .map(|r| parse_column(r, "failure_reason"))
            .transpose()?,
        provider_call_id: provider_call_id.map(ProviderCallId),
        last_applied_telephony_sequence: row.try_get("last_applied_telephony_sequence")?,
        last_applied_voice_sequence: row.try_get("last_applied_voice_sequence")?,
        language: row.try_get("language")?,
        voice_id: row.try_get("voice_id")?,
        artifacts: CallArtifacts {
            transcript: row.try_get("transcript")?,
            recording_url: row.try_get("recording_url")?,
            duration_secs: row.try_get("duration_secs")?,
        },
        created_at: from_millis(row.try_get("created_at")?)?,
        started_at: from_millis_opt(row.try_get("started_at")?)?,
        ended_at: from_millis_opt(row.try_get("ended_at")?)?,
        last_event_at: from_millis(row.try_get("last_event_at")?)?,
    })
}
