//! Append-only log of finished call attempts
//!
//! Written once per terminal attempt; read by reporting. Appending the same
//! attempt twice leaves exactly one record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::database::{from_millis, from_millis_opt, parse_column, to_millis, CallEngineDatabase};
use crate::error::{CallEngineError, Result};
use crate::types::{AttemptId, CallAttempt, CallOutcome, CallState, FailureReason, OrderId, ProviderCallId};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// A finished attempt as recorded in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub attempt_id: AttemptId,
    pub order_id: OrderId,
    pub attempt_number: u32,
    pub state: CallState,
    pub outcome: Option<CallOutcome>,
    pub failure_reason: Option<FailureReason>,
    pub provider_call_id: Option<ProviderCallId>,
    pub language: String,
    pub voice_id: Option<String>,
    pub transcript: Option<String>,
    pub recording_url: Option<String>,
    pub duration_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Filters for [`CallLogStore::list`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallFilter {
    pub state: Option<CallState>,
    pub outcome: Option<CallOutcome>,
    pub language: Option<String>,
    pub order_id: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub skip: u32,
    pub limit: Option<u32>,
}

impl CallFilter {
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_PAGE_SIZE {
                return Err(CallEngineError::validation(format!(
                    "limit must be between 1 and {}",
                    MAX_PAGE_SIZE
                )));
            }
        }
        if let (Some(from), Some(to)) = (self.created_from, self.created_to) {
            if from > to {
                return Err(CallEngineError::validation("created_from must not be after created_to"));
            }
        }
        Ok(())
    }
}

/// Aggregate statistics over the log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub total_calls: u64,
    pub completed_calls: u64,
    pub failed_calls: u64,
    pub abandoned_calls: u64,
    pub confirmed_calls: u64,
    /// Confirmed calls as a percentage of all calls
    pub success_rate: f64,
    pub average_duration_secs: f64,
    pub total_duration_secs: i64,
    pub calls_by_outcome: BTreeMap<String, u64>,
    pub calls_by_failure_reason: BTreeMap<String, u64>,
    pub calls_by_language: BTreeMap<String, u64>,
}

#[derive(Clone, Debug)]
pub struct CallLogStore {
    db: CallEngineDatabase,
}

impl CallLogStore {
    pub fn new(db: CallEngineDatabase) -> Self {
        Self { db }
    }

    /// Append a terminal attempt; returns false if it was already logged
    pub async fn append(&self, attempt: &CallAttempt, now: DateTime<Utc>) -> Result<bool> {
        if !attempt.is_terminal() {
            return Err(CallEngineError::internal(format!(
                "Refusing to log non-terminal attempt {} ({})",
                attempt.id, attempt.state
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO call_log
                (attempt_id, order_id, attempt_number, state, outcome, failure_reason, provider_call_id,
                 language, voice_id, transcript, recording_url, duration_secs,
                 created_at, started_at, ended_at, logged_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT (attempt_id) DO NOTHING
            "#,
        )
        .bind(attempt.id.as_str())
        .bind(attempt.order_id.as_str())
        .bind(attempt.attempt_number as i64)
        .bind(attempt.state.as_str())
        .bind(attempt.outcome.map(|o| o.as_str()))
        .bind(attempt.failure_reason.map(|r| r.as_str()))
        .bind(attempt.provider_call_id.as_ref().map(|p| p.as_str()))
        .bind(&attempt.language)
        .bind(attempt.voice_id.as_deref())
        .bind(attempt.artifacts.transcript.as_deref())
        .bind(attempt.artifacts.recording_url.as_deref())
        .bind(attempt.duration_secs())
        .bind(to_millis(attempt.created_at))
        .bind(attempt.started_at.map(to_millis))
        .bind(attempt.ended_at.map(to_millis))
        .bind(to_millis(now))
        .execute(self.db.pool())
        .await?;

        let appended = result.rows_affected() > 0;
        if appended {
            info!(
                order_id = %attempt.order_id,
                attempt_id = %attempt.id,
                state = %attempt.state,
                "📝 Call attempt logged"
            );
        } else {
            debug!(attempt_id = %attempt.id, "Call attempt already logged");
        }
        Ok(appended)
    }

    pub async fn get(&self, attempt_id: &AttemptId) -> Result<Option<CallRecord>> {
        let row = sqlx::query("SELECT * FROM call_log WHERE attempt_id = ?1")
            .bind(attempt_id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// All records for an order, by attempt number
    pub async fn by_order(&self, order_id: &OrderId) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query("SELECT * FROM call_log WHERE order_id = ?1 ORDER BY attempt_number ASC")
            .bind(order_id.as_str())
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Filtered page of records, newest first
    pub async fn list(&self, filter: &CallFilter) -> Result<Vec<CallRecord>> {
        filter.validate()?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM call_log WHERE 1 = 1");
        push_filters(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, attempt_number DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_PAGE_SIZE) as i64)
            .push(" OFFSET ")
            .push_bind(filter.skip as i64);

        let rows = query.build().fetch_all(self.db.pool()).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Aggregate statistics for records matching `filter` (pagination ignored)
    pub async fn stats(&self, filter: &CallFilter) -> Result<CallStats> {
        filter.validate()?;

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT state, outcome, failure_reason, language, COUNT(*) AS calls, \
             COALESCE(SUM(duration_secs), 0) AS duration_total, COUNT(duration_secs) AS with_duration \
             FROM call_log WHERE 1 = 1",
        );
        push_filters(&mut query, filter);
        query.push(" GROUP BY state, outcome, failure_reason, language");

        let rows = query.build().fetch_all(self.db.pool()).await?;

        let mut stats = CallStats::default();
        let mut timed_calls = 0u64;
        for row in &rows {
            let state: String = row.try_get("state")?;
            let outcome: Option<String> = row.try_get("outcome")?;
            let failure_reason: Option<String> = row.try_get("failure_reason")?;
            let language: String = row.try_get("language")?;
            let calls = row.try_get::<i64, _>("calls")? as u64;
            let duration_total: i64 = row.try_get("duration_total")?;
            let with_duration = row.try_get::<i64, _>("with_duration")? as u64;

            stats.total_calls += calls;
            stats.total_duration_secs += duration_total;
            timed_calls += with_duration;

            match parse_column::<CallState>(&state, "state")? {
                CallState::Completed => stats.completed_calls += calls,
                CallState::Failed => stats.failed_calls += calls,
                CallState::Abandoned => stats.abandoned_calls += calls,
                _ => {}
            }
            if let Some(outcome) = outcome {
                if outcome == CallOutcome::ConfirmedByCustomer.as_str() {
                    stats.confirmed_calls += calls;
                }
                *stats.calls_by_outcome.entry(outcome).or_default() += calls;
            }
            if let Some(reason) = failure_reason {
                *stats.calls_by_failure_reason.entry(reason).or_default() += calls;
            }
            *stats.calls_by_language.entry(language).or_default() += calls;
        }

        if stats.total_calls > 0 {
            stats.success_rate = round2(stats.confirmed_calls as f64 / stats.total_calls as f64 * 100.0);
        }
        if timed_calls > 0 {
            stats.average_duration_secs = round2(stats.total_duration_secs as f64 / timed_calls as f64);
        }
        Ok(stats)
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Sqlite>, filter: &CallFilter) {
    if let Some(state) = filter.state {
        query.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(outcome) = filter.outcome {
        query.push(" AND outcome = ").push_bind(outcome.as_str());
    }
    if let Some(language) = &filter.language {
        query.push(" AND language = ").push_bind(language.clone());
    }
    if let Some(order_id) = &filter.order_id {
        query.push(" AND order_id = ").push_bind(order_id.clone());
    }
    if let Some(from) = filter.created_from {
        query.push(" AND created_at >= ").push_bind(to_millis(from));
    }
    if let Some(to) = filter.created_to {
        query.push(" AND created_at <= ").push_bind(to_millis(to));
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl From<&CallAttempt> for CallRecord {
    fn from(attempt: &CallAttempt) -> Self {
        Self {
            attempt_id: attempt.id.clone(),
            order_id: attempt.order_id.clone(),
            attempt_number: attempt.attempt_number,
            state: attempt.state,
            outcome: attempt.outcome,
            failure_reason: attempt.failure_reason,
            provider_call_id: attempt.provider_call_id.clone(),
            language: attempt.language.clone(),
            voice_id: attempt.voice_id.clone(),
            transcript: attempt.artifacts.transcript.clone(),
            recording_url: attempt.artifacts.recording_url.clone(),
            duration_secs: attempt.duration_secs(),
            created_at: attempt.created_at,
            started_at: attempt.started_at,
            ended_at: attempt.ended_at,
        }
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CallRecord> {
    let state: String = row.try_get("state")?;
    let outcome: Option<String> = row.try_get("outcome")?;
    let failure_reason: Option<String> = row.try_get("failure_reason")?;
    let provider_call_id: Option<String> = row.try_get("provider_call_id")?;
    let attempt_number: i64 = row.try_get("attempt_number")?;

    Ok(CallRecord {
        attempt_id: AttemptId(row.try_get("attempt_id")?),
        order_id: OrderId(row.try_get("order_id")?),
        attempt_number: attempt_number as u32,
        state: parse_column(&state, "state")?,
        outcome: outcome.as_deref().map(|o| parse_column(o, "outcome")).transpose()?,
        failure_reason: failure_reason
            .as_deref()
            .map(|r| parse_column(r, "failure_reason"))
            .transpose()?,
        provider_call_id: provider_call_id.map(ProviderCallId),
        language: row.try_get("language")?,
        voice_id: row.try_get("voice_id")?,
        transcript: row.try_get("transcript")?,
        recording_url: row.try_get("recording_url")?,
        duration_secs: row.try_get("duration_secs")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        started_at: from_millis_opt(row.try_get("started_at")?)?,
        ended_at: from_millis_opt(row.try_get("ended_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn finished(
        order: &str,
        number: u32,
        state: CallState,
        outcome: Option<CallOutcome>,
        reason: Option<FailureReason>,
        language: &str,
        duration: Option<i64>,
        created: DateTime<Utc>,
    ) -> CallAttempt {
        let mut attempt = CallAttempt::queued(OrderId::new(order), number, language, None, created);
        attempt.state = state;
        attempt.outcome = outcome;
        attempt.failure_reason = reason;
        attempt.artifacts.duration_secs = duration;
        attempt.ended_at = Some(created);
        attempt
    }

    async fn seeded() -> (CallLogStore, DateTime<Utc>) {
        let store = CallLogStore::new(CallEngineDatabase::connect_in_memory().await.unwrap());
        let t0 = Utc::now();
        let records = [
            finished("o-1", 1, CallState::Completed, Some(CallOutcome::NoResponse), None, "en", Some(10), t0),
            finished("o-1", 2, CallState::Completed, Some(CallOutcome::ConfirmedByCustomer), None, "en", Some(50), t0 + Duration::minutes(1)),
            finished("o-2", 1, CallState::Failed, None, Some(FailureReason::InvalidNumber), "es", None, t0 + Duration::minutes(2)),
            finished("o-3", 1, CallState::Completed, Some(CallOutcome::DeclinedByCustomer), None, "es", Some(30), t0 + Duration::minutes(3)),
        ];
        for record in &records {
            assert!(store.append(record, t0).await.unwrap());
        }
        (store, t0)
    }

    #[tokio::test]
    async fn test_append_is_idempotent_and_rejects_active_attempts() {
        let store = CallLogStore::new(CallEngineDatabase::connect_in_memory().await.unwrap());
        let now = Utc::now();
        let attempt = finished("o-1", 1, CallState::Failed, None, Some(FailureReason::Timeout), "en", None, now);
        assert!(store.append(&attempt, now).await.unwrap());
        assert!(!store.append(&attempt, now).await.unwrap());
        assert_eq!(store.by_order(&OrderId::new("o-1")).await.unwrap().len(), 1);

        let active = CallAttempt::queued(OrderId::new("o-1"), 2, "en", None, now);
        assert!(store.append(&active, now).await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates_newest_first() {
        let (store, t0) = seeded().await;

        let all = store.list(&CallFilter::default()).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].order_id, OrderId::new("o-3"));

        let spanish = store
            .list(&CallFilter {
                language: Some("es".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(spanish.len(), 2);

        let page = store
            .list(&CallFilter {
                skip: 1,
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].order_id, OrderId::new("o-2"));

        let windowed = store
            .list(&CallFilter {
                created_from: Some(t0 + Duration::seconds(30)),
                created_to: Some(t0 + Duration::seconds(150)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(windowed.len(), 2);

        assert!(store
            .list(&CallFilter {
                limit: Some(101),
                ..Default::default()
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stats_aggregate_outcomes_and_durations() {
        let (store, _) = seeded().await;
        let stats = store.stats(&CallFilter::default()).await.unwrap();

        assert_eq!(stats.total_calls, 4);
        assert_eq!(stats.completed_calls, 3);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.confirmed_calls, 1);
        assert_eq!(stats.success_rate, 25.0);
        assert_eq!(stats.total_duration_secs, 90);
        assert_eq!(stats.average_duration_secs, 30.0);
        assert_eq!(stats.calls_by_outcome.get("no_response"), Some(&1));
        assert_eq!(stats.calls_by_failure_reason.get("invalid_number"), Some(&1));
        assert_eq!(stats.calls_by_language.get("es"), Some(&2));
    }
}
