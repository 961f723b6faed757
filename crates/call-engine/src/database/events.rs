//! Ledger of applied provider events
//!
//! Only the `(source, provider_call_id, sequence)` key and the payload hash
//! are kept, for as long as the redelivery window lasts.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use super::{to_millis, CallEngineDatabase};
use crate::error::Result;
use crate::types::{ProviderCallId, WebhookSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub source: WebhookSource,
    pub provider_call_id: ProviderCallId,
    pub sequence: i64,
    pub payload_hash: String,
    pub received_at: DateTime<Utc>,
}

/// Result of recording an event in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRecord {
    /// First time this key was seen
    New,
    /// Same key, same payload
    Duplicate,
    /// Same key, different payload
    Conflicting { stored_hash: String },
}

#[derive(Clone, Debug)]
pub struct EventLedger {
    db: CallEngineDatabase,
}

impl EventLedger {
    pub fn new(db: CallEngineDatabase) -> Self {
        Self { db }
    }

    /// Stored payload hash for a key, if the event was already applied
    pub async fn lookup(
        &self,
        source: WebhookSource,
        provider_call_id: &ProviderCallId,
        sequence: i64,
    ) -> Result<Option<String>> {
        let hash = sqlx::query_scalar::<_, String>(
            "SELECT payload_hash FROM applied_events WHERE source = ?1 AND provider_call_id = ?2 AND sequence = ?3",
        )
        .bind(source.as_str())
        .bind(provider_call_id.as_str())
        .bind(sequence)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(hash)
    }

    /// Record an event that was acknowledged without changing the attempt
    pub async fn record(&self, entry: &LedgerEntry) -> Result<LedgerRecord> {
        let mut conn = self.db.pool().acquire().await?;
        if insert_entry(&mut *conn, entry).await? {
            return Ok(LedgerRecord::New);
        }

        let row = sqlx::query(
            "SELECT payload_hash FROM applied_events WHERE source = ?1 AND provider_call_id = ?2 AND sequence = ?3",
        )
        .bind(entry.source.as_str())
        .bind(entry.provider_call_id.as_str())
        .bind(entry.sequence)
        .fetch_one(&mut *conn)
        .await?;
        let stored_hash: String = row.try_get("payload_hash")?;
        if stored_hash == entry.payload_hash {
            Ok(LedgerRecord::Duplicate)
        } else {
            Ok(LedgerRecord::Conflicting { stored_hash })
        }
    }

    /// Forget events received before `cutoff`
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM applied_events WHERE received_at < ?1")
            .bind(to_millis(cutoff))
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() > 0 {
            debug!("🧹 Purged {} applied event(s) from ledger", result.rows_affected());
        }
        Ok(result.rows_affected())
    }
}

/// Insert if absent; returns whether a row was written
pub(crate) async fn insert_entry(conn: &mut SqliteConnection, entry: &LedgerEntry) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO applied_events (source, provider_call_id, sequence, payload_hash, received_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (source, provider_call_id, sequence) DO NOTHING
        "#,
    )
    .bind(entry.source.as_str())
    .bind(entry.provider_call_id.as_str())
    .bind(entry.sequence)
    .bind(&entry.payload_hash)
    .bind(to_millis(entry.received_at))
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(seq: i64, hash: &str, at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            source: WebhookSource::Telephony,
            provider_call_id: ProviderCallId::new("CA-9"),
            sequence: seq,
            payload_hash: hash.to_string(),
            received_at: at,
        }
    }

    #[tokio::test]
    async fn test_record_detects_duplicates_and_conflicts() {
        let ledger = EventLedger::new(CallEngineDatabase::connect_in_memory().await.unwrap());
        let now = Utc::now();

        assert_eq!(ledger.record(&entry(1, "aaa", now)).await.unwrap(), LedgerRecord::New);
        assert_eq!(ledger.record(&entry(1, "aaa", now)).await.unwrap(), LedgerRecord::Duplicate);
        assert_eq!(
            ledger.record(&entry(1, "bbb", now)).await.unwrap(),
            LedgerRecord::Conflicting {
                stored_hash: "aaa".to_string()
            }
        );
        assert_eq!(
            ledger.lookup(WebhookSource::Telephony, &ProviderCallId::new("CA-9"), 1).await.unwrap(),
            Some("aaa".to_string())
        );
    }

    #[tokio::test]
    async fn test_sources_have_separate_key_spaces() {
        let ledger = EventLedger::new(CallEngineDatabase::connect_in_memory().await.unwrap());
        let now = Utc::now();
        ledger.record(&entry(1, "telephony", now)).await.unwrap();

        let voice = LedgerEntry {
            source: WebhookSource::Voice,
            ..entry(1, "voice", now)
        };
        assert_eq!(ledger.record(&voice).await.unwrap(), LedgerRecord::New);
        assert_eq!(
            ledger.lookup(WebhookSource::Voice, &ProviderCallId::new("CA-9"), 1).await.unwrap(),
            Some("voice".to_string())
        );
    }

    #[tokio::test]
    async fn test_purge_drops_only_old_entries() {
        let ledger = EventLedger::new(CallEngineDatabase::connect_in_memory().await.unwrap());
        let now = Utc::now();
        ledger.record(&entry(1, "old", now - Duration::hours(2))).await.unwrap();
        ledger.record(&entry(2, "new", now)).await.unwrap();

        assert_eq!(ledger.purge_older_than(now - Duration::hours(1)).await.unwrap(), 1);
        let id = ProviderCallId::new("CA-9");
        assert_eq!(ledger.lookup(WebhookSource::Telephony, &id, 1).await.unwrap(), None);
        assert!(ledger.lookup(WebhookSource::Telephony, &id, 2).await.unwrap().is_some());
    }
}
