//! Prepared conversation audio and script, keyed by attempt

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{to_millis, CallEngineDatabase};
use crate::error::Result;
use crate::types::AttemptId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationAsset {
    pub attempt_id: AttemptId,
    pub script: String,
    pub audio: Vec<u8>,
    pub content_type: String,
}

#[derive(Clone, Debug)]
pub struct ConversationAssetStore {
    db: CallEngineDatabase,
}

impl ConversationAssetStore {
    pub fn new(db: CallEngineDatabase) -> Self {
        Self { db }
    }

    pub async fn put(&self, asset: &ConversationAsset, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_assets (attempt_id, script, audio, content_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (attempt_id) DO UPDATE SET
                script = excluded.script,
                audio = excluded.audio,
                content_type = excluded.content_type
            "#,
        )
        .bind(asset.attempt_id.as_str())
        .bind(&asset.script)
        .bind(&asset.audio)
        .bind(&asset.content_type)
        .bind(to_millis(now))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn get(&self, attempt_id: &AttemptId) -> Result<Option<ConversationAsset>> {
        let row = sqlx::query(
            "SELECT attempt_id, script, audio, content_type FROM conversation_assets WHERE attempt_id = ?1",
        )
        .bind(attempt_id.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|row| -> Result<ConversationAsset> {
            Ok(ConversationAsset {
                attempt_id: AttemptId(row.try_get("attempt_id")?),
                script: row.try_get("script")?,
                audio: row.try_get("audio")?,
                content_type: row.try_get("content_type")?,
            })
        })
        .transpose()
    }
}
