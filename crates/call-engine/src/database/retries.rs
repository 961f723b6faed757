//! Pending retries, one row per order

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{from_millis, to_millis, CallEngineDatabase};
use crate::error::Result;
use crate::types::OrderId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub order_id: OrderId,
    pub due_at: DateTime<Utc>,
    /// Attempt number whose end produced this retry
    pub after_attempt: u32,
}

#[derive(Clone, Debug)]
pub struct RetrySchedule {
    db: CallEngineDatabase,
}

impl RetrySchedule {
    pub fn new(db: CallEngineDatabase) -> Self {
        Self { db }
    }

    /// Schedule or reschedule the order's next attempt
    pub async fn schedule(
        &self,
        order_id: &OrderId,
        due_at: DateTime<Utc>,
        after_attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_schedule (order_id, due_at, after_attempt, scheduled_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (order_id) DO UPDATE SET
                due_at = excluded.due_at,
                after_attempt = excluded.after_attempt,
                scheduled_at = excluded.scheduled_at
            "#,
        )
        .bind(order_id.as_str())
        .bind(to_millis(due_at))
        .bind(after_attempt as i64)
        .bind(to_millis(now))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn clear(&self, order_id: &OrderId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM retry_schedule WHERE order_id = ?1")
            .bind(order_id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, order_id: &OrderId) -> Result<Option<ScheduledRetry>> {
        let row = sqlx::query("SELECT order_id, due_at, after_attempt FROM retry_schedule WHERE order_id = ?1")
            .bind(order_id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(retry_from_row).transpose()
    }

    /// Retries due at or before `now`, earliest first
    pub async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledRetry>> {
        let rows = sqlx::query(
            "SELECT order_id, due_at, after_attempt FROM retry_schedule
             WHERE due_at <= ?1 ORDER BY due_at ASC LIMIT ?2",
        )
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(retry_from_row).collect()
    }
}

fn retry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledRetry> {
    let after_attempt: i64 = row.try_get("after_attempt")?;
    Ok(ScheduledRetry {
        order_id: OrderId(row.try_get("order_id")?),
        due_at: from_millis(row.try_get("due_at")?)?,
        after_attempt: after_attempt as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_schedule_is_one_row_per_order() {
        let schedule = RetrySchedule::new(CallEngineDatabase::connect_in_memory().await.unwrap());
        let now = Utc::now();
        let order = OrderId::new("o-7");

        schedule.schedule(&order, now + Duration::minutes(5), 1, now).await.unwrap();
        schedule.schedule(&order, now + Duration::minutes(1), 2, now).await.unwrap();

        assert!(schedule.due(now, 10).await.unwrap().is_empty());
        let due = schedule.due(now + Duration::minutes(2), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].after_attempt, 2);

        assert!(schedule.clear(&order).await.unwrap());
        assert!(schedule.get(&order).await.unwrap().is_none());
    }
}
