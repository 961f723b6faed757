//! Per-order exclusivity lease
//!
//! Acquisition is one transaction: drop the order's lease if it has expired,
//! then insert a fresh one. The primary key on `order_id` turns a concurrent
//! or unexpired holder into a constraint violation, reported as `Conflict`.
//! This is the only thing stopping two engine instances from dialing the same
//! order at once.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::database::{from_millis, is_unique_violation, to_millis, CallEngineDatabase};
use crate::error::{CallEngineError, Result};
use crate::types::{AttemptId, Lease, OrderId};

#[derive(Clone, Debug)]
pub struct CallRequestGate {
    db: CallEngineDatabase,
    clock: SharedClock,
}

impl CallRequestGate {
    pub fn new(db: CallEngineDatabase, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Create the order's lease if absent or expired
    pub async fn acquire(&self, order_id: &OrderId, owner_id: &str, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now();
        let expires_at = now + ttl;
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("DELETE FROM call_leases WHERE order_id = ?1 AND expires_at <= ?2")
            .bind(order_id.as_str())
            .bind(to_millis(now))
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO call_leases (order_id, owner_id, attempt_id, acquired_at, expires_at)
             VALUES (?1, ?2, NULL, ?3, ?4)",
        )
        .bind(order_id.as_str())
        .bind(owner_id)
        .bind(to_millis(now))
        .bind(to_millis(expires_at))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                debug!(order_id = %order_id, owner_id, "Lease already held");
                return Err(CallEngineError::conflict(format!(
                    "Order {} already has a call in progress",
                    order_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        info!(order_id = %order_id, owner_id, expires_at = %expires_at, "🔒 Lease acquired");

        Ok(Lease {
            order_id: order_id.clone(),
            owner_id: owner_id.to_string(),
            attempt_id: None,
            expires_at,
        })
    }

    /// Extend a lease this owner still holds
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now();
        let expires_at = now + ttl;
        let result = sqlx::query(
            "UPDATE call_leases SET expires_at = ?1
             WHERE order_id = ?2 AND owner_id = ?3 AND expires_at > ?4",
        )
        .bind(to_millis(expires_at))
        .bind(lease.order_id.as_str())
        .bind(&lease.owner_id)
        .bind(to_millis(now))
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(CallEngineError::conflict(format!(
                "Lease for order {} is no longer held by {}",
                lease.order_id, lease.owner_id
            )));
        }

        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    /// Release a lease held by this owner
    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        let result = sqlx::query("DELETE FROM call_leases WHERE order_id = ?1 AND owner_id = ?2")
            .bind(lease.order_id.as_str())
            .bind(&lease.owner_id)
            .execute(self.db.pool())
            .await?;
        let released = result.rows_affected() > 0;
        if released {
            debug!(order_id = %lease.order_id, "🔓 Lease released");
        }
        Ok(released)
    }

    /// Release the lease guarding a finished attempt, whoever owns it.
    ///
    /// Webhooks may land on any instance; once the attempt is terminal its
    /// lease has no purpose left.
    pub async fn release_for_attempt(&self, order_id: &OrderId, attempt_id: &AttemptId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM call_leases WHERE order_id = ?1 AND attempt_id = ?2")
            .bind(order_id.as_str())
            .bind(attempt_id.as_str())
            .execute(self.db.pool())
            .await?;
        let released = result.rows_affected() > 0;
        if released {
            debug!(order_id = %order_id, attempt_id = %attempt_id, "🔓 Lease released for finished attempt");
        }
        Ok(released)
    }

    /// Drop the order's lease regardless of owner (operator cancellation)
    pub async fn force_release(&self, order_id: &OrderId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM call_leases WHERE order_id = ?1")
            .bind(order_id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record which attempt the lease guards
    pub async fn bind_attempt(&self, lease: &Lease, attempt_id: &AttemptId) -> Result<Lease> {
        let result = sqlx::query(
            "UPDATE call_leases SET attempt_id = ?1 WHERE order_id = ?2 AND owner_id = ?3",
        )
        .bind(attempt_id.as_str())
        .bind(lease.order_id.as_str())
        .bind(&lease.owner_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(CallEngineError::conflict(format!(
                "Lease for order {} was lost before the attempt was bound",
                lease.order_id
            )));
        }

        Ok(Lease {
            attempt_id: Some(attempt_id.clone()),
            ..lease.clone()
        })
    }

    /// Extend every unexpired lease held by `owner_id` whose attempt is still running; returns how many.
    ///
    /// Leases not yet bound, or bound to a finished attempt, are left to expire
    /// so the recovery sweep can reconcile whatever was left half done.
    pub async fn renew_owned(&self, owner_id: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now();
        let result = sqlx::query(
            "UPDATE call_leases SET expires_at = ?1
             WHERE owner_id = ?2 AND expires_at > ?3
               AND attempt_id IN (
                   SELECT id FROM call_attempts WHERE state IN ('queued', 'dialing', 'in_progress')
               )",
        )
        .bind(to_millis(now + ttl))
        .bind(owner_id)
        .bind(to_millis(now))
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Leases past their expiry, oldest first
    pub async fn expired(&self, limit: u32) -> Result<Vec<Lease>> {
        let rows = sqlx::query(
            "SELECT order_id, owner_id, attempt_id, expires_at FROM call_leases
             WHERE expires_at <= ?1 ORDER BY expires_at ASC LIMIT ?2",
        )
        .bind(to_millis(self.clock.now()))
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(lease_from_row).collect()
    }

    /// Delete an expired lease if nobody renewed or replaced it meanwhile
    pub async fn reclaim(&self, lease: &Lease) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM call_leases WHERE order_id = ?1 AND owner_id = ?2 AND expires_at <= ?3",
        )
        .bind(lease.order_id.as_str())
        .bind(&lease.owner_id)
        .bind(to_millis(self.clock.now()))
        .execute(self.db.pool())
        .await?;
        let reclaimed = result.rows_affected() > 0;
        if reclaimed {
            warn!(order_id = %lease.order_id, owner_id = %lease.owner_id, "♻️ Reclaimed expired lease");
        }
        Ok(reclaimed)
    }

    /// The order's lease, expired or not
    pub async fn current(&self, order_id: &OrderId) -> Result<Option<Lease>> {
        let row = sqlx::query(
            "SELECT order_id, owner_id, attempt_id, expires_at FROM call_leases WHERE order_id = ?1",
        )
        .bind(order_id.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(lease_from_row).transpose()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn lease_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Lease> {
    let attempt_id: Option<String> = row.try_get("attempt_id")?;
    Ok(Lease {
        order_id: OrderId(row.try_get("order_id")?),
        owner_id: row.try_get("owner_id")?,
        attempt_id: attempt_id.map(AttemptId),
        expires_at: from_millis(row.try_get("expires_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    async fn gate() -> (CallRequestGate, ManualClock) {
        let clock = ManualClock::default();
        let db = CallEngineDatabase::connect_in_memory().await.unwrap();
        (CallRequestGate::new(db, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_second_owner_conflicts_until_expiry() {
        let (gate, clock) = gate().await;
        let order = OrderId::new("O4");
        let ttl = Duration::seconds(30);

        let lease = gate.acquire(&order, "instance-a", ttl).await.unwrap();
        assert_eq!(lease.owner_id, "instance-a");

        let err = gate.acquire(&order, "instance-b", ttl).await.unwrap_err();
        assert!(matches!(err, CallEngineError::Conflict(_)));

        clock.advance(Duration::seconds(31));
        let lease_b = gate.acquire(&order, "instance-b", ttl).await.unwrap();
        assert_eq!(gate.current(&order).await.unwrap().unwrap().owner_id, lease_b.owner_id);

        // The old holder can no longer renew
        assert!(gate.renew(&lease, ttl).await.is_err());
    }

    #[tokio::test]
    async fn test_renew_and_release() {
        let (gate, clock) = gate().await;
        let order = OrderId::new("o-renew");
        let ttl = Duration::seconds(30);

        let lease = gate.acquire(&order, "a", ttl).await.unwrap();
        clock.advance(Duration::seconds(20));
        let renewed = gate.renew(&lease, ttl).await.unwrap();
        assert!(renewed.expires_at > lease.expires_at);

        clock.advance(Duration::seconds(20));
        assert!(gate.acquire(&order, "b", ttl).await.is_err());

        assert!(gate.release(&renewed).await.unwrap());
        assert!(gate.acquire(&order, "b", ttl).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_listing_reclaim_and_bound_release() {
        let (gate, clock) = gate().await;
        let ttl = Duration::seconds(10);
        let attempt = AttemptId::new();

        let lease = gate.acquire(&OrderId::new("o-1"), "a", ttl).await.unwrap();
        let lease = gate.bind_attempt(&lease, &attempt).await.unwrap();
        gate.acquire(&OrderId::new("o-2"), "a", Duration::seconds(60)).await.unwrap();

        clock.advance(Duration::seconds(11));
        let expired = gate.expired(10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].attempt_id, Some(attempt.clone()));

        assert!(gate.release_for_attempt(&lease.order_id, &attempt).await.unwrap());
        assert!(!gate.reclaim(&lease).await.unwrap());
        assert!(gate.expired(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_renew_owned_only_extends_running_attempts() {
        let clock = ManualClock::default();
        let db = CallEngineDatabase::connect_in_memory().await.unwrap();
        let gate = CallRequestGate::new(db.clone(), Arc::new(clock.clone()));
        let attempts = crate::database::AttemptStore::new(db);

        let mut bound = Vec::new();
        for (order, owner, ttl) in [("o-1", "a", 30), ("o-2", "a", 5), ("o-3", "b", 30)] {
            let order_id = OrderId::new(order);
            let lease = gate.acquire(&order_id, owner, Duration::seconds(ttl)).await.unwrap();
            let attempt = attempts.create_next(&order_id, "en", None, clock.now()).await.unwrap();
            bound.push(gate.bind_attempt(&lease, &attempt.id).await.unwrap());
        }
        // Unbound lease of the same owner
        gate.acquire(&OrderId::new("o-4"), "a", Duration::seconds(30)).await.unwrap();

        clock.advance(Duration::seconds(6));
        assert_eq!(gate.renew_owned("a", Duration::seconds(30)).await.unwrap(), 1);
        assert_eq!(bound[0].order_id, OrderId::new("o-1"));
    }
}
