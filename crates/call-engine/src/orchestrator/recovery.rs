//! Periodic sweeps: stuck calls, expired leases, due retries, lease renewal

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CallOptions, CallOrchestrator};
use crate::error::{CallEngineError, Result};
use crate::retry::{RetryAction, RetryScheduler};
use crate::session::SessionEvent;
use crate::types::{CallArtifacts, CallAttempt, ConfirmationStatus, Lease, OrderId};

/// Upper bound on leases or retries handled per sweep tick
const SWEEP_BATCH: u32 = 100;

impl CallOrchestrator {
    /// Fail attempts that saw no event within the call ceiling
    pub async fn sweep_timeouts(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.config.timeouts.call_ceiling();
        let stale = self.attempts.stale_active(cutoff).await?;

        let mut timed_out = 0;
        for attempt in stale {
            match self.time_out_attempt(&attempt).await {
                Ok(true) => timed_out += 1,
                Ok(false) => {}
                Err(e) => error!(attempt_id = %attempt.id, "Timeout sweep failed for attempt: {}", e),
            }
        }
        Ok(timed_out)
    }

    async fn time_out_attempt(&self, attempt: &CallAttempt) -> Result<bool> {
        let Some(failed) = self
            .advance(attempt, &SessionEvent::TimedOut, &CallArtifacts::default())
            .await?
        else {
            return Ok(false);
        };
        warn!(
            order_id = %failed.order_id,
            attempt_id = %failed.id,
            last_event_at = %attempt.last_event_at,
            "⏱️ Call exceeded ceiling without events; failed as timeout"
        );
        if let Some(provider_call_id) = &failed.provider_call_id {
            self.terminate_best_effort(provider_call_id).await;
        }
        self.finish_attempt(&failed).await?;
        Ok(true)
    }

    /// Reconcile leases whose owner stopped renewing them
    pub async fn sweep_expired_leases(&self) -> Result<usize> {
        let expired = self.gate.expired(SWEEP_BATCH).await?;

        let mut reconciled = 0;
        for lease in expired {
            match self.reconcile_lease(&lease).await {
                Ok(true) => reconciled += 1,
                Ok(false) => {}
                Err(e) => error!(order_id = %lease.order_id, "Lease reconciliation failed: {}", e),
            }
        }
        Ok(reconciled)
    }

    async fn reconcile_lease(&self, lease: &Lease) -> Result<bool> {
        // Whoever deletes the expired row owns the cleanup
        if !self.gate.reclaim(lease).await? {
            return Ok(false);
        }

        if let Some(attempt_id) = &lease.attempt_id {
            if let Some(attempt) = self.attempts.get(attempt_id).await? {
                if !attempt.is_terminal() {
                    if let Some(failed) = self
                        .advance(&attempt, &SessionEvent::LeaseExpired, &CallArtifacts::default())
                        .await?
                    {
                        warn!(
                            order_id = %failed.order_id,
                            attempt_id = %failed.id,
                            owner_id = %lease.owner_id,
                            "💀 Lease owner lost; attempt failed"
                        );
                        if let Some(provider_call_id) = &failed.provider_call_id {
                            self.terminate_best_effort(provider_call_id).await;
                        }
                        self.finish_attempt(&failed).await?;
                        return Ok(true);
                    }
                }
            }
        }

        self.reconcile_order(&lease.order_id).await?;
        Ok(true)
    }

    /// Put a Confirming order with no running call and no pending retry back on track
    async fn reconcile_order(&self, order_id: &OrderId) -> Result<()> {
        let Some(order) = self.orders.get_order(order_id).await? else {
            return Ok(());
        };
        if order.confirmation_status != ConfirmationStatus::Confirming {
            return Ok(());
        }
        if self.attempts.active_for_order(order_id).await?.is_some() {
            return Ok(());
        }
        if self.retries.get(order_id).await?.is_some() {
            return Ok(());
        }

        let now = self.clock.now();
        let history = self.attempts.history(order_id).await?;
        let Some(latest) = history.last() else {
            // Owner died between marking the order and creating the attempt
            self.retries.schedule(order_id, now, 0, now).await?;
            info!(order_id = %order_id, "🔁 Order had no attempt yet; retry dispatched now");
            return Ok(());
        };

        self.call_log.append(latest, now).await?;
        match RetryScheduler::next_action(&history, &self.policy, now) {
            RetryAction::RetryAt(due_at) => {
                self.retries
                    .schedule(order_id, due_at, latest.attempt_number, now)
                    .await?;
                info!(order_id = %order_id, due_at = %due_at, "🔁 Missing retry rescheduled");
            }
            action => self.settle_order(order_id, &action).await?,
        }
        Ok(())
    }

    /// Start attempts whose retry time has come
    pub async fn dispatch_due_retries(&self) -> Result<usize> {
        let due = self.retries.due(self.clock.now(), SWEEP_BATCH).await?;

        let mut started = 0;
        for retry in due {
            match self.initiate_call(&retry.order_id, CallOptions::default()).await {
                Ok(summary) => {
                    info!(
                        order_id = %retry.order_id,
                        attempt_number = summary.attempt_number,
                        "🔁 Retry attempt started"
                    );
                    started += 1;
                }
                Err(CallEngineError::Conflict(_)) => {
                    debug!(order_id = %retry.order_id, "Retry due but order is leased; next tick");
                }
                Err(e @ (CallEngineError::NotEligible(_) | CallEngineError::NotFound(_))) => {
                    info!(order_id = %retry.order_id, "Dropping pending retry: {}", e);
                    self.retries.clear(&retry.order_id).await?;
                }
                // The order itself cannot be called (e.g. its number was removed); retrying never helps
                Err(e @ CallEngineError::Validation(_)) => {
                    warn!(order_id = %retry.order_id, "Order can no longer be called; giving up: {}", e);
                    self.settle_order(&retry.order_id, &RetryAction::Abandon).await?;
                }
                Err(e) => error!(order_id = %retry.order_id, "Retry dispatch failed: {}", e),
            }
        }
        Ok(started)
    }

    /// Extend the leases this instance holds for running calls
    pub async fn renew_leases(&self) -> Result<u64> {
        let renewed = self
            .gate
            .renew_owned(self.instance_id(), self.config.gate.lease_ttl())
            .await?;
        if renewed > 0 {
            debug!(renewed, "Leases renewed");
        }
        Ok(renewed)
    }

    /// Forget delivered events older than the redelivery window
    pub async fn purge_event_ledger(&self) -> Result<u64> {
        let purged = self.ingest.purge(self.clock.now()).await?;
        if purged > 0 {
            debug!(purged, "🧹 Event ledger purged");
        }
        Ok(purged)
    }

    /// Run every sweep on its configured interval until `shutdown` fires
    pub fn spawn_background_tasks(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let gate = &self.config.gate;
        let timeouts = &self.config.timeouts;

        vec![
            self.spawn_periodic("lease-renewal", gate.renew_interval_secs, shutdown.clone(), |engine| async move {
                if let Err(e) = engine.renew_leases().await {
                    error!("Lease renewal failed: {}", e);
                }
            }),
            self.spawn_periodic("lease-sweep", gate.sweep_interval_secs, shutdown.clone(), |engine| async move {
                if let Err(e) = engine.sweep_expired_leases().await {
                    error!("Expired lease sweep failed: {}", e);
                }
            }),
            self.spawn_periodic("timeout-sweep", timeouts.sweep_interval_secs, shutdown.clone(), |engine| async move {
                if let Err(e) = engine.sweep_timeouts().await {
                    error!("Timeout sweep failed: {}", e);
                }
                if let Err(e) = engine.purge_event_ledger().await {
                    error!("Event ledger purge failed: {}", e);
                }
            }),
            self.spawn_periodic(
                "retry-dispatch",
                self.config.retry.dispatch_interval_secs,
                shutdown,
                |engine| async move {
                    if let Err(e) = engine.dispatch_due_retries().await {
                        error!("Retry dispatch failed: {}", e);
                    }
                },
            ),
        ]
    }

    fn spawn_periodic<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        every_secs: u64,
        shutdown: CancellationToken,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<CallOrchestrator>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let engine = Arc::clone(self);
        let period = Duration::from_secs(every_secs.max(1));

        tokio::spawn(async move {
            info!("🔄 Starting {} every {:?}", name, period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("{} stopped", name);
                        break;
                    }
                    _ = interval.tick() => task(Arc::clone(&engine)).await,
                }
            }
        })
    }
}
