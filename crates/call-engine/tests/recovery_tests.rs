//! Sweeps: stuck calls, lost lease owners, retry dispatch, background tasks

mod common;

use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio_util::sync::CancellationToken;

use common::Harness;
use voiceconfirm_call_engine::clock::Clock;
use voiceconfirm_call_engine::error::{CallEngineError, DialError};
use voiceconfirm_call_engine::orchestrator::CallOptions;
use voiceconfirm_call_engine::orders::OrderService;
use voiceconfirm_call_engine::types::{CallState, ConfirmationStatus, FailureReason, ProviderCallId};

#[tokio::test]
async fn test_lease_conflict_then_reclaimed_after_ttl() {
    let h = Harness::new().await;
    let order_id = h.seed_order("O4").await;
    let gate = h.engine.gate();
    let ttl = Duration::seconds(120);

    let lease = gate.acquire(&order_id, "engine-a", ttl).await.unwrap();
    assert_eq!(lease.owner_id, "engine-a");

    assert!(matches!(
        gate.acquire(&order_id, "engine-b", ttl).await,
        Err(CallEngineError::Conflict(_))
    ));

    h.clock.advance(Duration::seconds(121));
    assert_eq!(h.engine.sweep_expired_leases().await.unwrap(), 1);
    assert!(gate.current(&order_id).await.unwrap().is_none());

    let taken = gate.acquire(&order_id, "engine-b", ttl).await.unwrap();
    assert_eq!(taken.owner_id, "engine-b");
}

#[tokio::test]
async fn test_lost_owner_fails_attempt_and_schedules_retry() {
    let h = Harness::new().await;
    let order_id = h.seed_order("O15").await;
    h.engine.initiate_call(&order_id, CallOptions::default()).await.unwrap();

    // The owner never renews; another instance sweeps
    h.clock.advance(Duration::seconds(121));
    let sweeper = h.peer("engine-b");
    assert_eq!(sweeper.sweep_expired_leases().await.unwrap(), 1);

    let attempt = &h.history(&order_id).await[0];
    assert_eq!(attempt.state, CallState::Failed);
    assert_eq!(attempt.failure_reason, Some(FailureReason::ProviderError));
    assert_eq!(h.telephony.terminated(), vec![ProviderCallId::new("CA1")]);
    assert!(h.engine.retries().get(&order_id).await.unwrap().is_some());

    // A second sweep finds nothing left to do
    assert_eq!(sweeper.sweep_expired_leases().await.unwrap(), 0);

    h.clock.advance(Duration::minutes(10));
    assert_eq!(sweeper.dispatch_due_retries().await.unwrap(), 1);
    let history = h.history(&order_id).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].state, CallState::Dialing);
    assert_eq!(
        h.engine.gate().current(&order_id).await.unwrap().unwrap().owner_id,
        "engine-b"
    );
}

#[tokio::test]
async fn test_renewal_keeps_running_call_leased() {
    let h = Harness::new().await;
    let order_id = h.seed_order("O16").await;
    h.engine.initiate_call(&order_id, CallOptions::default()).await.unwrap();

    h.clock.advance(Duration::seconds(100));
    assert_eq!(h.engine.renew_leases().await.unwrap(), 1);
    h.clock.advance(Duration::seconds(100));

    assert_eq!(h.engine.sweep_expired_leases().await.unwrap(), 0);
    assert_eq!(h.history(&order_id).await[0].state, CallState::Dialing);
}

#[tokio::test]
async fn test_timeout_sweep_fails_silent_calls() {
    let h = Harness::new().await;
    let quiet = h.seed_order("O17").await;
    let chatty = h.seed_order("O18").await;
    h.engine.initiate_call(&quiet, CallOptions::default()).await.unwrap();
    h.engine.initiate_call(&chatty, CallOptions::default()).await.unwrap();

    h.clock.advance(Duration::seconds(400));
    h.telephony_status("CA2", "in-progress", 1).await.unwrap();
    h.clock.advance(Duration::seconds(201));

    assert_eq!(h.engine.sweep_timeouts().await.unwrap(), 1);

    let timed_out = &h.history(&quiet).await[0];
    assert_eq!(timed_out.state, CallState::Failed);
    assert_eq!(timed_out.failure_reason, Some(FailureReason::Timeout));
    assert_eq!(h.telephony.terminated(), vec![ProviderCallId::new("CA1")]);
    assert!(h.engine.retries().get(&quiet).await.unwrap().is_some());
    assert!(h.engine.gate().current(&quiet).await.unwrap().is_none());

    assert_eq!(h.history(&chatty).await[0].state, CallState::InProgress);

    // Sweeping again is a no-op
    assert_eq!(h.engine.sweep_timeouts().await.unwrap(), 0);
}

#[tokio::test]
async fn test_dispatch_drops_retry_for_finalized_order() {
    let h = Harness::new().await;
    let order_id = h.seed_order("O19").await;
    h.engine.initiate_call(&order_id, CallOptions::default()).await.unwrap();
    h.telephony_status("CA1", "no-answer", 1).await.unwrap();

    // Finalized elsewhere while the retry was pending
    h.orders
        .transition_status(&order_id, ConfirmationStatus::Confirming, ConfirmationStatus::Confirmed)
        .await
        .unwrap();

    h.clock.advance(Duration::hours(1));
    assert_eq!(h.engine.dispatch_due_retries().await.unwrap(), 0);
    assert!(h.engine.retries().get(&order_id).await.unwrap().is_none());
    assert_eq!(h.history(&order_id).await.len(), 1);
}

#[tokio::test]
async fn test_dispatch_abandons_order_that_can_no_longer_be_called() {
    let h = Harness::new().await;
    let order_id = h.seed_order("O22").await;
    h.telephony
        .push_dial_result(Err(DialError::ProviderError("503 from carrier".to_string())));
    h.engine.initiate_call(&order_id, CallOptions::default()).await.unwrap();
    assert!(h.engine.retries().get(&order_id).await.unwrap().is_some());

    // The number is removed while the retry waits
    let mut order = h.orders.get_order(&order_id).await.unwrap().unwrap();
    order.customer_phone = String::new();
    h.orders.upsert(&order).await.unwrap();

    h.clock.advance(Duration::hours(1));
    assert_eq!(h.engine.dispatch_due_retries().await.unwrap(), 0);

    assert_eq!(h.order_status(&order_id).await, ConfirmationStatus::Unreachable);
    assert!(h.engine.retries().get(&order_id).await.unwrap().is_none());
    assert_eq!(h.history(&order_id).await.len(), 1);
    assert_eq!(h.telephony.dialed().len(), 1);

    // Nothing left for later ticks
    h.clock.advance(Duration::hours(1));
    assert_eq!(h.engine.dispatch_due_retries().await.unwrap(), 0);
}

#[tokio::test]
async fn test_manual_initiation_waits_for_pending_retry() {
    let h = Harness::new().await;
    let order_id = h.seed_order("O23").await;
    h.engine.initiate_call(&order_id, CallOptions::default()).await.unwrap();
    h.telephony_status("CA1", "busy", 1).await.unwrap();
    let pending = h.engine.retries().get(&order_id).await.unwrap().unwrap();

    h.clock.advance(Duration::seconds(60));
    assert!(matches!(
        h.engine.initiate_call(&order_id, CallOptions::default()).await,
        Err(CallEngineError::Conflict(_))
    ));
    assert_eq!(h.history(&order_id).await.len(), 1);
    assert!(h.engine.gate().current(&order_id).await.unwrap().is_none());
    assert_eq!(h.engine.retries().get(&order_id).await.unwrap().unwrap().due_at, pending.due_at);

    h.clock.advance(pending.due_at - h.clock.now());
    let summary = h.engine.initiate_call(&order_id, CallOptions::default()).await.unwrap();
    assert_eq!(summary.attempt_number, 2);
    assert!(h.engine.retries().get(&order_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_window_exhaustion_marks_unreachable() {
    let mut config = voiceconfirm_call_engine::config::CallEngineConfig::for_testing();
    config.retry.max_attempts = 5;
    config.retry.total_window_secs = 600;
    let h = Harness::with_config(config).await;
    let order_id = h.seed_order("O20").await;
    h.engine.initiate_call(&order_id, CallOptions::default()).await.unwrap();

    h.clock.advance(Duration::seconds(601));
    h.telephony_status("CA1", "no-answer", 1).await.unwrap();

    assert_eq!(h.order_status(&order_id).await, ConfirmationStatus::Unreachable);
    assert!(h.engine.retries().get(&order_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_event_ledger_purge_after_redelivery_window() {
    let h = Harness::new().await;
    let order_id = h.seed_order("O21").await;
    h.engine.initiate_call(&order_id, CallOptions::default()).await.unwrap();
    h.telephony_status("CA1", "ringing", 1).await.unwrap();
    h.telephony_status("CA1", "in-progress", 2).await.unwrap();

    assert_eq!(h.engine.purge_event_ledger().await.unwrap(), 0);
    h.clock.advance(Duration::seconds(3601));
    assert_eq!(h.engine.purge_event_ledger().await.unwrap(), 2);
}

#[tokio::test]
async fn test_background_tasks_stop_on_shutdown() {
    let h = Harness::new().await;
    let shutdown = CancellationToken::new();
    let handles = h.engine.spawn_background_tasks(shutdown.clone());
    assert_eq!(handles.len(), 4);

    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .expect("task did not stop")
            .unwrap();
    }
}
