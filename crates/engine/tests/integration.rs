//! End-to-end tests for the delivery pipeline.
//!
//! Everything runs against in-memory stores and mock channels; tests that
//! exercise retry backoff or queue timing run under a paused tokio clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use courier_channels::{Channel, ChannelRegistry};
use courier_common::config::EngineConfig;
use courier_common::error::EngineError;
use courier_common::store::{MemoryHistoryStore, MemoryPreferenceBacking, PreferenceBacking};
use courier_common::types::{
    ChannelKind, DeliveryResult, DeliveryStatus, Notification, NotificationType, Preference,
    RetryPolicy,
};
use courier_engine::analytics::AnalyticsTracker;
use courier_engine::delivery::{DeliveryEngine, DispatchJob};
use courier_engine::manager::{NotificationManager, StatusSummary};
use courier_engine::scheduler::Scheduler;

// ============================================================
// Shared helpers
// ============================================================

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    AlwaysFail,
    /// Fail the first N calls, then succeed.
    FailFirst(u32),
}

struct MockChannel {
    kind: ChannelKind,
    behavior: Behavior,
    calls: AtomicU32,
}

impl MockChannel {
    fn new(kind: ChannelKind, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behavior,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn initialize(&mut self, _config: serde_json::Value) -> Result<(), EngineError> {
        Ok(())
    }

    async fn send(
        &self,
        _notification: &Notification,
        _preference: &Preference,
    ) -> Result<DeliveryResult, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(DeliveryResult::delivered(format!("mock-{}", call))),
            Behavior::AlwaysFail => Err(EngineError::Delivery("transport refused".into())),
            Behavior::FailFirst(n) if call < n => {
                Err(EngineError::Delivery("transport refused".into()))
            }
            Behavior::FailFirst(_) => Ok(DeliveryResult::delivered(format!("mock-{}", call))),
        }
    }

    fn validate_config(&self, _config: &serde_json::Value) -> bool {
        true
    }

    async fn test_connection(&self) -> bool {
        true
    }
}

struct Harness {
    manager: NotificationManager,
    backing: Arc<MemoryPreferenceBacking>,
}

fn make_harness(channels: Vec<Arc<MockChannel>>, config: EngineConfig) -> Harness {
    let mut registry = ChannelRegistry::new();
    for channel in channels {
        registry.register(channel);
    }
    let backing = Arc::new(MemoryPreferenceBacking::new());
    let manager = NotificationManager::new(
        config,
        registry,
        backing.clone(),
        Arc::new(MemoryHistoryStore::new()),
        None,
    );
    manager.start();
    Harness { manager, backing }
}

fn make_notification(channels: Vec<ChannelKind>) -> Notification {
    Notification::new(
        "user-1",
        NotificationType::PriceAlert,
        "BTC alert",
        "BTC crossed your target price",
        channels,
    )
}

/// Allow every requested channel for (user-1, PriceAlert).
async fn allow_all_channels(backing: &MemoryPreferenceBacking) {
    let mut pref = Preference::new("user-1", NotificationType::PriceAlert);
    pref.channels = vec![
        ChannelKind::Email,
        ChannelKind::Sms,
        ChannelKind::Push,
        ChannelKind::Webhook,
    ];
    backing.save(&pref).await.unwrap();
}

/// Poll status until no record is pending or the (virtual) deadline passes.
async fn wait_for_settled(manager: &NotificationManager, id: Uuid) -> StatusSummary {
    for _ in 0..600 {
        let status = manager.status(id).await;
        if status.pending == 0 && !status.per_channel.is_empty() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("notification {} did not settle", id);
}

// ============================================================
// Scenario A: single channel, no retry policy, channel always fails
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_a_single_failure_no_retry() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::AlwaysFail);
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    let n = make_notification(vec![ChannelKind::Email]);
    let records = harness.manager.send(n.clone()).await.unwrap();
    assert_eq!(records.len(), 1);

    let status = wait_for_settled(&harness.manager, n.id).await;
    assert_eq!(status.failed, 1);
    assert_eq!(status.delivered, 0);
    assert_eq!(status.per_channel["email"], DeliveryStatus::Failed);
    assert_eq!(email.calls(), 1);
}

// ============================================================
// Scenario B: two channels, one succeeds, one exhausts its retries
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_b_partial_failure_with_retries() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let sms = MockChannel::new(ChannelKind::Sms, Behavior::AlwaysFail);
    let harness = make_harness(vec![email.clone(), sms.clone()], EngineConfig::default());
    allow_all_channels(&harness.backing).await;

    let n = make_notification(vec![ChannelKind::Email, ChannelKind::Sms]).with_retry_policy(
        RetryPolicy {
            max_retries: 2,
            retry_delay_secs: 1,
            backoff_multiplier: 2.0,
            max_delay_secs: 10,
        },
    );
    harness.manager.send(n.clone()).await.unwrap();

    let status = wait_for_settled(&harness.manager, n.id).await;
    assert_eq!(status.delivered, 1);
    assert_eq!(status.failed, 1);
    assert_eq!(status.per_channel["email"], DeliveryStatus::Delivered);
    assert_eq!(status.per_channel["sms"], DeliveryStatus::Failed);

    // Email delivered on the first attempt; SMS attempted 3 times
    // (initial + 2 retries).
    assert_eq!(email.calls(), 1);
    assert_eq!(sms.calls(), 3);
}

// ============================================================
// Attempt bound: maxRetries = N gives exactly N+1 attempts
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_attempt_bound_is_max_retries_plus_one() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::AlwaysFail);
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    let n = make_notification(vec![ChannelKind::Email]).with_retry_policy(RetryPolicy {
        max_retries: 3,
        retry_delay_secs: 1,
        backoff_multiplier: 2.0,
        max_delay_secs: 10,
    });
    harness.manager.send(n.clone()).await.unwrap();

    wait_for_settled(&harness.manager, n.id).await;
    assert_eq!(email.calls(), 4);
}

// ============================================================
// Retry recovers: a transient failure is delivered on a later attempt
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_transient_failure() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::FailFirst(2));
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    let n = make_notification(vec![ChannelKind::Email]).with_retry_policy(RetryPolicy {
        max_retries: 3,
        retry_delay_secs: 1,
        backoff_multiplier: 2.0,
        max_delay_secs: 10,
    });
    harness.manager.send(n.clone()).await.unwrap();

    let status = wait_for_settled(&harness.manager, n.id).await;
    assert_eq!(status.delivered, 1);
    assert_eq!(email.calls(), 3);
}

// ============================================================
// Status partition: delivered + failed + pending == channel count
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_status_partition_sums_to_channel_count() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let sms = MockChannel::new(ChannelKind::Sms, Behavior::AlwaysFail);
    let harness = make_harness(vec![email, sms], EngineConfig::default());
    allow_all_channels(&harness.backing).await;

    let n = make_notification(vec![ChannelKind::Email, ChannelKind::Sms]);
    harness.manager.send(n.clone()).await.unwrap();

    let status = wait_for_settled(&harness.manager, n.id).await;
    assert_eq!(status.delivered + status.failed + status.pending, 2);
}

// ============================================================
// Quiet hours: empty result, zero channel calls
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_quiet_hours_suppress_all_channels() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    let pref = Preference::new("user-1", NotificationType::PriceAlert).with_quiet_hours(
        chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
    );
    harness.backing.save(&pref).await.unwrap();

    let records = harness
        .manager
        .send(make_notification(vec![ChannelKind::Email]))
        .await
        .unwrap();
    assert!(records.is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(email.calls(), 0);
}

// ============================================================
// Rate limiting: K+1 sends against a per-minute limit of K
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_channel_rate_limit_drops_excess() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let config = EngineConfig {
        channel_minute_limit: 2,
        ..EngineConfig::default()
    };
    let harness = make_harness(vec![email.clone()], config);

    let mut ids = Vec::new();
    for i in 0..3 {
        let mut n = make_notification(vec![ChannelKind::Email]);
        n.user_id = format!("user-{}", i);
        ids.push(n.id);
        harness.manager.send(n).await.unwrap();
    }

    tokio::time::sleep(Duration::from_secs(3)).await;

    // Exactly K channel calls; the dropped send is neither failed nor
    // retried, its record stays pending.
    assert_eq!(email.calls(), 2);
    let mut delivered = 0;
    let mut pending = 0;
    for id in ids {
        let status = harness.manager.status(id).await;
        delivered += status.delivered;
        pending += status.pending;
        assert_eq!(status.failed, 0);
    }
    assert_eq!(delivered, 2);
    assert_eq!(pending, 1);
    assert_eq!(harness.manager.stats().rate_limited, 1);
}

// ============================================================
// Scenario C: cancel before due time means zero dispatch attempts
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_c_cancel_before_due() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    let n = make_notification(vec![ChannelKind::Email]);
    let schedule_id = harness
        .manager
        .schedule(n.clone(), Utc::now() + chrono::Duration::seconds(3600))
        .await
        .unwrap();

    assert!(harness.manager.cancel(schedule_id).await);
    // Cancelling twice is a no-op returning false.
    assert!(!harness.manager.cancel(schedule_id).await);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(email.calls(), 0);
}

// ============================================================
// Deferred flow: a due one-off entry dispatches through the manager
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_due_schedule_dispatches_through_manager() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    // Drive a standalone scheduler against the manager sink with a
    // synthetic clock instead of waiting out the real tick loop.
    let scheduler = Scheduler::new(&EngineConfig::default());
    let n = make_notification(vec![ChannelKind::Email]);
    let due = Utc::now() + chrono::Duration::hours(1);
    scheduler.schedule_one_off(n.clone(), due).await;

    scheduler
        .process_due(due + chrono::Duration::seconds(1), &harness.manager)
        .await;

    let status = wait_for_settled(&harness.manager, n.id).await;
    assert_eq!(status.delivered, 1);
    assert_eq!(email.calls(), 1);
}

// ============================================================
// Scenario D: recurring schedule fires once per daily window
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_d_recurring_daily_through_manager() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    let scheduler = Scheduler::new(&EngineConfig::default());
    let id = scheduler
        .schedule_recurring(
            make_notification(vec![ChannelKind::Email]),
            "0 0 * * *",
            None,
            None,
        )
        .await
        .unwrap();

    let first = scheduler.get(id).await.unwrap().next_run.unwrap();
    for day in 0..3 {
        let at = first + chrono::Duration::days(day) + chrono::Duration::seconds(30);
        scheduler.process_due(at, &harness.manager).await;
        // Re-scanning within the same window does not fire again.
        scheduler
            .process_due(at + chrono::Duration::hours(1), &harness.manager)
            .await;
    }

    for _ in 0..600 {
        if email.calls() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(email.calls(), 3);
}

// ============================================================
// Retry of failed notifications from history
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_retry_failed_resubmits_from_history() {
    // First delivery fails terminally (no policy); the transport then
    // recovers and the retry pass succeeds.
    let email = MockChannel::new(ChannelKind::Email, Behavior::FailFirst(1));
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    let n = make_notification(vec![ChannelKind::Email]);
    harness.manager.send(n.clone()).await.unwrap();
    let status = wait_for_settled(&harness.manager, n.id).await;
    assert_eq!(status.failed, 1);

    let count = harness.manager.retry_failed(None, 24).await.unwrap();
    assert_eq!(count, 1);

    let status = wait_for_settled(&harness.manager, n.id).await;
    assert_eq!(status.delivered, 1);
    assert_eq!(email.calls(), 2);
}

// ============================================================
// Bulk send: per-notification isolation
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_bulk_send_isolates_failures() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let harness = make_harness(vec![email.clone()], EngineConfig::default());

    let good_a = make_notification(vec![ChannelKind::Email]);
    let mut bad = make_notification(vec![ChannelKind::Email]);
    bad.title.clear();
    let good_b = make_notification(vec![ChannelKind::Email]);

    let results = harness
        .manager
        .send_bulk(vec![good_a.clone(), bad.clone(), good_b.clone()])
        .await;

    assert_eq!(results.len(), 2);
    assert!(results.contains_key(&good_a.id));
    assert!(results.contains_key(&good_b.id));
    assert!(!results.contains_key(&bad.id));

    wait_for_settled(&harness.manager, good_a.id).await;
    wait_for_settled(&harness.manager, good_b.id).await;
    assert_eq!(email.calls(), 2);
}

// ============================================================
// Analytics: counters reflect delivery outcomes
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_stats_reflect_outcomes() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let sms = MockChannel::new(ChannelKind::Sms, Behavior::AlwaysFail);
    let harness = make_harness(vec![email, sms], EngineConfig::default());
    allow_all_channels(&harness.backing).await;

    let n = make_notification(vec![ChannelKind::Email, ChannelKind::Sms]);
    harness.manager.send(n.clone()).await.unwrap();
    wait_for_settled(&harness.manager, n.id).await;

    let stats = harness.manager.stats();
    assert_eq!(stats.total_sent, 2);
    assert_eq!(stats.total_delivered, 1);
    assert_eq!(stats.total_failed, 1);
    assert!((stats.delivery_rate - 0.5).abs() < f64::EPSILON);

    let metrics = harness.manager.metrics(
        Utc::now() - chrono::Duration::hours(1),
        Utc::now(),
        None,
        Some(ChannelKind::Email),
    );
    assert_eq!(metrics.per_channel.len(), 1);
    assert_eq!(metrics.per_channel["email"].delivered, 1);
}

// ============================================================
// Engine-level: expired notifications are discarded, not retried
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_engine_discards_expired_notification() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let mut registry = ChannelRegistry::new();
    registry.register(email.clone());

    let analytics = Arc::new(AnalyticsTracker::new(Arc::new(MemoryHistoryStore::new())));
    let engine = DeliveryEngine::new(registry, analytics.clone(), &EngineConfig::default());
    engine.start();

    let n = make_notification(vec![ChannelKind::Email])
        .with_retry_policy(RetryPolicy::default())
        .with_expiry(Utc::now() - chrono::Duration::seconds(1));
    engine.register_records(&n, &[ChannelKind::Email]);
    engine
        .submit(DispatchJob {
            channels: n.channels.clone(),
            preference: Preference::new("user-1", n.kind),
            notification: n.clone(),
        })
        .await
        .unwrap();

    for _ in 0..600 {
        if analytics.realtime_stats().expired == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(analytics.realtime_stats().expired, 1);
    assert_eq!(email.calls(), 0);

    let records = engine.records_for(n.id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Failed);
    // Discarded, never retried: a single record with no further attempts.
    assert_eq!(records[0].retry_count, 0);

    engine.shutdown().await;
}

// ============================================================
// Shutdown: workers stop, submissions are refused
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_manager_shutdown_refuses_new_sends() {
    let email = MockChannel::new(ChannelKind::Email, Behavior::Succeed);
    let harness = make_harness(vec![email], EngineConfig::default());

    harness.manager.shutdown().await;

    let result = harness
        .manager
        .send(make_notification(vec![ChannelKind::Email]))
        .await;
    assert!(result.is_err());
}
