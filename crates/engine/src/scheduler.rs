//! One-off and recurring schedule management.
//!
//! A single tick loop (1s default) scans for due entries and hands the
//! materialized notification to a registered [`ScheduleSink`]. Recurring
//! entries are evaluated with the `cron` crate; standard 5-field
//! expressions are accepted by prepending a seconds field. An hourly sweep
//! removes terminal entries after a retention window.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_common::config::EngineConfig;
use courier_common::error::EngineError;
use courier_common::types::Notification;

/// Receives due notifications from the scheduler loop.
#[async_trait]
pub trait ScheduleSink: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneOffStatus {
    Scheduled,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurringStatus {
    Active,
    Expired,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub enum EntryKind {
    OneOff {
        run_at: DateTime<Utc>,
        status: OneOffStatus,
    },
    Recurring {
        expression: String,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        status: RecurringStatus,
    },
}

/// A registered future dispatch, one-off or recurring.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub notification: Notification,
    pub kind: EntryKind,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            EntryKind::OneOff { status, .. } => matches!(
                status,
                OneOffStatus::Completed | OneOffStatus::Failed | OneOffStatus::Cancelled
            ),
            EntryKind::Recurring { status, .. } => matches!(
                status,
                RecurringStatus::Expired | RecurringStatus::Cancelled | RecurringStatus::Failed
            ),
        }
    }
}

/// Parse a cron expression, accepting the standard 5-field form by
/// prepending a `0` seconds field (the `cron` crate evaluates 6/7-field
/// expressions).
fn parse_cron(expression: &str) -> Result<Schedule, EngineError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| {
        EngineError::Validation(format!("invalid cron expression '{}': {}", trimmed, e))
    })
}

pub struct Scheduler {
    entries: RwLock<HashMap<Uuid, ScheduleEntry>>,
    running: AtomicBool,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    tick: Duration,
    sweep_interval: Duration,
    retention: chrono::Duration,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            handles: parking_lot::Mutex::new(Vec::new()),
            tick: Duration::from_millis(config.scheduler_tick_ms),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            retention: chrono::Duration::days(config.schedule_retention_days),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a one-off dispatch at `run_at`.
    pub async fn schedule_one_off(&self, notification: Notification, run_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let entry = ScheduleEntry {
            id,
            notification,
            kind: EntryKind::OneOff {
                run_at,
                status: OneOffStatus::Scheduled,
            },
            next_run: Some(run_at),
            last_run: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.entries.write().await.insert(id, entry);
        tracing::info!(schedule_id = %id, run_at = %run_at, "One-off schedule registered");
        id
    }

    /// Register a recurring dispatch. The expression is validated here;
    /// 5-field cron is accepted. Returns the schedule id.
    pub async fn schedule_recurring(
        &self,
        notification: Notification,
        expression: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Uuid, EngineError> {
        let schedule = parse_cron(expression)?;
        let now = Utc::now();
        let from = match start {
            Some(start) if start > now => start,
            _ => now,
        };
        let next_run = schedule.after(&from).next();

        let status = match (next_run, end) {
            (Some(next), Some(end)) if next > end => RecurringStatus::Expired,
            (None, _) => RecurringStatus::Expired,
            _ => RecurringStatus::Active,
        };

        let id = Uuid::new_v4();
        let entry = ScheduleEntry {
            id,
            notification,
            kind: EntryKind::Recurring {
                expression: expression.trim().to_string(),
                start,
                end,
                status,
            },
            next_run,
            last_run: None,
            created_at: now,
            finished_at: None,
        };
        self.entries.write().await.insert(id, entry);
        tracing::info!(
            schedule_id = %id,
            expression = expression.trim(),
            "Recurring schedule registered"
        );
        Ok(id)
    }

    /// Cancel a schedule. Only Scheduled one-offs and Active recurring
    /// entries can be cancelled; unknown, in-flight, or terminal entries
    /// return false.
    pub async fn cancel(&self, schedule_id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&schedule_id) else {
            tracing::debug!(schedule_id = %schedule_id, "Cancel requested for unknown schedule");
            return false;
        };

        let cancelled = match &mut entry.kind {
            EntryKind::OneOff { status, .. } if *status == OneOffStatus::Scheduled => {
                *status = OneOffStatus::Cancelled;
                true
            }
            EntryKind::Recurring { status, .. } if *status == RecurringStatus::Active => {
                *status = RecurringStatus::Cancelled;
                true
            }
            _ => false,
        };

        if cancelled {
            entry.finished_at = Some(Utc::now());
            entry.next_run = None;
            tracing::info!(schedule_id = %schedule_id, "Schedule cancelled");
        }
        cancelled
    }

    pub async fn get(&self, schedule_id: Uuid) -> Option<ScheduleEntry> {
        self.entries.read().await.get(&schedule_id).cloned()
    }

    /// Start the tick and sweep loops, dispatching due entries to `sink`.
    pub fn start(self: Arc<Self>, sink: Arc<dyn ScheduleSink>) {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("Scheduler already running");
            return;
        }

        let mut handles = self.handles.lock();

        {
            let scheduler = Arc::clone(&self);
            let sink = sink.clone();
            let shutdown = self.shutdown.clone();
            let tick = self.tick;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            scheduler.process_due(Utc::now(), sink.as_ref()).await;
                        }
                    }
                }
                tracing::debug!("Scheduler tick loop stopped");
            }));
        }

        {
            let scheduler = Arc::clone(&self);
            let shutdown = self.shutdown.clone();
            let sweep_interval = self.sweep_interval;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            scheduler.sweep(Utc::now()).await;
                        }
                    }
                }
                tracing::debug!("Scheduler sweep loop stopped");
            }));
        }

        tracing::info!("Scheduler started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.cancel();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        tracing::info!("Scheduler stopped");
    }

    /// Dispatch every entry due at `now`. The tick loop calls this each
    /// tick; embedders controlling time may call it directly.
    pub async fn process_due(&self, now: DateTime<Utc>, sink: &dyn ScheduleSink) {
        let due: Vec<Uuid> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|entry| Self::is_due(entry, now))
                .map(|entry| entry.id)
                .collect()
        };

        for id in due {
            self.fire(id, now, sink).await;
        }
    }

    fn is_due(entry: &ScheduleEntry, now: DateTime<Utc>) -> bool {
        match &entry.kind {
            EntryKind::OneOff { run_at, status } => {
                *status == OneOffStatus::Scheduled && *run_at <= now
            }
            EntryKind::Recurring { status, start, .. } => {
                *status == RecurringStatus::Active
                    && start.is_none_or(|s| s <= now)
                    && entry.next_run.is_some_and(|next| next <= now)
            }
        }
    }

    async fn fire(&self, id: Uuid, now: DateTime<Utc>, sink: &dyn ScheduleSink) {
        // Transition under the write lock, dispatch outside it.
        let notification = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            if !Self::is_due(entry, now) {
                return;
            }

            match &mut entry.kind {
                EntryKind::OneOff { status, .. } => {
                    *status = OneOffStatus::Processing;
                    entry.last_run = Some(now);
                    entry.next_run = None;
                    entry.notification.clone()
                }
                EntryKind::Recurring {
                    expression,
                    end,
                    status,
                    ..
                } => {
                    entry.last_run = Some(now);
                    match parse_cron(expression) {
                        Ok(schedule) => {
                            let next = schedule.after(&now).next();
                            entry.next_run = next;
                            match (next, *end) {
                                (Some(next), Some(end)) if next > end => {
                                    *status = RecurringStatus::Expired;
                                    entry.finished_at = Some(now);
                                }
                                (None, _) => {
                                    *status = RecurringStatus::Expired;
                                    entry.finished_at = Some(now);
                                }
                                _ => {}
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                schedule_id = %id,
                                error = %e,
                                "Recurrence evaluation failed"
                            );
                            *status = RecurringStatus::Failed;
                            entry.finished_at = Some(now);
                            entry.next_run = None;
                        }
                    }
                    // Each firing materializes a fresh notification.
                    let mut notification = entry.notification.clone();
                    notification.id = Uuid::new_v4();
                    notification.created_at = now;
                    notification.scheduled_at = None;
                    notification
                }
            }
        };

        let result = sink.dispatch(notification).await;

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        match &mut entry.kind {
            EntryKind::OneOff { status, .. } => {
                *status = match &result {
                    Ok(()) => OneOffStatus::Completed,
                    Err(_) => OneOffStatus::Failed,
                };
                entry.finished_at = Some(Utc::now());
                match result {
                    Ok(()) => tracing::info!(schedule_id = %id, "One-off schedule completed"),
                    Err(e) => {
                        tracing::warn!(schedule_id = %id, error = %e, "Scheduled dispatch failed")
                    }
                }
            }
            EntryKind::Recurring { .. } => {
                if let Err(e) = result {
                    // The entry stays Active; the next occurrence still runs.
                    tracing::warn!(schedule_id = %id, error = %e, "Recurring dispatch failed");
                }
            }
        }
    }

    /// Remove terminal entries older than the retention window.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            !entry.is_terminal() || entry.finished_at.unwrap_or(entry.created_at) > cutoff
        });
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(removed, "Swept terminal schedule entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::{ChannelKind, NotificationType};
    use parking_lot::Mutex;

    struct RecordingSink {
        dispatched: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dispatched: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.dispatched.lock().len()
        }
    }

    #[async_trait]
    impl ScheduleSink for RecordingSink {
        async fn dispatch(&self, notification: Notification) -> Result<(), EngineError> {
            self.dispatched.lock().push(notification);
            Ok(())
        }
    }

    fn make_scheduler() -> Scheduler {
        Scheduler::new(&EngineConfig::default())
    }

    fn make_notification() -> Notification {
        Notification::new(
            "user-1",
            NotificationType::PortfolioReport,
            "Daily report",
            "Your portfolio summary is ready",
            vec![ChannelKind::Email],
        )
    }

    #[test]
    fn test_parse_cron_accepts_five_fields() {
        assert!(parse_cron("0 * * * *").is_ok());
        assert!(parse_cron("0 0 * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
        // 6-field form passes through unchanged.
        assert!(parse_cron("0 0 0 * * *").is_ok());
    }

    #[test]
    fn test_parse_cron_rejects_garbage() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("99 * * * *").is_err());
    }

    #[tokio::test]
    async fn test_one_off_fires_once_when_due() {
        let scheduler = make_scheduler();
        let sink = RecordingSink::new();
        let now = Utc::now();

        let id = scheduler
            .schedule_one_off(make_notification(), now - chrono::Duration::seconds(1))
            .await;

        scheduler.process_due(now, sink.as_ref()).await;
        assert_eq!(sink.count(), 1);

        let entry = scheduler.get(id).await.unwrap();
        assert!(matches!(
            entry.kind,
            EntryKind::OneOff {
                status: OneOffStatus::Completed,
                ..
            }
        ));

        // A second pass does not re-fire a completed entry.
        scheduler.process_due(now, sink.as_ref()).await;
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_one_off_not_due_does_not_fire() {
        let scheduler = make_scheduler();
        let sink = RecordingSink::new();
        let now = Utc::now();

        scheduler
            .schedule_one_off(make_notification(), now + chrono::Duration::hours(1))
            .await;
        scheduler.process_due(now, sink.as_ref()).await;
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_due_prevents_dispatch() {
        let scheduler = make_scheduler();
        let sink = RecordingSink::new();
        let now = Utc::now();

        let id = scheduler
            .schedule_one_off(make_notification(), now + chrono::Duration::hours(1))
            .await;

        assert!(scheduler.cancel(id).await);
        // Cancelling again is a no-op returning false.
        assert!(!scheduler.cancel(id).await);

        scheduler
            .process_due(now + chrono::Duration::hours(2), sink.as_ref())
            .await;
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_returns_false() {
        let scheduler = make_scheduler();
        assert!(!scheduler.cancel(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_recurring_daily_fires_once_per_day() {
        let scheduler = make_scheduler();
        let sink = RecordingSink::new();

        let id = scheduler
            .schedule_recurring(make_notification(), "0 0 * * *", None, None)
            .await
            .unwrap();

        // Walk a synthetic timeline: the first scan after next_run fires,
        // a re-scan at the same instant does not, the next day fires again.
        let first_run = scheduler.get(id).await.unwrap().next_run.unwrap();
        let t1 = first_run + chrono::Duration::seconds(30);
        scheduler.process_due(t1, sink.as_ref()).await;
        assert_eq!(sink.count(), 1);

        scheduler.process_due(t1, sink.as_ref()).await;
        assert_eq!(sink.count(), 1);

        let t2 = t1 + chrono::Duration::days(1);
        scheduler.process_due(t2, sink.as_ref()).await;
        assert_eq!(sink.count(), 2);

        let entry = scheduler.get(id).await.unwrap();
        assert!(matches!(
            entry.kind,
            EntryKind::Recurring {
                status: RecurringStatus::Active,
                ..
            }
        ));
        assert_eq!(entry.last_run, Some(t2));
    }

    #[tokio::test]
    async fn test_recurring_fires_materialize_fresh_notifications() {
        let scheduler = make_scheduler();
        let sink = RecordingSink::new();
        let template = make_notification();
        let template_id = template.id;

        let id = scheduler
            .schedule_recurring(template, "0 * * * *", None, None)
            .await
            .unwrap();

        let due = scheduler.get(id).await.unwrap().next_run.unwrap();
        scheduler.process_due(due, sink.as_ref()).await;

        let dispatched = sink.dispatched.lock();
        assert_eq!(dispatched.len(), 1);
        assert_ne!(dispatched[0].id, template_id);
        assert!(dispatched[0].scheduled_at.is_none());
    }

    #[tokio::test]
    async fn test_recurring_expires_past_end_date() {
        let scheduler = make_scheduler();
        let sink = RecordingSink::new();

        let id = scheduler
            .schedule_recurring(
                make_notification(),
                "0 0 * * *",
                None,
                // End right after the first occurrence.
                Some(Utc::now() + chrono::Duration::days(1)),
            )
            .await
            .unwrap();

        let due = scheduler.get(id).await.unwrap().next_run.unwrap();
        scheduler.process_due(due, sink.as_ref()).await;
        assert_eq!(sink.count(), 1);

        let entry = scheduler.get(id).await.unwrap();
        assert!(matches!(
            entry.kind,
            EntryKind::Recurring {
                status: RecurringStatus::Expired,
                ..
            }
        ));

        // Expired entries never fire again.
        scheduler
            .process_due(due + chrono::Duration::days(2), sink.as_ref())
            .await;
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_expression_rejected() {
        let scheduler = make_scheduler();
        let result = scheduler
            .schedule_recurring(make_notification(), "every day at noon", None, None)
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sweep_removes_old_terminal_entries() {
        let scheduler = make_scheduler();
        let sink = RecordingSink::new();
        let now = Utc::now();

        let done = scheduler
            .schedule_one_off(make_notification(), now - chrono::Duration::seconds(1))
            .await;
        let pending = scheduler
            .schedule_one_off(make_notification(), now + chrono::Duration::hours(1))
            .await;
        scheduler.process_due(now, sink.as_ref()).await;

        // Inside the retention window both entries survive.
        scheduler.sweep(now).await;
        assert!(scheduler.get(done).await.is_some());

        // Past the window the completed entry is swept, the pending one kept.
        scheduler.sweep(now + chrono::Duration::days(8)).await;
        assert!(scheduler.get(done).await.is_none());
        assert!(scheduler.get(pending).await.is_some());
    }
}
