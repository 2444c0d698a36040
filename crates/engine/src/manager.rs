//! Orchestration layer over the engine components.
//!
//! For each send: resolve the preference, filter channels (enabled flag,
//! quiet hours, priority threshold, channel intersection), then either defer
//! to the scheduler or submit to the delivery engine. This is the surface an
//! API layer wraps; it never errors for partial channel failure, only for
//! notification-level validation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_channels::ChannelRegistry;
use courier_common::config::EngineConfig;
use courier_common::error::EngineError;
use courier_common::store::{HistoryStore, PreferenceBacking, TemplateRenderer};
use courier_common::types::{
    ChannelKind, DeliveryRecord, DeliveryStatus, Notification, NotificationType,
};

use crate::analytics::{AnalyticsTracker, MetricsSnapshot, RealTimeStats};
use crate::delivery::{DeliveryEngine, DispatchJob};
use crate::preferences::PreferenceStore;
use crate::scheduler::{ScheduleSink, Scheduler};

/// Aggregated delivery state for one notification.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub delivered: usize,
    pub failed: usize,
    /// Pending or retrying.
    pub pending: usize,
    pub cancelled: usize,
    pub per_channel: HashMap<String, DeliveryStatus>,
}

impl StatusSummary {
    fn from_records(records: &[DeliveryRecord]) -> Self {
        let mut summary = Self {
            delivered: 0,
            failed: 0,
            pending: 0,
            cancelled: 0,
            per_channel: HashMap::new(),
        };
        // Later entries win, so iteration order gives the latest record
        // per channel.
        let mut latest: HashMap<ChannelKind, DeliveryStatus> = HashMap::new();
        for record in records {
            latest.insert(record.channel, record.status);
        }
        for (channel, status) in latest {
            match status {
                DeliveryStatus::Delivered => summary.delivered += 1,
                DeliveryStatus::Failed => summary.failed += 1,
                DeliveryStatus::Pending | DeliveryStatus::Retrying => summary.pending += 1,
                DeliveryStatus::Cancelled => summary.cancelled += 1,
            }
            summary.per_channel.insert(channel.to_string(), status);
        }
        summary
    }
}

struct Inner {
    config: EngineConfig,
    preferences: PreferenceStore,
    engine: DeliveryEngine,
    scheduler: Arc<Scheduler>,
    analytics: Arc<AnalyticsTracker>,
    renderer: Option<Arc<dyn TemplateRenderer>>,
    history: Arc<dyn HistoryStore>,
    shutdown: CancellationToken,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct NotificationManager {
    inner: Arc<Inner>,
}

impl NotificationManager {
    pub fn new(
        config: EngineConfig,
        registry: ChannelRegistry,
        backing: Arc<dyn PreferenceBacking>,
        history: Arc<dyn HistoryStore>,
        renderer: Option<Arc<dyn TemplateRenderer>>,
    ) -> Self {
        let analytics = Arc::new(AnalyticsTracker::new(history.clone()));
        let engine = DeliveryEngine::new(registry, analytics.clone(), &config);
        let scheduler = Arc::new(Scheduler::new(&config));
        let preferences =
            PreferenceStore::new(backing, Duration::from_secs(config.preference_ttl_secs));

        Self {
            inner: Arc::new(Inner {
                config,
                preferences,
                engine,
                scheduler,
                analytics,
                renderer,
                history,
                shutdown: CancellationToken::new(),
                handles: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the delivery workers, scheduler loops, and aggregation timer.
    pub fn start(&self) {
        self.inner.engine.start();
        self.inner
            .scheduler
            .clone()
            .start(Arc::new(self.clone()) as Arc<dyn ScheduleSink>);

        let analytics = self.inner.analytics.clone();
        let shutdown = self.inner.shutdown.clone();
        let interval = Duration::from_secs(self.inner.config.aggregate_interval_secs);
        self.inner.handles.lock().push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => analytics.aggregate(Utc::now()),
                }
            }
            tracing::debug!("Aggregation loop stopped");
        }));

        tracing::info!("Notification manager started");
    }

    /// Stop accepting work, let in-flight deliveries finish or time out,
    /// then terminate all background tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.scheduler.stop();
        self.inner.engine.shutdown().await;
        for handle in self.inner.handles.lock().drain(..) {
            handle.abort();
        }
        tracing::info!("Notification manager stopped");
    }

    /// Send (or defer) one notification.
    ///
    /// Returns the Pending records created for the allowed channels;
    /// delivery completes asynchronously on the worker pool. An empty list
    /// means every channel was filtered out, which is a no-op, not an error.
    pub async fn send(
        &self,
        notification: Notification,
    ) -> Result<Vec<DeliveryRecord>, EngineError> {
        notification.validate()?;
        let now = Utc::now();
        if notification.is_expired(now) {
            return Err(EngineError::Validation(
                "notification is already expired".into(),
            ));
        }

        let preference = self
            .inner
            .preferences
            .get(&notification.user_id, notification.kind)
            .await?;

        if !preference.enabled {
            tracing::debug!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                "Notifications disabled for user, skipping"
            );
            return Ok(Vec::new());
        }
        if preference.in_quiet_hours(now) {
            tracing::debug!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                "Suppressed by quiet hours"
            );
            return Ok(Vec::new());
        }
        if let Some(min) = preference.min_priority
            && notification.priority < min
        {
            tracing::debug!(
                notification_id = %notification.id,
                priority = %notification.priority,
                threshold = %min,
                "Below priority threshold, skipping"
            );
            return Ok(Vec::new());
        }

        let allowed: Vec<ChannelKind> = notification
            .channels
            .iter()
            .copied()
            .filter(|channel| preference.allows_channel(*channel))
            .collect();
        if allowed.is_empty() {
            tracing::debug!(
                notification_id = %notification.id,
                "No requested channel allowed by preference"
            );
            return Ok(Vec::new());
        }

        self.inner.history.save_notification(&notification).await?;

        if let Some(at) = notification.scheduled_at
            && at > now
        {
            let records = self.inner.engine.register_records(&notification, &allowed);
            let schedule_id = self.inner.scheduler.schedule_one_off(notification, at).await;
            tracing::info!(schedule_id = %schedule_id, "Notification deferred to scheduler");
            return Ok(records);
        }

        let notification = self.render(notification).await?;
        let records = self.inner.engine.register_records(&notification, &allowed);
        self.inner
            .engine
            .submit(DispatchJob {
                notification,
                channels: allowed,
                preference,
            })
            .await?;
        Ok(records)
    }

    /// Send a batch in fixed-size chunks with a pause between chunks.
    /// Per-notification failures are logged and skipped; they never fail
    /// the batch.
    pub async fn send_bulk(
        &self,
        notifications: Vec<Notification>,
    ) -> HashMap<Uuid, Vec<DeliveryRecord>> {
        let total = notifications.len();
        let batch_size = self.inner.config.batch_size.max(1);
        let pause = Duration::from_millis(self.inner.config.batch_pause_ms);
        let mut results = HashMap::with_capacity(total);

        for (index, batch) in notifications.chunks(batch_size).enumerate() {
            if index > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            for notification in batch {
                let id = notification.id;
                match self.send(notification.clone()).await {
                    Ok(records) => {
                        results.insert(id, records);
                    }
                    Err(e) => {
                        tracing::warn!(notification_id = %id, error = %e, "Bulk send item failed");
                    }
                }
            }
        }

        tracing::info!(total, accepted = results.len(), "Bulk send processed");
        results
    }

    /// Re-submit notifications whose most recent record in the window is
    /// Failed. Returns the number re-dispatched.
    pub async fn retry_failed(
        &self,
        notification_id: Option<Uuid>,
        hours_back: i64,
    ) -> Result<usize, EngineError> {
        let failed = self
            .inner
            .history
            .load_failed(notification_id, hours_back)
            .await?;
        let mut resubmitted = 0;

        for mut notification in failed {
            // Retries dispatch immediately, whatever the original schedule.
            notification.scheduled_at = None;
            let id = notification.id;
            match self.send(notification).await {
                Ok(records) if !records.is_empty() => resubmitted += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(notification_id = %id, error = %e, "Retry dispatch failed");
                }
            }
        }

        tracing::info!(count = resubmitted, "Failed notifications re-submitted");
        Ok(resubmitted)
    }

    /// Latest known delivery state per channel.
    pub async fn status(&self, notification_id: Uuid) -> StatusSummary {
        let mut records = self.inner.engine.records_for(notification_id);
        if records.is_empty() {
            records = self
                .inner
                .history
                .load(notification_id)
                .await
                .unwrap_or_default();
        }
        StatusSummary::from_records(&records)
    }

    /// Defer a notification to a fixed time. Returns the schedule id.
    pub async fn schedule(
        &self,
        notification: Notification,
        at: DateTime<Utc>,
    ) -> Result<Uuid, EngineError> {
        let notification = notification.with_schedule(at);
        notification.validate()?;
        self.inner.history.save_notification(&notification).await?;
        Ok(self.inner.scheduler.schedule_one_off(notification, at).await)
    }

    /// Register a recurring dispatch from a 5-field cron expression.
    pub async fn schedule_recurring(
        &self,
        notification: Notification,
        expression: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Uuid, EngineError> {
        notification.validate()?;
        self.inner
            .scheduler
            .schedule_recurring(notification, expression, start, end)
            .await
    }

    /// Cancel a schedule, releasing any Pending records it created.
    /// Returns false for unknown, in-flight, or already-terminal schedules.
    pub async fn cancel(&self, schedule_id: Uuid) -> bool {
        if !self.inner.scheduler.cancel(schedule_id).await {
            return false;
        }
        if let Some(entry) = self.inner.scheduler.get(schedule_id).await {
            let released = self
                .inner
                .engine
                .cancel_pending(entry.notification.id)
                .await;
            if released > 0 {
                tracing::debug!(
                    schedule_id = %schedule_id,
                    released,
                    "Cancelled pending records for schedule"
                );
            }
        }
        true
    }

    pub fn stats(&self) -> RealTimeStats {
        self.inner.analytics.realtime_stats()
    }

    pub fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: Option<NotificationType>,
        channel: Option<ChannelKind>,
    ) -> MetricsSnapshot {
        self.inner.analytics.metrics(start, end, kind, channel)
    }

    /// Preference management surface (set/update/delete/reset).
    pub fn preferences(&self) -> &PreferenceStore {
        &self.inner.preferences
    }

    async fn render(&self, mut notification: Notification) -> Result<Notification, EngineError> {
        if let Some(template_id) = notification.template_id.clone()
            && let Some(renderer) = self.inner.renderer.as_ref()
        {
            let data = notification
                .template_data
                .clone()
                .unwrap_or_else(|| serde_json::json!({}));
            let (title, body) = renderer.render(&template_id, &data).await?;
            notification.title = title;
            notification.body = body;
        }
        Ok(notification)
    }
}

#[async_trait]
impl ScheduleSink for NotificationManager {
    async fn dispatch(&self, notification: Notification) -> Result<(), EngineError> {
        let id = notification.id;
        let records = self.send(notification).await?;
        if records.is_empty() {
            // Preferences changed between scheduling and firing; release the
            // records registered at schedule time.
            self.inner.engine.cancel_pending(id).await;
        }
        Ok(())
    }
}
