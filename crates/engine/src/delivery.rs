//! Delivery engine: worker pool, retry queue, and the per-attempt state
//! machine.
//!
//! Submitted jobs land on a bounded queue consumed by N workers. Each worker
//! validates the notification, passes the rate limiter, then attempts every
//! allowed channel. Failed attempts eligible for retry are handed to a
//! single retry consumer which sleeps until the backoff delay elapses and
//! re-invokes the attempt. Per-(notification, channel) attempts are strictly
//! ordered; nothing is guaranteed across notifications or channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_channels::ChannelRegistry;
use courier_common::config::EngineConfig;
use courier_common::error::EngineError;
use courier_common::types::{ChannelKind, DeliveryRecord, Notification, Preference};

use crate::analytics::AnalyticsTracker;
use crate::ratelimit::RateLimiter;

/// How long a worker blocks on the queue before re-checking shutdown.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// One unit of dispatch work: a notification and the channels that survived
/// preference filtering, plus the resolved preference for channel sends and
/// the per-user rate limit.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub notification: Notification,
    pub channels: Vec<ChannelKind>,
    pub preference: Preference,
}

struct RetryJob {
    notification: Notification,
    preference: Preference,
    channel: ChannelKind,
    due_at: Instant,
}

struct Core {
    registry: ChannelRegistry,
    limiter: RateLimiter,
    analytics: Arc<AnalyticsTracker>,
    records: Mutex<HashMap<Uuid, HashMap<ChannelKind, DeliveryRecord>>>,
    retry_tx: mpsc::Sender<RetryJob>,
    send_timeout: Duration,
}

pub struct DeliveryEngine {
    core: Arc<Core>,
    work_tx: mpsc::Sender<DispatchJob>,
    work_rx: Mutex<Option<mpsc::Receiver<DispatchJob>>>,
    retry_rx: Mutex<Option<mpsc::Receiver<RetryJob>>>,
    worker_count: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DeliveryEngine {
    pub fn new(
        registry: ChannelRegistry,
        analytics: Arc<AnalyticsTracker>,
        config: &EngineConfig,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel(config.queue_capacity);
        let (retry_tx, retry_rx) = mpsc::channel(config.retry_queue_capacity);

        Self {
            core: Arc::new(Core {
                registry,
                limiter: RateLimiter::new(config),
                analytics,
                records: Mutex::new(HashMap::new()),
                retry_tx,
                send_timeout: Duration::from_secs(config.send_timeout_secs),
            }),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            retry_rx: Mutex::new(Some(retry_rx)),
            worker_count: config.worker_count,
            handles: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the worker pool and the retry consumer.
    pub fn start(&self) {
        let (Some(work_rx), Some(retry_rx)) =
            (self.work_rx.lock().take(), self.retry_rx.lock().take())
        else {
            tracing::warn!("Delivery engine already started");
            return;
        };

        let mut handles = self.handles.lock();
        let shared_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        for worker_id in 0..self.worker_count {
            let core = self.core.clone();
            let rx = shared_rx.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(Self::worker_loop(
                core, rx, shutdown, worker_id,
            )));
        }

        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(Self::retry_loop(core, retry_rx, shutdown)));

        tracing::info!(workers = self.worker_count, "Delivery engine started");
    }

    /// Enqueue a job for the worker pool.
    ///
    /// Non-blocking while the queue has capacity; once full this awaits a
    /// free slot (backpressure) rather than failing fast.
    pub async fn submit(&self, job: DispatchJob) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Internal("engine is shutting down".into()));
        }
        self.work_tx
            .send(job)
            .await
            .map_err(|_| EngineError::Internal("submission queue closed".into()))
    }

    /// Create Pending records for the given channels, keeping any existing
    /// non-terminal lineage and replacing terminal ones (a re-dispatch
    /// starts a fresh lineage).
    pub fn register_records(
        &self,
        notification: &Notification,
        channels: &[ChannelKind],
    ) -> Vec<DeliveryRecord> {
        let mut records = self.core.records.lock();
        let lineage = records.entry(notification.id).or_default();
        channels
            .iter()
            .map(|channel| {
                match lineage.get(channel) {
                    Some(existing) if !existing.is_terminal() => existing.clone(),
                    _ => {
                        let record = DeliveryRecord::new(notification, *channel);
                        lineage.insert(*channel, record.clone());
                        record
                    }
                }
            })
            .collect()
    }

    /// Latest known record per channel for a notification.
    pub fn records_for(&self, notification_id: Uuid) -> Vec<DeliveryRecord> {
        self.core
            .records
            .lock()
            .get(&notification_id)
            .map(|lineage| lineage.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancel every record of a notification that has not started
    /// dispatching. Returns the number of records cancelled.
    pub async fn cancel_pending(&self, notification_id: Uuid) -> usize {
        let cancelled: Vec<DeliveryRecord> = {
            let mut records = self.core.records.lock();
            records
                .get_mut(&notification_id)
                .map(|lineage| {
                    lineage
                        .values_mut()
                        .filter_map(|record| record.mark_cancelled().then(|| record.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        for record in &cancelled {
            if let Err(e) = self.core.analytics.persist(record).await {
                tracing::warn!(error = %e, "Failed to persist cancelled record");
            }
        }
        cancelled.len()
    }

    /// Stop accepting submissions, let in-flight attempts finish or time
    /// out, then join all workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock();
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Delivery engine stopped");
    }

    async fn worker_loop(
        core: Arc<Core>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DispatchJob>>>,
        shutdown: CancellationToken,
        worker_id: usize,
    ) {
        tracing::debug!(worker_id, "Delivery worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let job = {
                let mut rx = rx.lock().await;
                match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    // Timed out: loop to observe shutdown.
                    Err(_) => continue,
                }
            };
            Self::process_job(&core, job).await;
        }
        tracing::debug!(worker_id, "Delivery worker stopped");
    }

    async fn process_job(core: &Arc<Core>, job: DispatchJob) {
        let notification = &job.notification;
        let now = Utc::now();

        if let Err(e) = notification.validate() {
            tracing::warn!(
                notification_id = %notification.id,
                error = %e,
                "Invalid notification discarded"
            );
            Self::fail_all(core, &job, &e.to_string()).await;
            return;
        }

        // Expired notifications are discarded and counted, never retried.
        if notification.is_expired(now) {
            core.analytics.record_expired(notification.kind);
            Self::fail_all(core, &job, "notification expired before dispatch").await;
            return;
        }

        if core
            .limiter
            .check(
                &notification.user_id,
                notification.kind,
                &job.channels,
                job.preference.max_per_hour,
            )
            .is_err()
        {
            // Dropped for this cycle: records stay Pending, no retry, no
            // delivery failure.
            core.analytics.record_rate_limited(notification.kind);
            return;
        }

        let records: Vec<DeliveryRecord> = {
            let mut records = core.records.lock();
            let lineage = records.entry(notification.id).or_default();
            job.channels
                .iter()
                .map(|channel| {
                    lineage
                        .entry(*channel)
                        .or_insert_with(|| DeliveryRecord::new(notification, *channel))
                        .clone()
                })
                .collect()
        };
        core.analytics.record_sent(notification, &records);

        for channel in &job.channels {
            Self::attempt_delivery(core, notification, &job.preference, *channel).await;
        }
    }

    /// One delivery attempt for one channel. Updates the record, calls the
    /// channel under the send timeout, and schedules a retry when the
    /// failure is retryable and the policy allows another attempt.
    async fn attempt_delivery(
        core: &Arc<Core>,
        notification: &Notification,
        preference: &Preference,
        channel: ChannelKind,
    ) {
        let now = Utc::now();
        {
            let mut records = core.records.lock();
            let lineage = records.entry(notification.id).or_default();
            let record = lineage
                .entry(channel)
                .or_insert_with(|| DeliveryRecord::new(notification, channel));
            if record.is_terminal() {
                // Cancelled (or completed by an earlier retry) while queued.
                return;
            }
            record.begin_attempt(now);
        }

        let outcome = match core.registry.get(channel) {
            None => Err(EngineError::Config(format!(
                "channel {} not registered",
                channel
            ))),
            Some(ch) => {
                match tokio::time::timeout(core.send_timeout, ch.send(notification, preference))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout(core.send_timeout.as_secs())),
                }
            }
        };

        match outcome {
            Ok(result) if result.success => {
                let delivered_at = result.delivered_at.unwrap_or_else(Utc::now);
                let record = {
                    let mut records = core.records.lock();
                    let Some(record) = records
                        .get_mut(&notification.id)
                        .and_then(|l| l.get_mut(&channel))
                    else {
                        return;
                    };
                    record.mark_delivered(delivered_at);
                    record.metadata = result.metadata;
                    record.clone()
                };
                tracing::info!(
                    notification_id = %notification.id,
                    channel = %channel,
                    attempts = record.attempts.len(),
                    "Notification delivered"
                );
                if let Err(e) = core.analytics.record_delivered(notification.kind, &record).await {
                    tracing::warn!(error = %e, "Failed to persist delivered record");
                }
            }
            Ok(result) => {
                let error = result
                    .error_message
                    .unwrap_or_else(|| "delivery failed".to_string());
                Self::handle_failure(core, notification, preference, channel, error, true).await;
            }
            Err(e) => {
                let retryable = e.is_retryable();
                Self::handle_failure(core, notification, preference, channel, e.to_string(), retryable)
                    .await;
            }
        }
    }

    async fn handle_failure(
        core: &Arc<Core>,
        notification: &Notification,
        preference: &Preference,
        channel: ChannelKind,
        error: String,
        retryable: bool,
    ) {
        let now = Utc::now();
        let (record, retry_delay) = {
            let mut records = core.records.lock();
            let Some(record) = records
                .get_mut(&notification.id)
                .and_then(|l| l.get_mut(&channel))
            else {
                return;
            };
            record.mark_failed(now, error.as_str());

            let delay = notification
                .retry_policy
                .filter(|policy| retryable && record.retry_count < policy.max_retries)
                .map(|policy| policy.delay_for_attempt(record.retry_count));
            if delay.is_some() {
                record.mark_retrying();
            }
            (record.clone(), delay)
        };

        match retry_delay {
            Some(delay) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    channel = %channel,
                    retry_count = record.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Delivery failed, retry scheduled"
                );
                if let Err(e) = core.analytics.persist(&record).await {
                    tracing::warn!(error = %e, "Failed to persist retrying record");
                }
                let job = RetryJob {
                    notification: notification.clone(),
                    preference: preference.clone(),
                    channel,
                    due_at: Instant::now() + delay,
                };
                if core.retry_tx.send(job).await.is_err() {
                    tracing::warn!(
                        notification_id = %notification.id,
                        "Retry queue closed, dropping retry"
                    );
                }
            }
            None => {
                tracing::warn!(
                    notification_id = %notification.id,
                    channel = %channel,
                    attempts = record.attempts.len(),
                    error = %error,
                    "Delivery failed permanently"
                );
                if let Err(e) = core.analytics.record_failed(notification.kind, &record).await {
                    tracing::warn!(error = %e, "Failed to persist failed record");
                }
            }
        }
    }

    /// Single retry consumer: waits for each item's due time, bumps the
    /// retry count, and re-invokes the attempt. A retry is only ever
    /// enqueued after the previous attempt completed, which keeps
    /// per-(notification, channel) attempts strictly ordered.
    async fn retry_loop(
        core: Arc<Core>,
        mut rx: mpsc::Receiver<RetryJob>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!("Retry consumer started");
        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(job) => job,
                    None => break,
                },
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(job.due_at) => {}
            }

            {
                let mut records = core.records.lock();
                let Some(record) = records
                    .get_mut(&job.notification.id)
                    .and_then(|l| l.get_mut(&job.channel))
                else {
                    continue;
                };
                if record.is_terminal() {
                    continue;
                }
                record.retry_count += 1;
            }

            Self::attempt_delivery(&core, &job.notification, &job.preference, job.channel).await;
        }
        tracing::debug!("Retry consumer stopped");
    }

    async fn fail_all(core: &Arc<Core>, job: &DispatchJob, error: &str) {
        let failed: Vec<DeliveryRecord> = {
            let mut records = core.records.lock();
            let lineage = records.entry(job.notification.id).or_default();
            job.channels
                .iter()
                .map(|channel| {
                    let record = lineage
                        .entry(*channel)
                        .or_insert_with(|| DeliveryRecord::new(&job.notification, *channel));
                    record.mark_failed(Utc::now(), error);
                    record.clone()
                })
                .collect()
        };
        for record in &failed {
            if let Err(e) = core
                .analytics
                .record_failed(job.notification.kind, record)
                .await
            {
                tracing::warn!(error = %e, "Failed to persist failed record");
            }
        }
    }
}
