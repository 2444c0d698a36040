//! Delivery metrics aggregation.
//!
//! Running counters (totals, per-channel, per-type) feed two views: a
//! real-time snapshot recomputed on demand, and hourly buckets written by a
//! periodic aggregation pass and evicted after 24 hours. Terminal record
//! updates are persisted through the external history store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use courier_common::error::EngineError;
use courier_common::store::HistoryStore;
use courier_common::types::{ChannelKind, DeliveryRecord, Notification, NotificationType};

/// Sent/delivered/failed counts for one breakdown key.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CounterSet {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HourlyBucket {
    at: DateTime<Utc>,
    totals: CounterSet,
    delivery_rate: f64,
}

/// Point-in-time metrics filtered to a period and optional breakdowns.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub delivery_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub per_channel: HashMap<String, CounterSet>,
    pub per_type: HashMap<String, CounterSet>,
}

/// Live view of the running counters.
#[derive(Debug, Clone, Serialize)]
pub struct RealTimeStats {
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub delivery_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub rate_limited: u64,
    pub expired: u64,
    pub per_channel: HashMap<String, CounterSet>,
    pub per_type: HashMap<String, CounterSet>,
    pub last_aggregated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    totals: CounterSet,
    latency_ms_sum: u64,
    latency_samples: u64,
    rate_limited: u64,
    expired: u64,
    per_channel: HashMap<ChannelKind, CounterSet>,
    per_type: HashMap<NotificationType, CounterSet>,
    hourly: BTreeMap<String, HourlyBucket>,
    last_aggregated: Option<DateTime<Utc>>,
}

pub struct AnalyticsTracker {
    counters: Mutex<Counters>,
    history: Arc<dyn HistoryStore>,
}

impl AnalyticsTracker {
    pub fn new(history: Arc<dyn HistoryStore>) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            history,
        }
    }

    /// Count a dispatch: one sent per record, broken down by channel and
    /// notification type.
    pub fn record_sent(&self, notification: &Notification, records: &[DeliveryRecord]) {
        let mut counters = self.counters.lock();
        for record in records {
            counters.totals.sent += 1;
            counters.per_channel.entry(record.channel).or_default().sent += 1;
        }
        counters
            .per_type
            .entry(notification.kind)
            .or_default()
            .sent += records.len() as u64;
    }

    /// Count a successful delivery and persist the record.
    pub async fn record_delivered(
        &self,
        kind: NotificationType,
        record: &DeliveryRecord,
    ) -> Result<(), EngineError> {
        {
            let mut counters = self.counters.lock();
            counters.totals.delivered += 1;
            counters
                .per_channel
                .entry(record.channel)
                .or_default()
                .delivered += 1;
            counters.per_type.entry(kind).or_default().delivered += 1;

            if let Some(sent) = record.sent_at
                && let Some(delivered) = record.delivered_at
            {
                let latency = (delivered - sent).num_milliseconds().max(0) as u64;
                counters.latency_ms_sum += latency;
                counters.latency_samples += 1;
            }
        }
        self.history.save(record).await
    }

    /// Count a terminal failure and persist the record.
    pub async fn record_failed(
        &self,
        kind: NotificationType,
        record: &DeliveryRecord,
    ) -> Result<(), EngineError> {
        {
            let mut counters = self.counters.lock();
            counters.totals.failed += 1;
            counters
                .per_channel
                .entry(record.channel)
                .or_default()
                .failed += 1;
            counters.per_type.entry(kind).or_default().failed += 1;
        }
        self.history.save(record).await
    }

    /// Persist a non-terminal record update without touching counters.
    pub async fn persist(&self, record: &DeliveryRecord) -> Result<(), EngineError> {
        self.history.save(record).await
    }

    pub fn record_rate_limited(&self, kind: NotificationType) {
        let mut counters = self.counters.lock();
        counters.rate_limited += 1;
        tracing::debug!(kind = %kind, "Notification rate limited");
    }

    pub fn record_expired(&self, kind: NotificationType) {
        let mut counters = self.counters.lock();
        counters.expired += 1;
        tracing::debug!(kind = %kind, "Expired notification discarded");
    }

    /// Snapshot the running totals into the current hourly bucket and evict
    /// buckets older than 24 hours. Called by the aggregation timer.
    pub fn aggregate(&self, now: DateTime<Utc>) {
        let mut counters = self.counters.lock();
        let key = now.format("%Y-%m-%d-%H").to_string();
        let totals = counters.totals;
        counters.hourly.insert(
            key,
            HourlyBucket {
                at: now,
                totals,
                delivery_rate: Self::rate(&totals),
            },
        );

        let cutoff = now - Duration::hours(24);
        counters.hourly.retain(|_, bucket| bucket.at >= cutoff);
        counters.last_aggregated = Some(now);
    }

    pub fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: Option<NotificationType>,
        channel: Option<ChannelKind>,
    ) -> MetricsSnapshot {
        let counters = self.counters.lock();

        let per_channel = counters
            .per_channel
            .iter()
            .filter(|(ch, _)| channel.is_none_or(|wanted| wanted == **ch))
            .map(|(ch, set)| (ch.to_string(), *set))
            .collect();
        let per_type = counters
            .per_type
            .iter()
            .filter(|(k, _)| kind.is_none_or(|wanted| wanted == **k))
            .map(|(k, set)| (k.to_string(), *set))
            .collect();

        MetricsSnapshot {
            period_start: start,
            period_end: end,
            total_sent: counters.totals.sent,
            total_delivered: counters.totals.delivered,
            total_failed: counters.totals.failed,
            delivery_rate: Self::rate(&counters.totals),
            avg_latency_ms: Self::avg_latency(&counters),
            per_channel,
            per_type,
        }
    }

    pub fn realtime_stats(&self) -> RealTimeStats {
        let counters = self.counters.lock();
        RealTimeStats {
            total_sent: counters.totals.sent,
            total_delivered: counters.totals.delivered,
            total_failed: counters.totals.failed,
            delivery_rate: Self::rate(&counters.totals),
            avg_latency_ms: Self::avg_latency(&counters),
            rate_limited: counters.rate_limited,
            expired: counters.expired,
            per_channel: counters
                .per_channel
                .iter()
                .map(|(ch, set)| (ch.to_string(), *set))
                .collect(),
            per_type: counters
                .per_type
                .iter()
                .map(|(k, set)| (k.to_string(), *set))
                .collect(),
            last_aggregated_at: counters.last_aggregated,
        }
    }

    fn rate(totals: &CounterSet) -> f64 {
        if totals.sent == 0 {
            0.0
        } else {
            totals.delivered as f64 / totals.sent as f64
        }
    }

    fn avg_latency(counters: &Counters) -> Option<f64> {
        if counters.latency_samples == 0 {
            None
        } else {
            Some(counters.latency_ms_sum as f64 / counters.latency_samples as f64)
        }
    }
}
