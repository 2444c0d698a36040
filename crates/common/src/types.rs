use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Delivery channel variants.
///
/// Adding a channel means adding a variant here and registering an
/// implementation; dispatch logic stays untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
    Webhook,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Sms => write!(f, "sms"),
            ChannelKind::Push => write!(f, "push"),
            ChannelKind::Webhook => write!(f, "webhook"),
        }
    }
}

/// Closed set of notification categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    TradingAlert,
    PriceAlert,
    RiskWarning,
    SystemMaintenance,
    AccountUpdate,
    SecurityAlert,
    MarketAnalysis,
    PortfolioReport,
    Custom,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::TradingAlert => write!(f, "trading_alert"),
            NotificationType::PriceAlert => write!(f, "price_alert"),
            NotificationType::RiskWarning => write!(f, "risk_warning"),
            NotificationType::SystemMaintenance => write!(f, "system_maintenance"),
            NotificationType::AccountUpdate => write!(f, "account_update"),
            NotificationType::SecurityAlert => write!(f, "security_alert"),
            NotificationType::MarketAnalysis => write!(f, "market_analysis"),
            NotificationType::PortfolioReport => write!(f, "portfolio_report"),
            NotificationType::Custom => write!(f, "custom"),
        }
    }
}

/// Notification priority. Variant order is the comparison order, so
/// `Priority::Low < Priority::Critical` holds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Per-notification retry configuration bounding attempt count and
/// backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt. Valid range [0, 10].
    pub max_retries: u32,
    /// Base delay before the first retry, in seconds. Valid range [1, 3600].
    pub retry_delay_secs: u64,
    /// Exponential growth factor per attempt. Valid range [1.0, 10.0].
    pub backoff_multiplier: f64,
    /// Hard cap on any computed delay, in seconds. Valid range [60, 86400].
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 60,
            backoff_multiplier: 2.0,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Return a copy with every field forced into its valid range.
    pub fn clamped(self) -> Self {
        Self {
            max_retries: self.max_retries.min(10),
            retry_delay_secs: self.retry_delay_secs.clamp(1, 3600),
            backoff_multiplier: self.backoff_multiplier.clamp(1.0, 10.0),
            max_delay_secs: self.max_delay_secs.clamp(60, 86_400),
        }
    }

    /// Backoff delay for a 0-indexed attempt:
    /// `min(retry_delay * multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.retry_delay_secs as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_secs as f64);
        Duration::from_secs_f64(capped)
    }
}

/// Immutable intent to deliver a message. Created by the caller, read-only
/// once handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub channels: Vec<ChannelKind>,
    pub template_id: Option<String>,
    pub template_data: Option<serde_json::Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_policy: Option<RetryPolicy>,
    /// Opaque per-notification data. Channel variants resolve recipient
    /// addresses from here (`email`, `phone`, `device_tokens`, `webhook_url`).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        kind: NotificationType,
        title: impl Into<String>,
        body: impl Into<String>,
        channels: Vec<ChannelKind>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            kind,
            title: title.into(),
            body: body.into(),
            priority: Priority::Normal,
            channels,
            template_id: None,
            template_data: None,
            scheduled_at: None,
            expires_at: None,
            retry_policy: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>, data: serde_json::Value) -> Self {
        self.template_id = Some(template_id.into());
        self.template_data = Some(data);
        self
    }

    pub fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy.clamped());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check the structural invariants: non-empty user/content/channels,
    /// and `expires_at` strictly after `scheduled_at` when both are set.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.user_id.is_empty() {
            return Err(EngineError::Validation("user_id cannot be empty".into()));
        }
        if self.title.is_empty() {
            return Err(EngineError::Validation("title cannot be empty".into()));
        }
        if self.body.is_empty() {
            return Err(EngineError::Validation("body cannot be empty".into()));
        }
        if self.channels.is_empty() {
            return Err(EngineError::Validation(
                "at least one channel is required".into(),
            ));
        }
        if let Some(expires) = self.expires_at
            && let Some(scheduled) = self.scheduled_at
            && expires <= scheduled
        {
            return Err(EngineError::Validation(
                "expires_at must be after scheduled_at".into(),
            ));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Delivery state for one (notification, channel) lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Retrying,
    Cancelled,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Retrying => write!(f, "retrying"),
            DeliveryStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Tracks one (notification, channel) delivery lineage through the attempt
/// state machine. Mutated only by the delivery engine; terminal states
/// (Delivered, Failed, Cancelled) are immutable once reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub user_id: String,
    pub channel: ChannelKind,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Timestamp of every attempt, in order.
    pub attempts: Vec<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl DeliveryRecord {
    pub fn new(notification: &Notification, channel: ChannelKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id: notification.id,
            user_id: notification.user_id.clone(),
            channel,
            status: DeliveryStatus::Pending,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            error_message: None,
            retry_count: 0,
            attempts: Vec::new(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Cancelled
        )
    }

    /// Record the start of an attempt. The first attempt stamps `sent_at`.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts.push(now);
        if self.sent_at.is_none() {
            self.sent_at = Some(now);
        }
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.status = DeliveryStatus::Delivered;
        self.delivered_at = Some(now);
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = DeliveryStatus::Failed;
        self.failed_at = Some(now);
        self.error_message = Some(error.into());
    }

    pub fn mark_retrying(&mut self) {
        if self.status == DeliveryStatus::Failed || self.status == DeliveryStatus::Pending {
            self.status = DeliveryStatus::Retrying;
        }
    }

    /// Cancel a record that never started dispatching. Returns false once
    /// any attempt has been made.
    pub fn mark_cancelled(&mut self) -> bool {
        if self.status == DeliveryStatus::Pending && self.attempts.is_empty() {
            self.status = DeliveryStatus::Cancelled;
            true
        } else {
            false
        }
    }
}

/// Outcome of a single `Channel::send` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub success: bool,
    /// Transport-assigned message id, when the transport reports one.
    pub message_id: Option<String>,
    pub error_message: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl DeliveryResult {
    pub fn delivered(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error_message: None,
            delivered_at: Some(Utc::now()),
            metadata: serde_json::json!({}),
        }
    }
}

/// Per-(user, notification type) delivery preference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub user_id: String,
    pub kind: NotificationType,
    /// Channels the user accepts for this notification type.
    pub channels: Vec<ChannelKind>,
    pub enabled: bool,
    /// Quiet-hours window, both-or-neither. Local to `timezone`.
    pub quiet_start: Option<NaiveTime>,
    pub quiet_end: Option<NaiveTime>,
    /// IANA timezone name the quiet-hours window is evaluated in.
    pub timezone: String,
    /// Maximum sends per hour for this (user, type), enforced by the
    /// delivery engine's rate limiter.
    pub max_per_hour: Option<u32>,
    /// Notifications below this priority are suppressed.
    pub min_priority: Option<Priority>,
}

impl Preference {
    pub fn new(user_id: impl Into<String>, kind: NotificationType) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            channels: vec![ChannelKind::Email],
            enabled: true,
            quiet_start: None,
            quiet_end: None,
            timezone: "UTC".to_string(),
            max_per_hour: None,
            min_priority: None,
        }
    }

    /// Built-in default preference for a notification type, used when the
    /// backing store has nothing for the user.
    pub fn default_for(user_id: &str, kind: NotificationType) -> Self {
        let base = Self::new(user_id, kind);
        match kind {
            NotificationType::TradingAlert => Self {
                channels: vec![ChannelKind::Email, ChannelKind::Push],
                max_per_hour: Some(10),
                ..base
            },
            NotificationType::RiskWarning => Self {
                channels: vec![ChannelKind::Email, ChannelKind::Sms, ChannelKind::Push],
                min_priority: Some(Priority::High),
                max_per_hour: Some(5),
                ..base
            },
            NotificationType::SecurityAlert => Self {
                channels: vec![ChannelKind::Email, ChannelKind::Sms, ChannelKind::Push],
                min_priority: Some(Priority::Critical),
                max_per_hour: Some(20),
                ..base
            },
            _ => base,
        }
    }

    pub fn with_quiet_hours(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.quiet_start = Some(start);
        self.quiet_end = Some(end);
        self
    }

    pub fn allows_channel(&self, channel: ChannelKind) -> bool {
        self.channels.contains(&channel)
    }

    /// Whether `now` falls inside the quiet-hours window `[start, end)` in
    /// the preference's timezone. Windows may cross midnight. An unknown
    /// timezone falls back to UTC.
    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (self.quiet_start, self.quiet_end) else {
            return false;
        };
        if start == end {
            return false;
        }
        let tz = chrono_tz::Tz::from_str(&self.timezone).unwrap_or_else(|_| {
            tracing::debug!(timezone = %self.timezone, "Unknown timezone, falling back to UTC");
            chrono_tz::UTC
        });
        let local = now.with_timezone(&tz).time();
        if start < end {
            local >= start && local < end
        } else {
            // Window crosses midnight, e.g. 22:00-07:00.
            local >= start || local < end
        }
    }
}
