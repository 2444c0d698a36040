//! Notification delivery and scheduling engine.
//!
//! Pipeline: caller → [`manager::NotificationManager`] → preference filter →
//! immediate dispatch through [`delivery::DeliveryEngine`] or deferred
//! dispatch through [`scheduler::Scheduler`] → per-channel delivery →
//! [`analytics::AnalyticsTracker`].

pub mod analytics;
pub mod delivery;
pub mod manager;
pub mod preferences;
pub mod ratelimit;
pub mod scheduler;

pub use analytics::{AnalyticsTracker, MetricsSnapshot, RealTimeStats};
pub use delivery::{DeliveryEngine, DispatchJob};
pub use manager::{NotificationManager, StatusSummary};
pub use preferences::PreferenceStore;
pub use ratelimit::RateLimiter;
pub use scheduler::{EntryKind, OneOffStatus, RecurringStatus, ScheduleEntry, ScheduleSink, Scheduler};
