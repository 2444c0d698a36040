//! External collaborator interfaces.
//!
//! The engine does not own persistence or template rendering; it consumes
//! them through these traits. In-memory implementations are provided for
//! tests and for embedding the engine without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{DeliveryRecord, DeliveryStatus, Notification, NotificationType, Preference};

/// Renders a template into a (subject, body) pair.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        template_id: &str,
        data: &serde_json::Value,
    ) -> Result<(String, String), EngineError>;
}

/// Persists delivery history and answers retry queries.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist (or update) one delivery record.
    async fn save(&self, record: &DeliveryRecord) -> Result<(), EngineError>;

    /// All records for a notification.
    async fn load(&self, notification_id: Uuid) -> Result<Vec<DeliveryRecord>, EngineError>;

    /// Notifications whose most recent record inside the window is Failed.
    /// `notification_id` narrows the query to a single notification.
    async fn load_failed(
        &self,
        notification_id: Option<Uuid>,
        hours_back: i64,
    ) -> Result<Vec<Notification>, EngineError>;

    /// Persist the notification itself so `load_failed` can materialize it.
    /// Implementations that already store notifications elsewhere may no-op.
    async fn save_notification(&self, notification: &Notification) -> Result<(), EngineError>;
}

/// Backing storage for user preferences.
#[async_trait]
pub trait PreferenceBacking: Send + Sync {
    async fn load(
        &self,
        user_id: &str,
        kind: NotificationType,
    ) -> Result<Option<Preference>, EngineError>;

    async fn save(&self, preference: &Preference) -> Result<(), EngineError>;

    /// Returns true when a stored preference was removed.
    async fn delete(&self, user_id: &str, kind: NotificationType) -> Result<bool, EngineError>;
}

/// In-memory history store.
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: RwLock<HashMap<Uuid, Vec<DeliveryRecord>>>,
    notifications: RwLock<HashMap<Uuid, Notification>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save(&self, record: &DeliveryRecord) -> Result<(), EngineError> {
        let mut records = self.records.write().await;
        let lineage = records.entry(record.notification_id).or_default();
        match lineage.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => lineage.push(record.clone()),
        }
        Ok(())
    }

    async fn load(&self, notification_id: Uuid) -> Result<Vec<DeliveryRecord>, EngineError> {
        Ok(self
            .records
            .read()
            .await
            .get(&notification_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_failed(
        &self,
        notification_id: Option<Uuid>,
        hours_back: i64,
    ) -> Result<Vec<Notification>, EngineError> {
        let cutoff = Utc::now() - Duration::hours(hours_back);
        let records = self.records.read().await;
        let notifications = self.notifications.read().await;

        let mut failed = Vec::new();
        for (id, lineage) in records.iter() {
            if notification_id.is_some_and(|wanted| wanted != *id) {
                continue;
            }
            let recent_failure = lineage.iter().any(|r| {
                r.status == DeliveryStatus::Failed
                    && r.attempts.last().is_some_and(|at| *at >= cutoff)
            });
            if recent_failure
                && let Some(notification) = notifications.get(id)
            {
                failed.push(notification.clone());
            }
        }
        Ok(failed)
    }

    async fn save_notification(&self, notification: &Notification) -> Result<(), EngineError> {
        self.notifications
            .write()
            .await
            .insert(notification.id, notification.clone());
        Ok(())
    }
}

/// In-memory preference backing.
#[derive(Default)]
pub struct MemoryPreferenceBacking {
    entries: RwLock<HashMap<(String, NotificationType), Preference>>,
}

impl MemoryPreferenceBacking {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceBacking for MemoryPreferenceBacking {
    async fn load(
        &self,
        user_id: &str,
        kind: NotificationType,
    ) -> Result<Option<Preference>, EngineError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(user_id.to_string(), kind))
            .cloned())
    }

    async fn save(&self, preference: &Preference) -> Result<(), EngineError> {
        self.entries.write().await.insert(
            (preference.user_id.clone(), preference.kind),
            preference.clone(),
        );
        Ok(())
    }

    async fn delete(&self, user_id: &str, kind: NotificationType) -> Result<bool, EngineError> {
        Ok(self
            .entries
            .write()
            .await
            .remove(&(user_id.to_string(), kind))
            .is_some())
    }
}
