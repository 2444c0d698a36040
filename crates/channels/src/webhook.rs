//! Webhook channel.
//!
//! The one variant whose wire format is plain HTTP: the notification is
//! POSTed as JSON to the URL in notification metadata (`webhook_url` key).
//! Non-http(s) URLs are rejected before any request is made.

use async_trait::async_trait;
use serde::Deserialize;

use courier_common::error::EngineError;
use courier_common::types::{ChannelKind, DeliveryResult, Notification, Preference};

use crate::Channel;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Per-request timeout in seconds (default: 30).
    pub timeout_secs: Option<u64>,
    /// Extra headers attached to every request.
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

pub struct WebhookChannel {
    client: Option<reqwest::Client>,
    config: WebhookConfig,
}

impl WebhookChannel {
    pub fn new() -> Self {
        Self {
            client: None,
            config: WebhookConfig::default(),
        }
    }

    fn parse_config(config: &serde_json::Value) -> Option<WebhookConfig> {
        serde_json::from_value(config.clone()).ok()
    }

    fn url(notification: &Notification) -> Result<String, EngineError> {
        let url = notification
            .metadata
            .get("webhook_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::Config("notification metadata has no webhook url".into())
            })?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(EngineError::Config(format!(
                "webhook url '{}' is not http(s)",
                url
            )));
        }
        Ok(url.to_string())
    }

    fn payload(notification: &Notification) -> serde_json::Value {
        serde_json::json!({
            "id": notification.id,
            "user_id": notification.user_id,
            "type": notification.kind.to_string(),
            "priority": notification.priority.to_string(),
            "title": notification.title,
            "body": notification.body,
            "metadata": notification.metadata,
            "created_at": notification.created_at,
        })
    }
}

impl Default for WebhookChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn initialize(&mut self, config: serde_json::Value) -> Result<(), EngineError> {
        let parsed = Self::parse_config(&config)
            .ok_or_else(|| EngineError::Config("invalid webhook channel config".into()))?;
        let timeout = parsed.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout))
            .build()
            .map_err(|e| EngineError::Config(format!("webhook client build failed: {}", e)))?;

        tracing::info!(timeout_secs = timeout, "Webhook channel initialized");
        self.client = Some(client);
        self.config = parsed;
        Ok(())
    }

    async fn send(
        &self,
        notification: &Notification,
        _preference: &Preference,
    ) -> Result<DeliveryResult, EngineError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| EngineError::Config("webhook channel not initialized".into()))?;

        let url = Self::url(notification)?;
        let mut request = client.post(&url).json(&Self::payload(notification));
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Delivery(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                notification_id = %notification.id,
                status = status.as_u16(),
                "Webhook returned non-success status"
            );
            return Err(EngineError::Delivery(format!(
                "webhook returned status {}",
                status
            )));
        }

        tracing::debug!(
            notification_id = %notification.id,
            status = status.as_u16(),
            "Webhook delivered"
        );

        let mut result = DeliveryResult::delivered(notification.id.to_string());
        result.metadata = serde_json::json!({ "status": status.as_u16() });
        Ok(result)
    }

    fn validate_config(&self, config: &serde_json::Value) -> bool {
        Self::parse_config(config).is_some()
    }

    async fn test_connection(&self) -> bool {
        self.client.is_some()
    }
}
