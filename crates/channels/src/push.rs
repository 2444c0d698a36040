//! Push channel.
//!
//! Device tokens come from notification metadata (`device_tokens` key, a
//! JSON array of strings) and the list must be non-empty. Provider specifics
//! (FCM, APNs) belong to the [`PushTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use courier_common::error::EngineError;
use courier_common::types::{ChannelKind, DeliveryResult, Notification, Preference};

use crate::Channel;

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Collapse key grouping replaceable notifications on the device.
    pub collapse_key: Option<String>,
    /// Provider-side time-to-live in seconds.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PushMessage {
    pub tokens: Vec<String>,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub collapse_key: Option<String>,
    pub ttl_secs: Option<u64>,
}

/// Wire-level push delivery. Implementations live outside the engine.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(&self, message: &PushMessage) -> Result<String, EngineError>;

    async fn healthy(&self) -> bool;
}

pub struct PushChannel {
    transport: Arc<dyn PushTransport>,
    config: Option<PushConfig>,
}

impl PushChannel {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            transport,
            config: None,
        }
    }

    fn parse_config(config: &serde_json::Value) -> Option<PushConfig> {
        serde_json::from_value(config.clone()).ok()
    }

    fn tokens(notification: &Notification) -> Result<Vec<String>, EngineError> {
        let tokens: Vec<String> = notification
            .metadata
            .get("device_tokens")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|t| t.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if tokens.is_empty() {
            return Err(EngineError::Config(
                "notification metadata has no device tokens".into(),
            ));
        }
        Ok(tokens)
    }
}

#[async_trait]
impl Channel for PushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn initialize(&mut self, config: serde_json::Value) -> Result<(), EngineError> {
        let parsed = Self::parse_config(&config)
            .ok_or_else(|| EngineError::Config("invalid push channel config".into()))?;
        tracing::info!("Push channel initialized");
        self.config = Some(parsed);
        Ok(())
    }

    async fn send(
        &self,
        notification: &Notification,
        _preference: &Preference,
    ) -> Result<DeliveryResult, EngineError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| EngineError::Config("push channel not initialized".into()))?;

        let tokens = Self::tokens(notification)?;
        let message = PushMessage {
            tokens: tokens.clone(),
            title: notification.title.clone(),
            body: notification.body.clone(),
            data: notification.metadata.clone(),
            collapse_key: config.collapse_key.clone(),
            ttl_secs: config.ttl_secs,
        };

        let message_id = self.transport.deliver(&message).await?;
        tracing::debug!(
            notification_id = %notification.id,
            devices = tokens.len(),
            message_id = %message_id,
            "Push delivered"
        );

        let mut result = DeliveryResult::delivered(message_id);
        result.metadata = serde_json::json!({ "devices": tokens.len() });
        Ok(result)
    }

    fn validate_config(&self, config: &serde_json::Value) -> bool {
        Self::parse_config(config).is_some()
    }

    async fn test_connection(&self) -> bool {
        self.config.is_some() && self.transport.healthy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::NotificationType;

    struct OkTransport;

    #[async_trait]
    impl PushTransport for OkTransport {
        async fn deliver(&self, _message: &PushMessage) -> Result<String, EngineError> {
            Ok("push-1".to_string())
        }

        async fn healthy(&self) -> bool {
            true
        }
    }

    fn make_notification(metadata: serde_json::Value) -> Notification {
        Notification::new(
            "user-1",
            NotificationType::TradingAlert,
            "Order filled",
            "Your stop order executed",
            vec![ChannelKind::Push],
        )
        .with_metadata(metadata)
    }

    async fn initialized_channel() -> PushChannel {
        let mut channel = PushChannel::new(Arc::new(OkTransport));
        channel.initialize(serde_json::json!({})).await.unwrap();
        channel
    }

    #[tokio::test]
    async fn test_send_with_tokens() {
        let channel = initialized_channel().await;
        let pref = Preference::new("user-1", NotificationType::TradingAlert);
        let notification =
            make_notification(serde_json::json!({ "device_tokens": ["tok-a", "tok-b"] }));

        let result = channel.send(&notification, &pref).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["devices"], 2);
    }

    #[tokio::test]
    async fn test_send_rejects_empty_token_list() {
        let channel = initialized_channel().await;
        let pref = Preference::new("user-1", NotificationType::TradingAlert);

        let err = channel
            .send(
                &make_notification(serde_json::json!({ "device_tokens": [] })),
                &pref,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = channel
            .send(&make_notification(serde_json::json!({})), &pref)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
