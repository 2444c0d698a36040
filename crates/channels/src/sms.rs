//! SMS channel.
//!
//! Recipient phone numbers come from notification metadata (`phone` key)
//! and must carry at least 10 digits. Message text is the title and body
//! joined; segmenting and provider specifics belong to the [`SmsTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use courier_common::error::EngineError;
use courier_common::types::{ChannelKind, DeliveryResult, Notification, Preference};

use crate::Channel;

const MIN_PHONE_DIGITS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    /// Sender number or alphanumeric sender id.
    pub from_number: String,
}

#[derive(Debug, Clone)]
pub struct SmsMessage {
    pub to: String,
    pub from: String,
    pub text: String,
}

/// Wire-level SMS delivery. Implementations live outside the engine.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn deliver(&self, message: &SmsMessage) -> Result<String, EngineError>;

    async fn healthy(&self) -> bool;
}

pub struct SmsChannel {
    transport: Arc<dyn SmsTransport>,
    config: Option<SmsConfig>,
}

impl SmsChannel {
    pub fn new(transport: Arc<dyn SmsTransport>) -> Self {
        Self {
            transport,
            config: None,
        }
    }

    fn parse_config(config: &serde_json::Value) -> Option<SmsConfig> {
        let parsed: SmsConfig = serde_json::from_value(config.clone()).ok()?;
        if parsed.from_number.is_empty() {
            None
        } else {
            Some(parsed)
        }
    }

    fn recipient(notification: &Notification) -> Result<String, EngineError> {
        let phone = notification
            .metadata
            .get("phone")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::Config("notification metadata has no phone recipient".into())
            })?;
        let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
        if digits < MIN_PHONE_DIGITS {
            return Err(EngineError::Config(format!(
                "malformed phone recipient '{}'",
                phone
            )));
        }
        Ok(phone.to_string())
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn initialize(&mut self, config: serde_json::Value) -> Result<(), EngineError> {
        let parsed = Self::parse_config(&config)
            .ok_or_else(|| EngineError::Config("invalid sms channel config".into()))?;
        tracing::info!(from = %parsed.from_number, "SMS channel initialized");
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
            .ok_or_else(|| EngineError::Config("sms channel not initialized".into()))?;

        let to = Self::recipient(notification)?;
        let message = SmsMessage {
            to: to.clone(),
            from: config.from_number.clone(),
            text: format!("{}: {}", notification.title, notification.body),
        };

        let message_id = self.transport.deliver(&message).await?;
        tracing::debug!(
            notification_id = %notification.id,
            recipient = %to,
            message_id = %message_id,
            "SMS delivered"
        );

        let mut result = DeliveryResult::delivered(message_id);
        result.metadata = serde_json::json!({ "recipient": to });
        Ok(result)
    }

    fn validate_config(&self, config: &serde_json::Value) -> bool {
        Self::parse_config(config).is_some()
    }

    async fn test_connection(&self) -> bool {
        self.config.is_some() && self.transport.healthy().await
    }
}
