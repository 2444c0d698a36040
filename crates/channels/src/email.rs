//! Email channel.
//!
//! Resolves the recipient address from notification metadata (`email` key),
//! rejects malformed addresses before touching the transport, and hands the
//! composed message to a [`MailTransport`] implementation (SMTP, Resend,
//! SES; the wire protocol is the transport's concern).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use courier_common::error::EngineError;
use courier_common::types::{ChannelKind, DeliveryResult, Notification, Preference};

use crate::Channel;

/// Channel configuration, deserialized from an opaque JSON value.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// Sender address, must contain "@".
    pub from_address: String,
    /// Optional display name for the sender.
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
}

/// A composed message ready for the mail transport.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub to: String,
    pub from: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Wire-level mail delivery. Implementations live outside the engine.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver the message, returning the transport's message id.
    async fn deliver(&self, message: &MailMessage) -> Result<String, EngineError>;

    async fn healthy(&self) -> bool;
}

pub struct EmailChannel {
    transport: Arc<dyn MailTransport>,
    config: Option<EmailConfig>,
}

impl EmailChannel {
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self {
            transport,
            config: None,
        }
    }

    fn parse_config(config: &serde_json::Value) -> Option<EmailConfig> {
        let parsed: EmailConfig = serde_json::from_value(config.clone()).ok()?;
        if parsed.from_address.contains('@') {
            Some(parsed)
        } else {
            None
        }
    }

    fn recipient(notification: &Notification) -> Result<String, EngineError> {
        let address = notification
            .metadata
            .get("email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::Config("notification metadata has no email recipient".into())
            })?;
        if !address.contains('@') {
            return Err(EngineError::Config(format!(
                "malformed email recipient '{}'",
                address
            )));
        }
        Ok(address.to_string())
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn initialize(&mut self, config: serde_json::Value) -> Result<(), EngineError> {
        let parsed = Self::parse_config(&config)
            .ok_or_else(|| EngineError::Config("invalid email channel config".into()))?;
        tracing::info!(from = %parsed.from_address, "Email channel initialized");
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
            .ok_or_else(|| EngineError::Config("email channel not initialized".into()))?;

        let to = Self::recipient(notification)?;
        let from = match &config.from_name {
            Some(name) => format!("{} <{}>", name, config.from_address),
            None => config.from_address.clone(),
        };

        let message = MailMessage {
            to: to.clone(),
            from,
            reply_to: config.reply_to.clone(),
            subject: notification.title.clone(),
            body: notification.body.clone(),
        };

        let message_id = self.transport.deliver(&message).await?;
        tracing::debug!(
            notification_id = %notification.id,
            recipient = %to,
            message_id = %message_id,
            "Email delivered"
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

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::NotificationType;
    use tokio::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<MailMessage>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn deliver(&self, message: &MailMessage) -> Result<String, EngineError> {
            self.sent.lock().await.push(message.clone());
            Ok("msg-1".to_string())
        }

        async fn healthy(&self) -> bool {
            true
        }
    }

    fn make_notification(email: &str) -> Notification {
        Notification::new(
            "user-1",
            NotificationType::PriceAlert,
            "ETH alert",
            "ETH crossed your target",
            vec![ChannelKind::Email],
        )
        .with_metadata(serde_json::json!({ "email": email }))
    }

    fn make_preference() -> Preference {
        Preference::new("user-1", NotificationType::PriceAlert)
    }

    async fn initialized_channel(transport: Arc<RecordingTransport>) -> EmailChannel {
        let mut channel = EmailChannel::new(transport);
        channel
            .initialize(serde_json::json!({ "from_address": "alerts@courier.dev" }))
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_send_composes_message() {
        let transport = RecordingTransport::new();
        let channel = initialized_channel(transport.clone()).await;

        let result = channel
            .send(&make_notification("trader@example.com"), &make_preference())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("msg-1"));
        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "trader@example.com");
        assert_eq!(sent[0].subject, "ETH alert");
    }

    #[tokio::test]
    async fn test_send_fails_when_not_initialized() {
        let channel = EmailChannel::new(RecordingTransport::new());
        let err = channel
            .send(&make_notification("trader@example.com"), &make_preference())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_send_rejects_malformed_recipient() {
        let transport = RecordingTransport::new();
        let channel = initialized_channel(transport.clone()).await;

        let err = channel
            .send(&make_notification("not-an-address"), &make_preference())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(transport.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_rejects_missing_recipient() {
        let channel = initialized_channel(RecordingTransport::new()).await;
        let mut notification = make_notification("trader@example.com");
        notification.metadata = serde_json::json!({});

        let err = channel
            .send(&notification, &make_preference())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_validate_config() {
        let channel = EmailChannel::new(RecordingTransport::new());
        assert!(channel.validate_config(&serde_json::json!({ "from_address": "a@b.c" })));
        assert!(!channel.validate_config(&serde_json::json!({ "from_address": "nope" })));
        assert!(!channel.validate_config(&serde_json::json!({})));
    }
}
