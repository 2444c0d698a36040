//! Delivery channel abstraction.
//!
//! Each channel variant (email, SMS, push, webhook) implements [`Channel`]:
//! config validation, recipient-shape validation, and delegation to its
//! transport. Variants are selected through a [`ChannelRegistry`] keyed by
//! [`ChannelKind`]; new channels are added by registering a new variant,
//! not by modifying dispatch logic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use courier_common::error::EngineError;
use courier_common::types::{ChannelKind, DeliveryResult, Notification, Preference};

pub mod email;
pub mod push;
pub mod sms;
pub mod webhook;

pub use email::{EmailChannel, MailMessage, MailTransport};
pub use push::{PushChannel, PushMessage, PushTransport};
pub use sms::{SmsChannel, SmsMessage, SmsTransport};
pub use webhook::WebhookChannel;

/// Capability contract for a delivery channel variant.
///
/// Side effects are confined to the variant's transport. A variant that has
/// not been initialized fails `send` with a configuration error instead of
/// attempting delivery.
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Apply channel configuration. Must be called before the first `send`.
    async fn initialize(&mut self, config: serde_json::Value) -> Result<(), EngineError>;

    /// Deliver one notification to this channel's recipient. The recipient
    /// address is resolved from the notification metadata and shape-checked
    /// before the transport is touched.
    async fn send(
        &self,
        notification: &Notification,
        preference: &Preference,
    ) -> Result<DeliveryResult, EngineError>;

    /// Whether the given configuration value is acceptable to `initialize`.
    fn validate_config(&self, config: &serde_json::Value) -> bool;

    /// Whether the channel is initialized and its transport reachable.
    async fn test_connection(&self) -> bool;
}

/// Registry of active channel implementations, keyed by variant.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKind, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous implementation for the
    /// same variant.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        tracing::info!(channel = %channel.kind(), "Channel registered");
        self.channels.insert(channel.kind(), channel);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn Channel>> {
        self.channels.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ChannelKind> {
        self.channels.keys().copied().collect()
    }
}
