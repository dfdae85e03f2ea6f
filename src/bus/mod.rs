//! Message bus for inbound and outbound messages.
//!
//! This module contains:
//! - `MessageBus` trait: Publish and subscribe on a topic namespace
//! - `MessageHandler` trait: For processing delivered messages
//! - Bus configuration types
//! - Implementations: MQTT, in-process channel, Mock

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::info;

// Implementation modules
pub mod channel;
pub mod mock;
#[cfg(feature = "mqtt")]
pub mod mqtt;

// Re-exports
pub use channel::ChannelBus;
pub use mock::MockBus;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("QoS {0} is not supported by this bus")]
    InvalidQos(u8),

    #[error("Messaging type '{0}' is not enabled in this build")]
    Unsupported(String),
}

/// A message delivered by the bus. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    /// Delivery QoS (0 to 2).
    pub qos: u8,
    pub payload: Bytes,
    /// Packet identifier; 0 for QoS 0 deliveries.
    pub message_id: u16,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub qos: u8,
    pub payload: Bytes,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, qos: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Handler for messages delivered by the bus.
///
/// Buses spawn the returned future as its own task, so handlers are invoked
/// concurrently and must not assume any ordering between messages.
pub trait MessageHandler: Send + Sync {
    /// Process one inbound message.
    fn handle(&self, message: Arc<InboundMessage>) -> BoxFuture<'static, ()>;
}

/// Publish/subscribe transport.
///
/// Implementations:
/// - `MqttBus`: MQTT broker via rumqttc
/// - `ChannelBus`: In-process broadcast channel
/// - `MockBus`: Records publishes for testing
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Register a handler for messages whose topic matches `filter`.
    async fn subscribe(&self, filter: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Start delivering messages to subscribed handlers.
    ///
    /// Default is a no-op for buses that deliver as soon as they subscribe.
    async fn start_consuming(&self) -> Result<()> {
        Ok(())
    }
}

/// Spawn one delivery task per matching handler.
pub(crate) fn dispatch_to_handlers(
    handlers: &[(String, Arc<dyn MessageHandler>)],
    message: &Arc<InboundMessage>,
) -> usize {
    let mut delivered = 0;
    for (filter, handler) in handlers {
        if crate::router::pattern_matches(filter, &message.topic) {
            tokio::spawn(handler.handle(Arc::clone(message)));
            delivered += 1;
        }
    }
    delivered
}

// ============================================================================
// Configuration
// ============================================================================

/// Default subscription filter: every topic.
pub const DEFAULT_SUBSCRIPTION: &str = "#";

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// MQTT broker.
    #[default]
    Mqtt,
    /// In-process channel, no broker.
    Channel,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// MQTT-specific configuration.
    pub mqtt: MqttConfig,
}

/// MQTT-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL, e.g. `tcp://127.0.0.1:1883` or `ssl://broker:8883`.
    pub broker: String,
    /// Client id. Defaults to the hostname followed by the current second.
    pub client_id: Option<String>,
    /// Username to authenticate with.
    pub username: Option<String>,
    /// Password, only sent when a username is set.
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Start without persisted broker session state.
    pub clean_session: bool,
    /// Subscription filter for inbound messages.
    pub subscription: String,
    /// QoS for the subscription.
    pub subscription_qos: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://127.0.0.1:1883".to_string(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 2,
            clean_session: true,
            subscription: DEFAULT_SUBSCRIPTION.to_string(),
            subscription_qos: 0,
        }
    }
}

/// Build the bus selected by configuration.
///
/// For MQTT this establishes the broker connection; failure to connect is
/// returned to the caller.
pub async fn init_bus(config: &MessagingConfig) -> Result<Arc<dyn MessageBus>> {
    match config.messaging_type {
        MessagingType::Mqtt => {
            #[cfg(feature = "mqtt")]
            {
                let bus = MqttBus::connect(&config.mqtt).await?;
                Ok(Arc::new(bus))
            }
            #[cfg(not(feature = "mqtt"))]
            {
                Err(BusError::Unsupported("mqtt".to_string()))
            }
        }
        MessagingType::Channel => {
            info!("Using in-process channel bus");
            Ok(Arc::new(ChannelBus::new()))
        }
    }
}
