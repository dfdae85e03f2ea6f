//! In-memory channel-based message bus.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.
//! Handlers publishing messages can trigger other handlers without a
//! broker, which also makes it the bus of choice for tests.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use super::{BusError, InboundMessage, MessageBus, MessageHandler, OutboundMessage, Result};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// Highest delivery QoS a subscriber can see.
const MAX_DELIVERY_QOS: u8 = 2;

type Subscriptions = Arc<RwLock<Vec<(String, Arc<dyn MessageHandler>)>>>;

/// In-memory message bus using a tokio broadcast channel.
///
/// Messages are published to the channel and received by the consumer task,
/// which fans them out to every handler whose filter matches the topic.
pub struct ChannelBus {
    /// Broadcast sender for publishing messages.
    sender: broadcast::Sender<Arc<InboundMessage>>,
    /// Registered handlers with their topic filters.
    handlers: Subscriptions,
    /// Flag indicating if consumer task is running.
    consuming: Arc<RwLock<bool>>,
    /// Packet id source for QoS 1/2 deliveries.
    next_message_id: Arc<AtomicU16>,
}

impl ChannelBus {
    /// Create a new channel bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        info!("Channel bus initialized");

        Self {
            sender,
            handlers: Arc::new(RwLock::new(Vec::new())),
            consuming: Arc::new(RwLock::new(false)),
            next_message_id: Arc::new(AtomicU16::new(1)),
        }
    }

    /// Create a new bus that shares the same channel with its own handlers.
    pub fn linked(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            consuming: Arc::new(RwLock::new(false)),
            next_message_id: Arc::clone(&self.next_message_id),
        }
    }

    fn message_id(&self, qos: u8) -> u16 {
        if qos == 0 {
            return 0;
        }
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            // 0 is reserved for QoS 0
            if id != 0 {
                return id;
            }
        }
    }

    /// Start consuming messages (call after subscribe).
    async fn start_consuming_impl(&self) -> Result<()> {
        // Check if already consuming
        {
            let mut consuming = self.consuming.write().await;
            if *consuming {
                return Ok(());
            }
            *consuming = true;
        }

        let mut receiver = self.sender.subscribe();
        let handlers = self.handlers.clone();

        // Spawn consumer task
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        let handlers = handlers.read().await;
                        let delivered = super::dispatch_to_handlers(&handlers, &message);
                        debug!(
                            topic = %message.topic,
                            handlers = delivered,
                            "Received message via channel"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        break;
                    }
                }
            }
        });

        info!("Channel consumer started");

        Ok(())
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %message.topic))]
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if message.qos > MAX_DELIVERY_QOS {
            return Err(BusError::InvalidQos(message.qos));
        }

        let inbound = Arc::new(InboundMessage {
            message_id: self.message_id(message.qos),
            topic: message.topic,
            qos: message.qos,
            payload: message.payload,
        });

        // Send to channel (ignore error if no receivers)
        match self.sender.send(inbound) {
            Ok(receiver_count) => {
                debug!(receivers = receiver_count, "Published message to channel");
            }
            Err(_) => {
                debug!("Published message (no receivers)");
            }
        }

        Ok(())
    }

    async fn subscribe(&self, filter: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let count = {
            let mut handlers = self.handlers.write().await;
            handlers.push((filter.to_string(), handler));
            handlers.len()
        };

        info!(filter = %filter, handler_count = count, "Handler subscribed to channel bus");

        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        self.start_consuming_impl().await
    }
}
