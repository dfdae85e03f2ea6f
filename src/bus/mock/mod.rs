//! Mock message bus implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};

use super::{BusError, MessageBus, MessageHandler, OutboundMessage, Result};

/// Mock message bus for testing.
#[derive(Default)]
pub struct MockBus {
    published: RwLock<Vec<OutboundMessage>>,
    subscriptions: RwLock<Vec<String>>,
    fail_on_publish: RwLock<bool>,
    publish_notify: Notify,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.clone()
    }

    /// Wait until at least `count` messages have been published.
    pub async fn wait_for_published(&self, count: usize) -> Vec<OutboundMessage> {
        loop {
            let notified = self.publish_notify.notified();
            {
                let published = self.published.read().await;
                if published.len() >= count {
                    return published.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.published.write().await.push(message);
        self.publish_notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.subscriptions.write().await.push(filter.to_string());
        Ok(())
    }
}
