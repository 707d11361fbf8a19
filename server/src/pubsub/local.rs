use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{PubSub, Subscription};
use crate::error::{CoreError, CoreResult};

/// Capacity per topic. Slow subscribers that fall behind skip messages.
const TOPIC_CAPACITY: usize = 1024;

/// In-process broker over `tokio::sync::broadcast`.
///
/// Handles created with [`LocalBroker::connect`] share one bus but keep
/// their own subscriptions, so several server instances can run in one
/// process.
pub struct LocalBroker {
    bus: Arc<DashMap<String, broadcast::Sender<Vec<u8>>>>,
    subscriptions: DashMap<String, CancellationToken>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(DashMap::new()),
            subscriptions: DashMap::new(),
        }
    }

    /// Another client on the same bus.
    pub fn connect(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            subscriptions: DashMap::new(),
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for LocalBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> CoreResult<()> {
        if let Some(sender) = self.bus.get(topic) {
            // Err only means nobody is listening.
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> CoreResult<Subscription> {
        if self.subscriptions.contains_key(topic) {
            return Err(CoreError::Conflict(format!("already subscribed to {topic}")));
        }
        let receiver = self
            .bus
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();
        let token = CancellationToken::new();
        self.subscriptions.insert(topic.to_string(), token.clone());

        let name = topic.to_string();
        let stream = futures_util::stream::unfold(receiver, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(topic = %name, skipped, "subscriber lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .take_until(token.cancelled_owned());
        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, topic: &str) -> CoreResult<()> {
        if let Some((_, token)) = self.subscriptions.remove(topic) {
            token.cancel();
        }
        Ok(())
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }
}
