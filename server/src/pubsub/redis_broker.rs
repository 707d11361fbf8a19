use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{PubSub, Subscription};
use crate::error::{CoreError, CoreResult};

fn transport(e: redis::RedisError) -> CoreError {
    CoreError::Transport(e.to_string())
}

/// Redis-backed broker for multi-instance deployments. Publishes share one
/// multiplexed connection; each subscribed topic gets its own pub/sub
/// connection, which is dropped on unsubscribe.
pub struct RedisBroker {
    client: redis::Client,
    publisher: MultiplexedConnection,
    subscriptions: DashMap<String, CancellationToken>,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url).map_err(transport)?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(transport)?;
        info!("connected to redis pub/sub");
        Ok(Self {
            client,
            publisher,
            subscriptions: DashMap::new(),
        })
    }
}

#[async_trait]
impl PubSub for RedisBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> CoreResult<()> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(topic, payload).await.map_err(transport)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> CoreResult<Subscription> {
        if self.subscriptions.contains_key(topic) {
            return Err(CoreError::Conflict(format!("already subscribed to {topic}")));
        }
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transport)?;
        pubsub.subscribe(topic).await.map_err(transport)?;

        let token = CancellationToken::new();
        self.subscriptions.insert(topic.to_string(), token.clone());
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
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
