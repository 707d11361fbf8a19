use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use super::events::ChatMessage;
use super::hub::Hub;
use crate::pubsub::{Envelope, PubSub, SYSTEM_TOPIC};

/// Delivers server frames: local sockets first, then the pub/sub topic so
/// other instances can deliver to theirs. Transport failures are logged and
/// never undo the local delivery.
pub struct Broadcaster {
    hub: Arc<Hub>,
    pubsub: Arc<dyn PubSub>,
    instance_id: Uuid,
}

impl Broadcaster {
    pub fn new(hub: Arc<Hub>, pubsub: Arc<dyn PubSub>, instance_id: Uuid) -> Self {
        Self {
            hub,
            pubsub,
            instance_id,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Fan a message out to a channel. Returns the number of local sockets
    /// that accepted it.
    pub async fn to_channel(&self, channel: &str, message: &ChatMessage) -> usize {
        let body = message.to_json();
        let delivered = self.hub.notify_channel(channel, body.clone().into()).await;
        self.publish(channel, &body).await;
        delivered
    }

    /// Fan a message out to every socket on every instance.
    pub async fn to_all(&self, message: &ChatMessage) -> usize {
        let body = message.to_json();
        let delivered = self.hub.notify_all(body.clone().into()).await;
        self.publish(SYSTEM_TOPIC, &body).await;
        delivered
    }

    /// Send a frame to one user's channel socket on this instance only.
    pub async fn to_user(&self, username: &str, message: &ChatMessage) -> bool {
        self.hub.notify_user(username, message.to_json().into()).await
    }

    async fn publish(&self, topic: &str, body: &str) {
        let payload = Envelope::encode(self.instance_id, body);
        if let Err(e) = self.pubsub.publish(topic, payload).await {
            warn!(topic = %topic, error = %e, "publish failed, remote instances will miss this frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::connection::{ConnectionKind, drain_text, test_connection};
    use crate::engine::events::{MessageContent, SystemNotice, TextContent};
    use crate::pubsub::local::LocalBroker;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_first_then_publish_with_origin() {
        let hub = Arc::new(Hub::new(Duration::from_millis(500)));
        let broker = Arc::new(LocalBroker::new());
        let peer = broker.connect();
        let mut remote = peer.subscribe("general").await.unwrap();
        let instance_id = Uuid::new_v4();
        let broadcaster = Broadcaster::new(hub.clone(), broker.clone(), instance_id);

        hub.initialize_channel("general").unwrap();
        let (conn, mut rx) = test_connection("alice", ConnectionKind::Channel);
        let conn = Arc::new(conn);
        hub.add_connection(conn.clone()).unwrap();
        hub.add_client_to_channel("general", &conn).unwrap();

        let msg = ChatMessage::from_user(
            "alice",
            "general",
            MessageContent::Text(TextContent { text: "hi".into() }),
        );
        assert_eq!(broadcaster.to_channel("general", &msg).await, 1);
        assert_eq!(drain_text(&mut rx), vec![msg.to_json()]);

        let payload = tokio::time::timeout(Duration::from_secs(1), remote.next())
            .await
            .unwrap()
            .unwrap();
        let env = Envelope::decode(&payload).unwrap();
        assert_eq!(env.origin, instance_id);
        assert_eq!(env.body, msg.to_json());
    }

    #[tokio::test]
    async fn test_to_all_uses_system_topic() {
        let hub = Arc::new(Hub::new(Duration::from_millis(500)));
        let broker = Arc::new(LocalBroker::new());
        let peer = broker.connect();
        let mut remote = peer.subscribe(SYSTEM_TOPIC).await.unwrap();
        let broadcaster = Broadcaster::new(hub.clone(), broker, Uuid::new_v4());

        let (sys, mut rx) = test_connection("bob", ConnectionKind::System);
        hub.add_system_connection(Arc::new(sys)).unwrap();

        let msg = ChatMessage::server(
            None,
            MessageContent::System(SystemNotice { text: "restart soon".into() }),
        );
        assert_eq!(broadcaster.to_all(&msg).await, 1);
        assert_eq!(drain_text(&mut rx).len(), 1);
        assert!(
            tokio::time::timeout(Duration::from_secs(1), remote.next())
                .await
                .unwrap()
                .is_some()
        );
    }
}
