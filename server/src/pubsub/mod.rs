pub mod local;
pub mod redis_broker;
pub mod relay;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Topic carrying system-wide broadcasts between instances.
pub const SYSTEM_TOPIC: &str = "__system__";

/// Payloads delivered on a subscribed topic, in publish order.
pub type Subscription = BoxStream<'static, Vec<u8>>;

/// Stateless adapter over an external message broker, used to fan frames out
/// to the other server instances.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> CoreResult<()>;

    /// Start receiving a topic. One subscription per topic per instance.
    async fn subscribe(&self, topic: &str) -> CoreResult<Subscription>;

    /// Stop receiving a topic. The subscription stream ends. No-op when not
    /// subscribed.
    async fn unsubscribe(&self, topic: &str) -> CoreResult<()>;

    fn is_subscribed(&self, topic: &str) -> bool;
}

/// Wire wrapper that lets an instance recognise its own publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: Uuid,
    /// A serialised frame, forwarded to sockets verbatim.
    pub body: String,
}

impl Envelope {
    pub fn encode(origin: Uuid, body: &str) -> Vec<u8> {
        serde_json::to_vec(&Envelope {
            origin,
            body: body.to_string(),
        })
        .unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| CoreError::Transport(format!("malformed envelope: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let origin = Uuid::new_v4();
        let bytes = Envelope::encode(origin, r#"{"type":"TEXT"}"#);
        let env = Envelope::decode(&bytes).unwrap();
        assert_eq!(env.origin, origin);
        assert_eq!(env.body, r#"{"type":"TEXT"}"#);
    }

    #[test]
    fn test_garbage_envelope_is_transport_error() {
        assert!(matches!(
            Envelope::decode(b"nope"),
            Err(CoreError::Transport(_))
        ));
    }
}
