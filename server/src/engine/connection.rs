use std::pin::Pin;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes};
use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Unique identifier for a live socket (one per connection, not per user).
pub type ConnectionId = Uuid;

/// Outbound half of a client socket.
pub type Outgoing = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Bound to at most one channel at a time.
    Channel,
    /// Channel-agnostic; receives directory-level notifications.
    System,
}

/// A live client socket. Every write goes through the sink mutex so frames
/// from concurrent notifiers never interleave.
pub struct Connection {
    pub id: ConnectionId,
    pub username: String,
    pub kind: ConnectionKind,
    outgoing: Mutex<Outgoing>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new<S>(username: &str, kind: ConnectionKind, outgoing: S) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            kind,
            outgoing: Mutex::new(Box::pin(outgoing)),
            closed: CancellationToken::new(),
        }
    }

    /// Write one text frame, failing if it takes longer than `deadline`.
    pub async fn send_text(&self, frame: Utf8Bytes, deadline: Duration) -> CoreResult<()> {
        self.send(Message::Text(frame), deadline).await
    }

    /// Liveness ping.
    pub async fn ping(&self, deadline: Duration) -> CoreResult<()> {
        self.send(Message::Ping(Bytes::new()), deadline).await
    }

    async fn send(&self, message: Message, deadline: Duration) -> CoreResult<()> {
        if self.closed.is_cancelled() {
            return Err(CoreError::Transport("connection closed".into()));
        }
        let write = async {
            let mut outgoing = self.outgoing.lock().await;
            outgoing.send(message).await
        };
        match tokio::time::timeout(deadline, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CoreError::Transport(e.to_string())),
            Err(_) => Err(CoreError::Timeout("socket write".into())),
        }
    }

    /// Close the socket and wake the reader task. Idempotent.
    pub async fn close(&self, deadline: Duration) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let _ = tokio::time::timeout(deadline, async {
            let mut outgoing = self.outgoing.lock().await;
            let _ = outgoing.send(Message::Close(None)).await;
            let _ = outgoing.close().await;
        })
        .await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("kind", &self.kind)
            .finish()
    }
}

/// In-memory sockets for tests: frames written to the connection arrive on
/// the returned receiver. Dropping the receiver makes every write fail.
#[cfg(test)]
pub fn test_connection(
    username: &str,
    kind: ConnectionKind,
) -> (Connection, tokio::sync::mpsc::Receiver<Message>) {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let sink = TestSink(tokio_util::sync::PollSender::new(tx));
    (Connection::new(username, kind, sink), rx)
}

/// Sink over an mpsc sender. Once the receiver is gone every write fails,
/// however many times it is retried.
#[cfg(test)]
struct TestSink(tokio_util::sync::PollSender<Message>);

#[cfg(test)]
fn test_socket_closed() -> axum::Error {
    axum::Error::new("test socket closed")
}

#[cfg(test)]
impl Sink<Message> for TestSink {
    type Error = axum::Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0.poll_reserve(cx).map_err(|_| test_socket_closed())
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.0.send_item(item).map_err(|_| test_socket_closed())
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0.close();
        std::task::Poll::Ready(Ok(()))
    }
}

/// Text payloads received by a test socket so far.
#[cfg(test)]
pub fn drain_text(rx: &mut tokio::sync::mpsc::Receiver<Message>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Message::Text(text) = msg {
            frames.push(text.as_str().to_string());
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_send_text_reaches_sink() {
        let (conn, mut rx) = test_connection("alice", ConnectionKind::Channel);
        conn.send_text("hello".into(), DEADLINE).await.unwrap();
        conn.send_text("world".into(), DEADLINE).await.unwrap();
        assert_eq!(drain_text(&mut rx), vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_fails() {
        let (conn, rx) = test_connection("alice", ConnectionKind::Channel);
        drop(rx);
        assert!(conn.ping(DEADLINE).await.is_err());
    }

    #[tokio::test]
    async fn test_dead_peer_fails_every_write_and_close_completes() {
        let (conn, rx) = test_connection("alice", ConnectionKind::Channel);
        drop(rx);
        assert!(conn.ping(DEADLINE).await.is_err());
        assert!(conn.send_text("again".into(), DEADLINE).await.is_err());
        // Closing writes to the dead sink once more; it must not panic.
        conn.close(DEADLINE).await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_writes() {
        let (conn, mut rx) = test_connection("alice", ConnectionKind::System);
        conn.close(DEADLINE).await;
        conn.close(DEADLINE).await;
        assert!(conn.is_closed());
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
        assert!(conn.send_text("late".into(), DEADLINE).await.is_err());
        // `closed` resolves immediately once closed.
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let (conn, mut rx) = test_connection("alice", ConnectionKind::Channel);
        let conn = std::sync::Arc::new(conn);
        let mut handles = Vec::new();
        for i in 0..20 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                conn.send_text(format!("frame-{i}").into(), DEADLINE).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let mut frames = drain_text(&mut rx);
        frames.sort();
        assert_eq!(frames.len(), 20);
        frames.dedup();
        assert_eq!(frames.len(), 20);
    }
}
