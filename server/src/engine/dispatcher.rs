use std::sync::Arc;

use tracing::debug;

use super::batch_writer::{BatchWriter, DirtyRegion};
use super::broadcast::Broadcaster;
use super::channel_manager::ChannelManager;
use super::events::{ChatMessage, ClientFrame, MessageContent, SketchCommand, SystemNotice};
use super::rate_limiter::RateLimiter;
use super::sketch::SketchEngine;
use crate::db::models::MessageRow;
use crate::error::{CoreError, CoreResult};

/// Routes frames read from client sockets: stamps them with the sender's
/// identity, validates, broadcasts, then hands them to the persistence path
/// for their type.
pub struct Dispatcher {
    channels: Arc<ChannelManager>,
    sketches: Arc<SketchEngine>,
    broadcaster: Arc<Broadcaster>,
    chat_writer: Arc<BatchWriter<MessageRow>>,
    sketch_writer: Arc<BatchWriter<DirtyRegion>>,
    message_limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(
        channels: Arc<ChannelManager>,
        sketches: Arc<SketchEngine>,
        broadcaster: Arc<Broadcaster>,
        chat_writer: Arc<BatchWriter<MessageRow>>,
        sketch_writer: Arc<BatchWriter<DirtyRegion>>,
    ) -> Self {
        Self {
            channels,
            sketches,
            broadcaster,
            chat_writer,
            sketch_writer,
            message_limiter: RateLimiter::new(10, 1.0),
        }
    }

    /// Handle one text frame from `username`. Returns the message as it was
    /// broadcast. A rejected frame is never broadcast; the caller reports
    /// the error to the sender.
    pub async fn handle_frame(&self, username: &str, text: &str) -> CoreResult<ChatMessage> {
        let frame = ClientFrame::parse(text)?;
        frame.content.validate()?;

        if matches!(frame.content, MessageContent::System(_)) {
            let mut message = ChatMessage::from_user(username, &frame.channel_name, frame.content);
            if frame.channel_name.is_empty() {
                message.channel_name = None;
            }
            self.broadcaster.to_all(&message).await;
            return Ok(message);
        }

        if frame.channel_name.trim().is_empty() {
            return Err(CoreError::Validation("Channel name cannot be empty".into()));
        }
        let channel = frame.channel_name;
        self.channels.require_member(&channel, username)?;

        match frame.content {
            content @ (MessageContent::Text(_) | MessageContent::Image(_)) => {
                if !self.message_limiter.check(username) {
                    return Err(CoreError::RateLimited);
                }
                let message = ChatMessage::from_user(username, &channel, content);
                self.broadcaster.to_channel(&channel, &message).await;
                if let Some(row) = message.to_row() {
                    self.chat_writer.add(row);
                }
                self.channels
                    .record_message(&channel, username, message.timestamp);
                Ok(message)
            }
            MessageContent::SketchUpdate(update) => {
                let region_key = self.sketches.apply_update(&channel, &update)?;
                let sketch_id = update.sketch_id.clone();
                let message =
                    ChatMessage::from_user(username, &channel, MessageContent::SketchUpdate(update));
                self.broadcaster.to_channel(&channel, &message).await;
                self.sketch_writer.add(DirtyRegion {
                    sketch_id,
                    region_key,
                });
                Ok(message)
            }
            MessageContent::SketchCommand(command) => {
                let command = self.run_sketch_command(&channel, username, command).await?;
                let message =
                    ChatMessage::from_user(username, &channel, MessageContent::SketchCommand(command));
                self.broadcaster.to_channel(&channel, &message).await;
                Ok(message)
            }
            content @ (MessageContent::Channel(_) | MessageContent::Member(_)) => {
                let message = ChatMessage::from_user(username, &channel, content);
                self.broadcaster.to_channel(&channel, &message).await;
                Ok(message)
            }
            MessageContent::System(_) | MessageContent::Error(_) => {
                debug!(user = %username, "unroutable frame reached dispatch");
                Err(CoreError::Validation("Unsupported frame type".into()))
            }
        }
    }

    /// Sketch commands commit before they are broadcast. A created sketch's
    /// id is filled in so peers can address it.
    async fn run_sketch_command(
        &self,
        channel: &str,
        username: &str,
        command: SketchCommand,
    ) -> CoreResult<SketchCommand> {
        match command {
            SketchCommand::Create {
                display_name,
                width,
                height,
                ..
            } => {
                let sketch = self
                    .sketches
                    .create_sketch(channel, username, &display_name, width, height)
                    .await?;
                Ok(SketchCommand::Create {
                    display_name: sketch.display_name.clone(),
                    width,
                    height,
                    sketch_id: Some(sketch.id.clone()),
                })
            }
            SketchCommand::Delete { sketch_id } => {
                self.sketches
                    .delete_sketch(channel, &sketch_id, username)
                    .await?;
                Ok(SketchCommand::Delete { sketch_id })
            }
            SketchCommand::Clear { sketch_id } => {
                self.sketches
                    .clear_sketch(channel, &sketch_id, username)
                    .await?;
                Ok(SketchCommand::Clear { sketch_id })
            }
        }
    }

    /// Server-originated notice to every socket on every instance.
    pub async fn broadcast_system(&self, text: &str) -> usize {
        let message = ChatMessage::server(
            None,
            MessageContent::System(SystemNotice {
                text: text.to_string(),
            }),
        );
        self.broadcaster.to_all(&message).await
    }

    /// Drop rate-limiter buckets idle for longer than `idle`.
    pub fn cleanup_limiter(&self, idle: std::time::Duration) {
        self.message_limiter.cleanup(idle);
    }
}
