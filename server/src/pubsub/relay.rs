use std::sync::{Arc, OnceLock, Weak};

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Envelope, Subscription};
use crate::engine::channel_manager::ChannelManager;
use crate::engine::events::{
    ChannelAction, ChannelEvent, ChatMessage, MemberAction, MemberEvent, MessageContent,
    SketchCommand,
};
use crate::engine::hub::Hub;
use crate::engine::sketch::SketchEngine;

/// Where frames received from a topic are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Channel(String),
    All,
}

/// Forwards frames published by other instances into the local hub, and
/// keeps local sketch state and the channel directory in step with remote
/// traffic.
pub struct Relay {
    hub: Arc<Hub>,
    sketches: Arc<SketchEngine>,
    /// Set once at start-up. Weak because the manager owns this relay.
    directory: OnceLock<Weak<ChannelManager>>,
    instance_id: Uuid,
}

impl Relay {
    pub fn new(hub: Arc<Hub>, sketches: Arc<SketchEngine>, instance_id: Uuid) -> Self {
        Self {
            hub,
            sketches,
            directory: OnceLock::new(),
            instance_id,
        }
    }

    /// Route remote channel and membership changes into `channels`.
    pub fn attach_directory(&self, channels: &Arc<ChannelManager>) {
        if self.directory.set(Arc::downgrade(channels)).is_err() {
            warn!("relay directory already attached");
        }
    }

    fn directory(&self) -> Option<Arc<ChannelManager>> {
        self.directory.get().and_then(Weak::upgrade)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Drain `subscription` into `target` until the stream ends or `cancel`
    /// fires.
    pub fn spawn(
        self: &Arc<Self>,
        target: Target,
        mut subscription: Subscription,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            debug!(target = ?target, "relay started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = subscription.next() => match next {
                        Some(payload) => {
                            relay.deliver(&target, &payload).await;
                        }
                        None => break,
                    },
                }
            }
            debug!(target = ?target, "relay stopped");
        })
    }

    /// Handle one payload. Own publishes are skipped: local delivery has
    /// already happened.
    pub async fn deliver(&self, target: &Target, payload: &[u8]) -> usize {
        let envelope = match Envelope::decode(payload) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping undecodable pub/sub payload");
                return 0;
            }
        };
        if envelope.origin == self.instance_id {
            return 0;
        }

        if let Ok(message) = serde_json::from_str::<ChatMessage>(&envelope.body) {
            self.apply_remote(target, message).await;
        }
        match target {
            Target::Channel(channel) => {
                self.hub
                    .notify_channel(channel, envelope.body.into())
                    .await
            }
            Target::All => self.hub.notify_all(envelope.body.into()).await,
        }
    }

    async fn apply_remote(&self, target: &Target, message: ChatMessage) {
        match (target, message.content) {
            (Target::All, MessageContent::Channel(ChannelEvent { action, name })) => {
                self.apply_remote_channel(action, &name).await;
            }
            (
                Target::Channel(channel),
                MessageContent::Member(MemberEvent {
                    action: MemberAction::Joined | MemberAction::RoleChanged,
                    username,
                    ..
                }),
            ) => {
                if let Some(channels) = self.directory()
                    && let Err(e) = channels.refresh_member(channel, &username).await
                {
                    warn!(channel = %channel, user = %username, error = %e, "failed to refresh remote member");
                }
            }
            (Target::Channel(channel), MessageContent::SketchUpdate(update)) => {
                if let Err(e) = self.sketches.apply_update(channel, &update) {
                    debug!(error = %e, "remote sketch update not applied");
                }
            }
            (Target::Channel(_), MessageContent::SketchCommand(command)) => {
                self.apply_remote_sketch_command(command).await;
            }
            _ => {}
        }
    }

    async fn apply_remote_channel(&self, action: ChannelAction, name: &str) {
        let Some(channels) = self.directory() else {
            return;
        };
        match action {
            ChannelAction::Created | ChannelAction::Updated => {
                if let Err(e) = channels.adopt_remote(name).await {
                    warn!(channel = %name, error = %e, "failed to adopt remote channel");
                }
            }
            ChannelAction::Deleted => {
                channels.drop_remote(name).await;
            }
        }
    }

    async fn apply_remote_sketch_command(&self, command: SketchCommand) {
        match command {
            SketchCommand::Create {
                sketch_id: Some(id),
                ..
            } => match self.sketches.load_sketch(&id).await {
                Ok(_) => info!(sketch_id = %id, "loaded remotely created sketch"),
                Err(e) => warn!(sketch_id = %id, error = %e, "failed to load remote sketch"),
            },
            SketchCommand::Delete { sketch_id } => {
                self.sketches.forget(&sketch_id);
            }
            SketchCommand::Clear { sketch_id } => {
                if let Some(sketch) = self.sketches.get(&sketch_id) {
                    sketch.clear();
                }
            }
            SketchCommand::Create { sketch_id: None, .. } => {}
        }
    }
}
