use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::broadcast::Broadcaster;
use super::channel::{ChannelMember, ChannelState};
use super::connection::Connection;
use super::events::{
    ChannelAction, ChannelEvent, ChatMessage, MemberAction, MemberEvent, MessageContent,
};
use super::hub::Hub;
use super::sketch::SketchEngine;
use super::{validation, with_deadline};
use crate::auth::token::{hash_password, verify_password};
use crate::db::models::ChannelRow;
use crate::db::queries::{channels, messages, sketches};
use crate::error::{CoreError, CoreResult};
use crate::pubsub::PubSub;
use crate::pubsub::relay::{Relay, Target};

/// Input to [`ChannelManager::create`].
#[derive(Debug, Clone)]
pub struct NewChannelRequest {
    pub name: String,
    pub description: Option<String>,
    /// Setting a password makes the channel private.
    pub password: Option<String>,
    pub creator: String,
}

/// Channel summary returned to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_private: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub member_count: usize,
    pub online_users: Vec<String>,
    pub is_member: bool,
    pub is_admin: bool,
}

/// Owns channel lifecycle and membership. Every mutation keeps the store,
/// the hub and the pub/sub subscriptions in agreement; the store is
/// authoritative.
pub struct ChannelManager {
    pool: SqlitePool,
    hub: Arc<Hub>,
    pubsub: Arc<dyn PubSub>,
    relay: Arc<Relay>,
    broadcaster: Arc<Broadcaster>,
    sketches: Arc<SketchEngine>,
    channels: DashMap<String, Arc<ChannelState>>,
    op_timeout: Duration,
    /// Server-wide shutdown signal; subscription relays stop when it fires.
    shutdown: CancellationToken,
}

impl ChannelManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        hub: Arc<Hub>,
        pubsub: Arc<dyn PubSub>,
        relay: Arc<Relay>,
        broadcaster: Arc<Broadcaster>,
        sketches: Arc<SketchEngine>,
        op_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            hub,
            pubsub,
            relay,
            broadcaster,
            sketches,
            channels: DashMap::new(),
            op_timeout,
            shutdown,
        }
    }

    // ── Startup loading ─────────────────────────────────────────────

    /// Load channels and memberships from the database, then initialise each
    /// channel in the hub and subscribe to its topic.
    pub async fn load_from_store(&self) -> CoreResult<usize> {
        let rows = channels::list_channels(&self.pool).await?;
        for row in &rows {
            self.install(row).await?;
        }
        info!(count = rows.len(), "loaded channels from database");
        Ok(rows.len())
    }

    /// Bring a stored channel live on this instance.
    async fn install(&self, row: &ChannelRow) -> CoreResult<()> {
        let members = channels::get_members(&self.pool, &row.name).await?;
        let state = Arc::new(ChannelState::from_row(row, &members));
        if let Err(e) = self.hub.initialize_channel(&row.name) {
            warn!(channel = %row.name, error = %e, "channel already present in hub");
        }
        self.attach_subscription(&row.name).await?;
        self.channels.insert(row.name.clone(), state);
        Ok(())
    }

    async fn attach_subscription(&self, name: &str) -> CoreResult<()> {
        let subscription = self.pubsub.subscribe(name).await?;
        self.relay.spawn(
            Target::Channel(name.to_string()),
            subscription,
            self.shutdown.child_token(),
        );
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<Arc<ChannelState>> {
        self.channels.get(name).map(|c| c.value().clone())
    }

    /// The channel, if `username` is a member of it.
    pub fn require_member(&self, name: &str, username: &str) -> CoreResult<Arc<ChannelState>> {
        let channel = self
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("Channel {name} not found")))?;
        if !channel.is_member(username) {
            return Err(CoreError::Forbidden(format!(
                "You are not a member of {name}"
            )));
        }
        Ok(channel)
    }

    /// Every channel, annotated from `username`'s point of view.
    pub fn list(&self, username: &str) -> Vec<ChannelInfo> {
        let mut list: Vec<ChannelInfo> = self
            .channels
            .iter()
            .map(|c| self.info(&c, username))
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    fn info(&self, channel: &ChannelState, username: &str) -> ChannelInfo {
        let member = channel.member(username);
        ChannelInfo {
            name: channel.name.clone(),
            description: channel.description.clone(),
            is_private: channel.is_private(),
            created_by: channel.created_by.clone(),
            created_at: channel.created_at,
            member_count: channel.member_count(),
            online_users: self.hub.get_online_users_in_channel(&channel.name),
            is_member: member.is_some(),
            is_admin: member.is_some_and(|m| m.is_admin),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create a channel with its creator as the first admin.
    ///
    /// The hub entry and the subscription are set up first and torn down
    /// again if the store insert fails, so no transaction is held open
    /// across a pub/sub call.
    pub async fn create(&self, request: NewChannelRequest) -> CoreResult<ChannelInfo> {
        let NewChannelRequest {
            name,
            description,
            password,
            creator,
        } = request;
        validation::validate_channel_name(&name).map_err(CoreError::Validation)?;
        validation::validate_username(&creator).map_err(CoreError::Validation)?;
        if let Some(description) = &description {
            validation::validate_description(description).map_err(CoreError::Validation)?;
        }
        let hashed_password = match password.as_deref() {
            Some(pw) => {
                validation::validate_password(pw).map_err(CoreError::Validation)?;
                Some(hash_password(pw).map_err(|e| CoreError::Internal(e.to_string()))?)
            }
            None => None,
        };
        if self.channels.contains_key(&name) {
            return Err(CoreError::Conflict(format!("Channel {name} already exists")));
        }

        self.hub.initialize_channel(&name)?;
        let subscription = match self.pubsub.subscribe(&name).await {
            Ok(sub) => sub,
            Err(e) => {
                self.hub.remove_all_clients_from_channel(&name);
                return Err(e);
            }
        };

        let now = Utc::now();
        let stored = with_deadline(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            channels::insert_channel(
                &mut *tx,
                &channels::NewChannel {
                    name: &name,
                    description: description.as_deref(),
                    hashed_password: hashed_password.as_deref(),
                    created_by: &creator,
                    created_at: now,
                },
            )
            .await?;
            channels::add_member(&mut *tx, &name, &creator, true, now).await?;
            tx.commit().await?;
            Ok::<_, CoreError>(())
        })
        .await;

        if let Err(e) = stored {
            drop(subscription);
            if let Err(unsub) = self.pubsub.unsubscribe(&name).await {
                warn!(channel = %name, error = %unsub, "unsubscribe during rollback failed");
            }
            self.hub.remove_all_clients_from_channel(&name);
            return Err(e);
        }

        self.relay.spawn(
            Target::Channel(name.clone()),
            subscription,
            self.shutdown.child_token(),
        );
        let state = Arc::new(ChannelState::new(
            name.clone(),
            description,
            hashed_password,
            creator.clone(),
            now,
        ));
        self.channels.insert(name.clone(), state.clone());
        info!(channel = %name, private = state.is_private(), "channel created by {}", creator);

        self.broadcaster
            .to_all(&ChatMessage::server(
                None,
                MessageContent::Channel(ChannelEvent {
                    action: ChannelAction::Created,
                    name: name.clone(),
                }),
            ))
            .await;
        Ok(self.info(&state, &creator))
    }

    /// Join a channel, moving the user's socket out of any other channel.
    /// Private channels require the password. Membership rows are sticky:
    /// rejoining keeps the original row.
    pub async fn join(
        &self,
        name: &str,
        username: &str,
        password: Option<&str>,
    ) -> CoreResult<ChannelInfo> {
        let channel = self
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("Channel {name} not found")))?;

        // The password gates first entry only; members come and go freely.
        if !channel.is_member(username)
            && let Some(hash) = &channel.hashed_password
        {
            let Some(password) = password else {
                return Err(CoreError::Forbidden("This channel requires a password".into()));
            };
            if !verify_password(password, hash) {
                return Err(CoreError::Forbidden("Incorrect channel password".into()));
            }
        }

        let now = Utc::now();
        let row = with_deadline(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            channels::add_member(&mut *tx, name, username, username == channel.created_by, now)
                .await?;
            let row = channels::get_member(&mut *tx, name, username)
                .await?
                .ok_or_else(|| CoreError::Internal("membership row missing after insert".into()))?;
            tx.commit().await?;
            Ok::<_, CoreError>(row)
        })
        .await?;
        channel.add_member(username, ChannelMember::from(&row));

        if let Some(previous) = self.hub.get_user_channel(username)
            && previous != name
        {
            self.hub.remove_user_from_channel(&previous, username);
            self.announce_member(&previous, username, MemberAction::Left, None)
                .await;
        }
        self.hub.move_user_to_channel(username, name)?;
        self.announce_member(name, username, MemberAction::Joined, Some(row.is_admin))
            .await;

        info!(channel = %name, "{} joined", username);
        Ok(self.info(&channel, username))
    }

    /// Leave a channel. Only presence changes; the membership row stays.
    pub async fn leave(&self, name: &str, username: &str) -> CoreResult<()> {
        self.require_member(name, username)?;
        if self.hub.remove_user_from_channel(name, username) {
            self.announce_member(name, username, MemberAction::Left, None)
                .await;
            info!(channel = %name, "{} left", username);
        }
        Ok(())
    }

    /// Drop a closed channel socket from the hub and tell the channel it
    /// was bound to. A socket already replaced by a newer session is left
    /// alone. Returns whether the socket was still registered.
    pub async fn disconnect(&self, conn: &Connection) -> bool {
        let channel = self
            .hub
            .get_connection(&conn.username)
            .filter(|current| current.id == conn.id)
            .and_then(|_| self.hub.get_user_channel(&conn.username));
        if !self.hub.remove_connection(conn) {
            return false;
        }
        if let Some(channel) = channel {
            self.announce_member(&channel, &conn.username, MemberAction::Left, None)
                .await;
        }
        true
    }

    /// Delete a channel with its memberships, sketches and messages.
    /// Admins only.
    pub async fn delete(&self, name: &str, requester: &str) -> CoreResult<()> {
        let channel = self
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("Channel {name} not found")))?;
        if !channel.is_admin(requester) {
            return Err(CoreError::Forbidden(
                "Only channel admins can delete a channel".into(),
            ));
        }

        with_deadline(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            let is_admin = channels::get_member(&mut *tx, name, requester)
                .await?
                .is_some_and(|m| m.is_admin);
            if !is_admin {
                return Err(CoreError::Forbidden(
                    "Only channel admins can delete a channel".into(),
                ));
            }
            channels::delete_members(&mut *tx, name).await?;
            sketches::delete_channel_sketches(&mut *tx, name).await?;
            messages::delete_channel_messages(&mut *tx, name).await?;
            channels::delete_channel(&mut *tx, name).await?;
            tx.commit().await?;
            Ok::<_, CoreError>(())
        })
        .await?;

        self.teardown(name).await;
        info!(channel = %name, "channel deleted by {}", requester);

        self.broadcaster
            .to_all(&ChatMessage::server(
                None,
                MessageContent::Channel(ChannelEvent {
                    action: ChannelAction::Deleted,
                    name: name.to_string(),
                }),
            ))
            .await;
        Ok(())
    }

    /// Drop every local trace of a channel that no longer exists in the
    /// store. Returns whether it was live here.
    async fn teardown(&self, name: &str) -> bool {
        let was_live = self.channels.remove(name).is_some();
        self.sketches.remove_channel(name);
        self.hub.remove_all_clients_from_channel(name);
        if let Err(e) = self.pubsub.unsubscribe(name).await {
            error!(channel = %name, error = %e, "unsubscribe after delete failed");
        }
        was_live
    }

    /// Grant or revoke admin. The last admin of a channel cannot be demoted.
    pub async fn update_member_role(
        &self,
        name: &str,
        target: &str,
        is_admin: bool,
        updater: &str,
    ) -> CoreResult<()> {
        let channel = self
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("Channel {name} not found")))?;
        if !channel.is_admin(updater) {
            return Err(CoreError::Forbidden(
                "Only channel admins can change roles".into(),
            ));
        }
        let Some(current) = channel.member(target) else {
            return Err(CoreError::NotFound(format!(
                "{target} is not a member of {name}"
            )));
        };
        if current.is_admin == is_admin {
            return Ok(());
        }

        with_deadline(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            if !is_admin && channels::count_admins(&mut *tx, name).await? <= 1 {
                return Err(CoreError::Conflict(
                    "Cannot demote the last admin of a channel".into(),
                ));
            }
            if !channels::set_member_admin(&mut *tx, name, target, is_admin).await? {
                return Err(CoreError::NotFound(format!(
                    "{target} is not a member of {name}"
                )));
            }
            tx.commit().await?;
            Ok::<_, CoreError>(())
        })
        .await?;

        channel.set_admin(target, is_admin);
        self.announce_member(name, target, MemberAction::RoleChanged, Some(is_admin))
            .await;
        info!(channel = %name, target = %target, is_admin, "role updated by {}", updater);
        Ok(())
    }

    // ── Changes made on other instances ─────────────────────────────

    /// Bring up a channel another instance created. Returns false when it is
    /// already live here or no longer stored.
    pub async fn adopt_remote(&self, name: &str) -> CoreResult<bool> {
        if self.channels.contains_key(name) {
            return Ok(false);
        }
        let Some(row) = channels::get_channel(&self.pool, name).await? else {
            return Ok(false);
        };
        self.install(&row).await?;
        info!(channel = %name, "adopted channel created on another instance");
        Ok(true)
    }

    /// Tear down a channel another instance deleted.
    pub async fn drop_remote(&self, name: &str) {
        if self.teardown(name).await {
            info!(channel = %name, "dropped channel deleted on another instance");
        }
    }

    /// Re-read one membership row after another instance changed it.
    pub async fn refresh_member(&self, name: &str, username: &str) -> CoreResult<()> {
        let Some(channel) = self.get(name) else {
            return Ok(());
        };
        if let Some(row) = channels::get_member(&self.pool, name, username).await?
            && !channel.add_member(username, ChannelMember::from(&row))
        {
            channel.set_admin(username, row.is_admin);
        }
        Ok(())
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Ping every socket each `interval` until `cancel` fires. A reaped
    /// channel socket is announced as `Left` in the channel it was bound to.
    pub async fn run_liveness(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        info!("liveness check running every {:?}", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_dead_sockets().await;
                }
            }
        }
        info!("liveness check stopped");
    }

    /// One liveness pass. Returns the number of sockets reaped.
    pub async fn reap_dead_sockets(&self) -> usize {
        let reaped = self.hub.ping_connections().await;
        for socket in &reaped {
            if let Some(channel) = &socket.channel {
                self.announce_member(channel, &socket.conn.username, MemberAction::Left, None)
                    .await;
            }
        }
        if !reaped.is_empty() {
            info!("liveness check reaped {} sockets", reaped.len());
        }
        reaped.len()
    }

    /// Note the time of a member's latest chat message.
    pub fn record_message(&self, name: &str, username: &str, at: DateTime<Utc>) {
        if let Some(channel) = self.get(name) {
            channel.touch_last_message(username, at);
        }
    }

    async fn announce_member(
        &self,
        channel: &str,
        username: &str,
        action: MemberAction,
        is_admin: Option<bool>,
    ) {
        let message = ChatMessage::server(
            Some(channel),
            MessageContent::Member(MemberEvent {
                action,
                username: username.to_string(),
                is_admin,
            }),
        );
        self.broadcaster.to_channel(channel, &message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::test_pool;
    use crate::db::queries::users;
    use crate::engine::connection::{ConnectionKind, drain_text, test_connection};
    use crate::engine::sketch::SketchLimits;
    use crate::pubsub::local::LocalBroker;
    use uuid::Uuid;

    struct Fixture {
        manager: ChannelManager,
        hub: Arc<Hub>,
        broker: Arc<LocalBroker>,
        pool: SqlitePool,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        for name in ["alice", "bob", "carol"] {
            users::create_user(&pool, name, "hash", Utc::now())
                .await
                .unwrap();
        }
        let hub = Arc::new(Hub::new(Duration::from_millis(500)));
        let broker = Arc::new(LocalBroker::new());
        let instance_id = Uuid::new_v4();
        let sketches = Arc::new(SketchEngine::new(
            pool.clone(),
            SketchLimits::default(),
            Duration::from_secs(5),
        ));
        let relay = Arc::new(Relay::new(hub.clone(), sketches.clone(), instance_id));
        let broadcaster = Arc::new(Broadcaster::new(hub.clone(), broker.clone(), instance_id));
        let manager = ChannelManager::new(
            pool.clone(),
            hub.clone(),
            broker.clone(),
            relay,
            broadcaster,
            sketches,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        Fixture {
            manager,
            hub,
            broker,
            pool,
        }
    }

    fn request(name: &str, creator: &str, password: Option<&str>) -> NewChannelRequest {
        NewChannelRequest {
            name: name.into(),
            description: Some("test channel".into()),
            password: password.map(str::to_string),
            creator: creator.into(),
        }
    }

    #[tokio::test]
    async fn test_create_sets_up_store_hub_and_subscription() {
        let f = fixture().await;
        let info = f.manager.create(request("general", "alice", None)).await.unwrap();
        assert!(info.is_admin);
        assert!(!info.is_private);

        assert!(channels::get_channel(&f.pool, "general").await.unwrap().is_some());
        assert!(f.hub.has_channel("general"));
        assert!(f.broker.is_subscribed("general"));
        let member = channels::get_member(&f.pool, "general", "alice")
            .await
            .unwrap()
            .unwrap();
        assert!(member.is_admin);
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts_and_leaves_state_intact() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        let err = f
            .manager
            .create(request("general", "bob", None))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(f.hub.has_channel("general"));
        assert!(f.broker.is_subscribed("general"));
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_hub_and_subscription() {
        let f = fixture().await;
        // A row the in-memory map doesn't know about makes the insert fail.
        channels::insert_channel(
            &f.pool,
            &channels::NewChannel {
                name: "ghost",
                description: None,
                hashed_password: None,
                created_by: "carol",
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let err = f.manager.create(request("ghost", "alice", None)).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(!f.hub.has_channel("ghost"));
        assert!(!f.broker.is_subscribed("ghost"));
        assert!(f.manager.get("ghost").is_none());
    }

    #[tokio::test]
    async fn test_invalid_create_is_rejected_before_side_effects() {
        let f = fixture().await;
        let err = f.manager.create(request("", "alice", None)).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        let err = f
            .manager
            .create(request("vip", "alice", Some("")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(!f.hub.has_channel("vip"));
    }

    #[tokio::test]
    async fn test_private_channel_password_gate() {
        let f = fixture().await;
        let info = f
            .manager
            .create(request("vip", "alice", Some("s3cret")))
            .await
            .unwrap();
        assert!(info.is_private);

        let err = f.manager.join("vip", "bob", Some("wrong")).await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
        let err = f.manager.join("vip", "bob", None).await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        let info = f.manager.join("vip", "bob", Some("s3cret")).await.unwrap();
        assert!(info.is_member);
        assert!(!info.is_admin);
    }

    #[tokio::test]
    async fn test_member_rejoins_private_channel_without_password() {
        let f = fixture().await;
        f.manager
            .create(request("vip", "alice", Some("s3cret")))
            .await
            .unwrap();
        f.manager.join("vip", "bob", Some("s3cret")).await.unwrap();
        f.manager.leave("vip", "bob").await.unwrap();
        f.manager.join("vip", "bob", None).await.unwrap();
        f.manager.join("vip", "alice", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_announces_departure() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        let (alice, mut alice_rx) = test_connection("alice", ConnectionKind::Channel);
        let (bob, _bob_rx) = test_connection("bob", ConnectionKind::Channel);
        let alice = Arc::new(alice);
        let bob = Arc::new(bob);
        f.hub.add_connection(alice.clone()).unwrap();
        f.hub.add_connection(bob.clone()).unwrap();
        f.manager.join("general", "alice", None).await.unwrap();
        f.manager.join("general", "bob", None).await.unwrap();
        drain_text(&mut alice_rx);

        assert!(f.manager.disconnect(&bob).await);
        assert!(!f.manager.disconnect(&bob).await);
        assert_eq!(f.hub.get_online_users_in_channel("general"), vec!["alice"]);
        let frames = drain_text(&mut alice_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"left\""));
    }

    #[tokio::test]
    async fn test_join_unknown_channel() {
        let f = fixture().await;
        let err = f.manager.join("nowhere", "bob", None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_join_moves_presence_and_keeps_membership() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        f.manager.create(request("random", "alice", None)).await.unwrap();

        let (conn, mut rx) = test_connection("bob", ConnectionKind::Channel);
        f.hub.add_connection(Arc::new(conn)).unwrap();

        f.manager.join("general", "bob", None).await.unwrap();
        assert_eq!(f.hub.get_user_channel("bob").as_deref(), Some("general"));
        f.manager.join("random", "bob", None).await.unwrap();
        assert_eq!(f.hub.get_user_channel("bob").as_deref(), Some("random"));
        assert!(f.hub.get_online_users_in_channel("general").is_empty());

        // Sticky membership: still a member of the channel they moved away from.
        assert!(f.manager.get("general").unwrap().is_member("bob"));
        assert!(
            channels::get_member(&f.pool, "general", "bob")
                .await
                .unwrap()
                .is_some()
        );

        let frames = drain_text(&mut rx);
        assert!(frames.iter().any(|frame| frame.contains("\"joined\"")));
    }

    #[tokio::test]
    async fn test_leave_keeps_membership_row() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        let (conn, _rx) = test_connection("bob", ConnectionKind::Channel);
        f.hub.add_connection(Arc::new(conn)).unwrap();
        f.manager.join("general", "bob", None).await.unwrap();

        f.manager.leave("general", "bob").await.unwrap();
        assert_eq!(f.hub.get_user_channel("bob"), None);
        assert!(f.manager.get("general").unwrap().is_member("bob"));

        let err = f.manager.leave("general", "carol").await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_leave_elsewhere_is_silent() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        f.manager.create(request("random", "alice", None)).await.unwrap();
        let (bob, _bob_rx) = test_connection("bob", ConnectionKind::Channel);
        let (carol, mut carol_rx) = test_connection("carol", ConnectionKind::Channel);
        f.hub.add_connection(Arc::new(bob)).unwrap();
        f.hub.add_connection(Arc::new(carol)).unwrap();
        f.manager.join("random", "carol", None).await.unwrap();
        f.manager.join("random", "bob", None).await.unwrap();
        f.manager.join("general", "bob", None).await.unwrap();
        drain_text(&mut carol_rx);

        // Bob's socket is bound to general; leaving random changes nothing.
        f.manager.leave("random", "bob").await.unwrap();
        assert!(drain_text(&mut carol_rx).is_empty());
        assert_eq!(f.hub.get_user_channel("bob").as_deref(), Some("general"));
    }

    #[tokio::test]
    async fn test_reaped_socket_is_announced_as_left() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        let (alice, mut alice_rx) = test_connection("alice", ConnectionKind::Channel);
        let (bob, bob_rx) = test_connection("bob", ConnectionKind::Channel);
        f.hub.add_connection(Arc::new(alice)).unwrap();
        f.hub.add_connection(Arc::new(bob)).unwrap();
        f.manager.join("general", "alice", None).await.unwrap();
        f.manager.join("general", "bob", None).await.unwrap();
        drain_text(&mut alice_rx);

        drop(bob_rx);
        assert_eq!(f.manager.reap_dead_sockets().await, 1);
        assert_eq!(f.manager.reap_dead_sockets().await, 0);

        let frames = drain_text(&mut alice_rx);
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["type"], "MEMBER");
        assert_eq!(value["content"]["action"], "left");
        assert_eq!(value["content"]["username"], "bob");
        assert!(f.manager.get("general").unwrap().is_member("bob"));
    }

    #[tokio::test]
    async fn test_remote_channel_changes_are_applied() {
        let f = fixture().await;
        // Rows written by another instance over the same database.
        channels::insert_channel(
            &f.pool,
            &channels::NewChannel {
                name: "remote",
                description: None,
                hashed_password: None,
                created_by: "carol",
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        channels::add_member(&f.pool, "remote", "carol", true, Utc::now())
            .await
            .unwrap();

        assert!(f.manager.adopt_remote("remote").await.unwrap());
        assert!(!f.manager.adopt_remote("remote").await.unwrap());
        assert!(!f.manager.adopt_remote("missing").await.unwrap());
        assert!(f.hub.has_channel("remote"));
        assert!(f.broker.is_subscribed("remote"));
        assert!(f.manager.get("remote").unwrap().is_admin("carol"));

        channels::add_member(&f.pool, "remote", "bob", false, Utc::now())
            .await
            .unwrap();
        f.manager.refresh_member("remote", "bob").await.unwrap();
        assert!(f.manager.require_member("remote", "bob").is_ok());
        assert!(!f.manager.get("remote").unwrap().is_admin("bob"));

        channels::set_member_admin(&f.pool, "remote", "bob", true)
            .await
            .unwrap();
        f.manager.refresh_member("remote", "bob").await.unwrap();
        assert!(f.manager.get("remote").unwrap().is_admin("bob"));

        f.manager.drop_remote("remote").await;
        assert!(f.manager.get("remote").is_none());
        assert!(!f.hub.has_channel("remote"));
        assert!(!f.broker.is_subscribed("remote"));
    }

    #[tokio::test]
    async fn test_delete_requires_admin_and_removes_everything() {
        let f = fixture().await;
        f.manager.create(request("vip", "alice", Some("s3cret"))).await.unwrap();
        f.manager.join("vip", "bob", Some("s3cret")).await.unwrap();

        let err = f.manager.delete("vip", "carol").await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
        let err = f.manager.delete("vip", "bob").await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        let (sys, mut rx) = test_connection("bob", ConnectionKind::System);
        f.hub.add_system_connection(Arc::new(sys)).unwrap();

        f.manager.delete("vip", "alice").await.unwrap();
        assert!(channels::get_channel(&f.pool, "vip").await.unwrap().is_none());
        assert!(channels::get_members(&f.pool, "vip").await.unwrap().is_empty());
        assert!(!f.hub.has_channel("vip"));
        assert!(!f.broker.is_subscribed("vip"));
        assert!(f.manager.get("vip").is_none());

        let frames = drain_text(&mut rx);
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["type"], "CHANNEL");
        assert_eq!(value["content"]["action"], "deleted");
        assert_eq!(value["content"]["name"], "vip");
    }

    #[tokio::test]
    async fn test_last_admin_cannot_be_demoted() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        f.manager.join("general", "bob", None).await.unwrap();

        let err = f
            .manager
            .update_member_role("general", "alice", false, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let err = f
            .manager
            .update_member_role("general", "bob", true, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        f.manager
            .update_member_role("general", "bob", true, "alice")
            .await
            .unwrap();
        // With a second admin, alice may step down.
        f.manager
            .update_member_role("general", "alice", false, "alice")
            .await
            .unwrap();
        assert_eq!(channels::count_admins(&f.pool, "general").await.unwrap(), 1);
        assert!(f.manager.get("general").unwrap().is_admin("bob"));
    }

    #[tokio::test]
    async fn test_sole_admin_can_delete() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        f.manager.delete("general", "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_load_from_store_restores_channels() {
        let f = fixture().await;
        f.manager.create(request("general", "alice", None)).await.unwrap();
        f.manager.join("general", "bob", None).await.unwrap();

        // A fresh instance over the same database.
        let hub = Arc::new(Hub::new(Duration::from_millis(500)));
        let broker = Arc::new(LocalBroker::new());
        let id = Uuid::new_v4();
        let sketches = Arc::new(SketchEngine::new(
            f.pool.clone(),
            SketchLimits::default(),
            Duration::from_secs(5),
        ));
        let restored = ChannelManager::new(
            f.pool.clone(),
            hub.clone(),
            broker.clone(),
            Arc::new(Relay::new(hub.clone(), sketches.clone(), id)),
            Arc::new(Broadcaster::new(hub.clone(), broker.clone(), id)),
            sketches,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        assert_eq!(restored.load_from_store().await.unwrap(), 1);
        assert!(hub.has_channel("general"));
        assert!(broker.is_subscribed("general"));
        let channel = restored.get("general").unwrap();
        assert!(channel.is_admin("alice"));
        assert!(channel.is_member("bob"));

        let list = restored.list("bob");
        assert_eq!(list.len(), 1);
        assert!(list[0].is_member);
        assert!(!list[0].is_admin);
    }
}
