use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionId, ConnectionKind};
use crate::error::{CoreError, CoreResult};

/// All indices live under one lock so they are always updated together.
#[derive(Default)]
struct HubState {
    by_user: HashMap<String, Arc<Connection>>,
    by_system_user: HashMap<String, Arc<Connection>>,
    by_channel: HashMap<String, HashMap<ConnectionId, Arc<Connection>>>,
    channel_of: HashMap<ConnectionId, String>,
}

impl HubState {
    /// Unbind a socket from its channel. Returns the channel it was in.
    fn detach(&mut self, conn_id: ConnectionId) -> Option<String> {
        let channel = self.channel_of.remove(&conn_id)?;
        if let Some(members) = self.by_channel.get_mut(&channel) {
            members.remove(&conn_id);
        }
        Some(channel)
    }
}

/// A socket removed by the liveness check.
#[derive(Debug)]
pub struct ReapedSocket {
    pub conn: Arc<Connection>,
    /// Channel the socket was bound to when it was removed.
    pub channel: Option<String>,
}

/// Registry of live sockets, indexed by user, by channel and by kind.
///
/// The lock is never held across an await: senders take a snapshot of the
/// target connections and write after releasing it.
pub struct Hub {
    state: RwLock<HubState>,
    write_timeout: Duration,
}

impl Hub {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            write_timeout,
        }
    }

    // ── Channels ──────────────────────────────────────────────────────

    /// Create an empty member set for a channel.
    pub fn initialize_channel(&self, name: &str) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.by_channel.contains_key(name) {
            return Err(CoreError::Conflict(format!(
                "Channel {name} is already initialized"
            )));
        }
        state.by_channel.insert(name.to_string(), HashMap::new());
        Ok(())
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.state.read().by_channel.contains_key(name)
    }

    /// Drop a channel and unbind every socket in it. The sockets stay
    /// registered to their users. Returns the unbound connections.
    pub fn remove_all_clients_from_channel(&self, name: &str) -> Vec<Arc<Connection>> {
        let mut state = self.state.write();
        let Some(members) = state.by_channel.remove(name) else {
            return Vec::new();
        };
        for id in members.keys() {
            state.channel_of.remove(id);
        }
        members.into_values().collect()
    }

    // ── Connections ───────────────────────────────────────────────────

    /// Register a user's channel socket. One session per user.
    pub fn add_connection(&self, conn: Arc<Connection>) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.by_user.contains_key(&conn.username) {
            return Err(CoreError::Conflict(format!(
                "{} already has an active session",
                conn.username
            )));
        }
        state.by_user.insert(conn.username.clone(), conn);
        Ok(())
    }

    /// Register a user's system socket.
    pub fn add_system_connection(&self, conn: Arc<Connection>) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.by_system_user.contains_key(&conn.username) {
            return Err(CoreError::Conflict(format!(
                "{} already has an active system session",
                conn.username
            )));
        }
        state.by_system_user.insert(conn.username.clone(), conn);
        Ok(())
    }

    /// Bind a socket to a channel, unbinding it from any previous one.
    pub fn add_client_to_channel(&self, channel: &str, conn: &Arc<Connection>) -> CoreResult<()> {
        if conn.kind != ConnectionKind::Channel {
            return Err(CoreError::Validation(
                "System sockets cannot join channels".into(),
            ));
        }
        let mut state = self.state.write();
        if !state.by_channel.contains_key(channel) {
            return Err(CoreError::NotFound(format!("Channel {channel} not found")));
        }
        state.detach(conn.id);
        if let Some(members) = state.by_channel.get_mut(channel) {
            members.insert(conn.id, conn.clone());
        }
        state.channel_of.insert(conn.id, channel.to_string());
        Ok(())
    }

    /// Bind the user's registered channel socket, if any, to `channel`.
    /// Returns whether a socket was moved.
    pub fn move_user_to_channel(&self, username: &str, channel: &str) -> CoreResult<bool> {
        let Some(conn) = self.get_connection(username) else {
            return Ok(false);
        };
        self.add_client_to_channel(channel, &conn)?;
        Ok(true)
    }

    /// Unbind a socket from `channel`. No-op if it is bound elsewhere.
    pub fn remove_client_from_channel(&self, channel: &str, conn_id: ConnectionId) -> bool {
        let mut state = self.state.write();
        if state.channel_of.get(&conn_id).map(String::as_str) != Some(channel) {
            return false;
        }
        state.detach(conn_id);
        true
    }

    /// Unbind whatever socket `username` has in `channel`.
    pub fn remove_user_from_channel(&self, channel: &str, username: &str) -> bool {
        let Some(conn) = self.get_connection(username) else {
            return false;
        };
        self.remove_client_from_channel(channel, conn.id)
    }

    /// Remove a channel socket from every index. Only the exact connection
    /// is removed, so a stale reader cannot evict a newer session.
    pub fn remove_connection(&self, conn: &Connection) -> bool {
        self.take_connection(conn).is_some()
    }

    /// Like `remove_connection`, reporting the channel the socket was bound
    /// to. `None` when the socket was no longer registered.
    fn take_connection(&self, conn: &Connection) -> Option<Option<String>> {
        let mut state = self.state.write();
        match state.by_user.get(&conn.username) {
            Some(current) if current.id == conn.id => {}
            _ => return None,
        }
        state.by_user.remove(&conn.username);
        Some(state.detach(conn.id))
    }

    /// Remove a system socket.
    pub fn remove_system_connection(&self, conn: &Connection) -> bool {
        let mut state = self.state.write();
        match state.by_system_user.get(&conn.username) {
            Some(current) if current.id == conn.id => {}
            _ => return false,
        }
        state.by_system_user.remove(&conn.username);
        true
    }

    fn purge(&self, conn: &Connection) -> Option<Option<String>> {
        match conn.kind {
            ConnectionKind::Channel => self.take_connection(conn),
            ConnectionKind::System => self.remove_system_connection(conn).then_some(None),
        }
    }

    // ── Lookups ───────────────────────────────────────────────────────

    pub fn get_connection(&self, username: &str) -> Option<Arc<Connection>> {
        self.state.read().by_user.get(username).cloned()
    }

    pub fn get_system_connection(&self, username: &str) -> Option<Arc<Connection>> {
        self.state.read().by_system_user.get(username).cloned()
    }

    /// Channel the user's socket is currently bound to.
    pub fn get_user_channel(&self, username: &str) -> Option<String> {
        let state = self.state.read();
        let conn = state.by_user.get(username)?;
        state.channel_of.get(&conn.id).cloned()
    }

    /// Usernames with a socket bound to `channel`, sorted.
    pub fn get_online_users_in_channel(&self, channel: &str) -> Vec<String> {
        let state = self.state.read();
        let mut users: Vec<String> = state
            .by_channel
            .get(channel)
            .map(|members| members.values().map(|c| c.username.clone()).collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn connection_count(&self) -> usize {
        let state = self.state.read();
        state.by_user.len() + state.by_system_user.len()
    }

    // ── Fan-out ───────────────────────────────────────────────────────

    /// Write a frame to every socket bound to `channel`. Write failures are
    /// left for the liveness check. Returns how many sockets accepted it.
    pub async fn notify_channel(&self, channel: &str, frame: Utf8Bytes) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let state = self.state.read();
            match state.by_channel.get(channel) {
                Some(members) => members.values().cloned().collect(),
                None => return 0,
            }
        };
        self.write_all(targets, frame).await
    }

    /// Write a frame to a user's channel socket.
    pub async fn notify_user(&self, username: &str, frame: Utf8Bytes) -> bool {
        let Some(conn) = self.get_connection(username) else {
            return false;
        };
        self.write_all(vec![conn], frame).await == 1
    }

    /// Write a frame to every socket, channel and system alike.
    pub async fn notify_all(&self, frame: Utf8Bytes) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let state = self.state.read();
            state
                .by_user
                .values()
                .chain(state.by_system_user.values())
                .cloned()
                .collect()
        };
        self.write_all(targets, frame).await
    }

    async fn write_all(&self, targets: Vec<Arc<Connection>>, frame: Utf8Bytes) -> usize {
        let deadline = self.write_timeout;
        let results = join_all(targets.iter().map(|conn| {
            let frame = frame.clone();
            async move {
                let result = conn.send_text(frame, deadline).await;
                if let Err(e) = &result {
                    debug!(user = %conn.username, error = %e, "dropped frame");
                }
                result.is_ok()
            }
        }))
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    // ── Liveness ──────────────────────────────────────────────────────

    /// Ping every socket once. Sockets that fail are closed and purged from
    /// all indices. Returns the reaped sockets; a socket already removed by
    /// its own reader is closed but not reported.
    pub async fn ping_connections(&self) -> Vec<ReapedSocket> {
        let targets: Vec<Arc<Connection>> = {
            let state = self.state.read();
            state
                .by_user
                .values()
                .chain(state.by_system_user.values())
                .cloned()
                .collect()
        };
        let deadline = self.write_timeout;
        let results = join_all(targets.into_iter().map(|conn| async move {
            let alive = conn.ping(deadline).await.is_ok();
            (conn, alive)
        }))
        .await;

        let mut reaped = Vec::new();
        for (conn, alive) in results {
            if alive {
                continue;
            }
            let purged = self.purge(&conn);
            conn.close(deadline).await;
            if let Some(channel) = purged {
                warn!(user = %conn.username, kind = ?conn.kind, "reaping dead socket");
                reaped.push(ReapedSocket { conn, channel });
            }
        }
        reaped
    }

    /// Close every socket. Used at shutdown.
    pub async fn close_all(&self) {
        let targets: Vec<Arc<Connection>> = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let conns = state
                .by_user
                .drain()
                .chain(state.by_system_user.drain())
                .map(|(_, c)| c)
                .collect();
            state.channel_of.clear();
            for members in state.by_channel.values_mut() {
                members.clear();
            }
            conns
        };
        let deadline = self.write_timeout;
        join_all(targets.iter().map(|c| c.close(deadline))).await;
    }

    /// Cross-check the two channel indices.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.state.read();
        for (channel, members) in &state.by_channel {
            for id in members.keys() {
                assert_eq!(state.channel_of.get(id), Some(channel));
            }
        }
        for (id, channel) in &state.channel_of {
            assert!(state.by_channel.get(channel).is_some_and(|m| m.contains_key(id)));
        }
    }
}
