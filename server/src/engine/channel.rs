use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::db::models::{ChannelMemberRow, ChannelRow};

/// A member's standing in one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMember {
    pub is_admin: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl From<&ChannelMemberRow> for ChannelMember {
    fn from(row: &ChannelMemberRow) -> Self {
        Self {
            is_admin: row.is_admin,
            joined_at: row.joined_at,
            last_message_at: row.last_message,
        }
    }
}

/// In-memory state for a single channel. The member table has its own lock.
#[derive(Debug)]
pub struct ChannelState {
    pub name: String,
    pub description: Option<String>,
    pub hashed_password: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    members: RwLock<HashMap<String, ChannelMember>>,
}

impl ChannelState {
    /// A fresh channel whose only member is its creator, as admin.
    pub fn new(
        name: String,
        description: Option<String>,
        hashed_password: Option<String>,
        created_by: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        let creator = ChannelMember {
            is_admin: true,
            joined_at: created_at,
            last_message_at: None,
        };
        Self {
            members: RwLock::new(HashMap::from([(created_by.clone(), creator)])),
            name,
            description,
            hashed_password,
            created_by,
            created_at,
        }
    }

    pub fn from_row(row: &ChannelRow, members: &[ChannelMemberRow]) -> Self {
        Self {
            name: row.name.clone(),
            description: row.description.clone(),
            hashed_password: row.hashed_password.clone(),
            created_by: row.created_by.clone(),
            created_at: row.created_at,
            members: RwLock::new(
                members
                    .iter()
                    .map(|m| (m.username.clone(), ChannelMember::from(m)))
                    .collect(),
            ),
        }
    }

    /// Private exactly when a password is set.
    pub fn is_private(&self) -> bool {
        self.hashed_password.is_some()
    }

    pub fn member(&self, username: &str) -> Option<ChannelMember> {
        self.members.read().get(username).cloned()
    }

    pub fn is_member(&self, username: &str) -> bool {
        self.members.read().contains_key(username)
    }

    pub fn is_admin(&self, username: &str) -> bool {
        self.members
            .read()
            .get(username)
            .is_some_and(|m| m.is_admin)
    }

    pub fn admin_count(&self) -> usize {
        self.members.read().values().filter(|m| m.is_admin).count()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Snapshot of the member table, sorted by username.
    pub fn members(&self) -> Vec<(String, ChannelMember)> {
        let mut list: Vec<(String, ChannelMember)> = self
            .members
            .read()
            .iter()
            .map(|(u, m)| (u.clone(), m.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Insert a member unless one already exists. Returns whether inserted.
    pub fn add_member(&self, username: &str, member: ChannelMember) -> bool {
        let mut members = self.members.write();
        if members.contains_key(username) {
            return false;
        }
        members.insert(username.to_string(), member);
        true
    }

    pub fn set_admin(&self, username: &str, is_admin: bool) -> bool {
        match self.members.write().get_mut(username) {
            Some(m) => {
                m.is_admin = is_admin;
                true
            }
            None => false,
        }
    }

    pub fn touch_last_message(&self, username: &str, at: DateTime<Utc>) {
        if let Some(m) = self.members.write().get_mut(username) {
            m.last_message_at = Some(at);
        }
    }
}
