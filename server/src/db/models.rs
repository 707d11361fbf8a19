use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered account. The password hash never leaves the auth boundary.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub username: String,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Online flag and last-seen timestamp for a user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserStatusRow {
    pub username: String,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A stored channel from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelRow {
    pub name: String,
    pub is_private: bool,
    pub description: Option<String>,
    pub hashed_password: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A channel membership record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChannelMemberRow {
    pub channel_name: String,
    pub username: String,
    pub is_admin: bool,
    pub joined_at: DateTime<Utc>,
    pub last_message: Option<DateTime<Utc>>,
}

/// A stored message. `content` is the JSON form of the typed payload.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub channel_name: String,
    pub username: String,
    pub message_type: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Sketch metadata.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SketchRow {
    pub id: String,
    pub channel_name: String,
    pub display_name: String,
    pub width: i64,
    pub height: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted sketch region in its run-length encoded form.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SketchRegionRow {
    pub sketch_id: String,
    pub region_key: String,
    pub start_x: i64,
    pub start_y: i64,
    pub end_x: i64,
    pub end_y: i64,
    pub compressed: Vec<u8>,
}
