use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;

use crate::db::models::{ChannelMemberRow, ChannelRow};

/// Parameters for inserting a channel row.
pub struct NewChannel<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub hashed_password: Option<&'a str>,
    pub created_by: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Insert a channel. `is_private` is derived from whether a password hash is present.
pub async fn insert_channel<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel: &NewChannel<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channels (name, is_private, description, hashed_password, created_by, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(channel.name)
    .bind(channel.hashed_password.is_some())
    .bind(channel.description)
    .bind(channel.hashed_password)
    .bind(channel.created_by)
    .bind(channel.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Get a channel by name.
pub async fn get_channel<'e, E: SqliteExecutor<'e>>(
    executor: E,
    name: &str,
) -> Result<Option<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(
        "SELECT name, is_private, description, hashed_password, created_by, created_at \
         FROM channels WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(executor)
    .await
}

/// List all channels, ordered by name.
pub async fn list_channels<'e, E: SqliteExecutor<'e>>(
    executor: E,
) -> Result<Vec<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(
        "SELECT name, is_private, description, hashed_password, created_by, created_at \
         FROM channels ORDER BY name",
    )
    .fetch_all(executor)
    .await
}

/// Delete a channel row. Returns whether a row was removed.
pub async fn delete_channel<'e, E: SqliteExecutor<'e>>(
    executor: E,
    name: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM channels WHERE name = ?")
        .bind(name)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Add a member. An existing row is kept as is (membership is sticky).
/// Returns whether a new row was inserted.
pub async fn add_member<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
    username: &str,
    is_admin: bool,
    joined_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO channel_member (channel_name, username, is_admin, joined_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(channel_name)
    .bind(username)
    .bind(is_admin)
    .bind(joined_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Get a single membership row.
pub async fn get_member<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
    username: &str,
) -> Result<Option<ChannelMemberRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelMemberRow>(
        "SELECT channel_name, username, is_admin, joined_at, last_message \
         FROM channel_member WHERE channel_name = ? AND username = ?",
    )
    .bind(channel_name)
    .bind(username)
    .fetch_optional(executor)
    .await
}

/// Get all members of a channel.
pub async fn get_members<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
) -> Result<Vec<ChannelMemberRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelMemberRow>(
        "SELECT channel_name, username, is_admin, joined_at, last_message \
         FROM channel_member WHERE channel_name = ? ORDER BY joined_at",
    )
    .bind(channel_name)
    .fetch_all(executor)
    .await
}

/// Change a member's admin flag. Returns whether the row existed.
pub async fn set_member_admin<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
    username: &str,
    is_admin: bool,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE channel_member SET is_admin = ? WHERE channel_name = ? AND username = ?",
    )
    .bind(is_admin)
    .bind(channel_name)
    .bind(username)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Count the admins of a channel.
pub async fn count_admins<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM channel_member WHERE channel_name = ? AND is_admin = 1",
    )
    .bind(channel_name)
    .fetch_one(executor)
    .await
}

/// Delete every membership row of a channel.
pub async fn delete_members<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM channel_member WHERE channel_name = ?")
        .bind(channel_name)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Record the time of a member's latest message.
pub async fn touch_last_message<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
    username: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE channel_member SET last_message = ? WHERE channel_name = ? AND username = ?",
    )
    .bind(at)
    .bind(channel_name)
    .bind(username)
    .execute(executor)
    .await?;
    Ok(())
}
