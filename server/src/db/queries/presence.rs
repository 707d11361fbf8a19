use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;

use crate::db::models::UserStatusRow;

/// Upsert a user's online flag and last-seen timestamp.
pub async fn set_status<'e, E: SqliteExecutor<'e>>(
    executor: E,
    username: &str,
    is_online: bool,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO user_status (username, is_online, last_seen) VALUES (?, ?, ?) \
         ON CONFLICT(username) DO UPDATE SET is_online = excluded.is_online, \
         last_seen = excluded.last_seen",
    )
    .bind(username)
    .bind(is_online)
    .bind(at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Get a single user's status.
pub async fn get_status<'e, E: SqliteExecutor<'e>>(
    executor: E,
    username: &str,
) -> Result<Option<UserStatusRow>, sqlx::Error> {
    sqlx::query_as::<_, UserStatusRow>(
        "SELECT username, is_online, last_seen FROM user_status WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(executor)
    .await
}

/// Mark every user offline. Run at startup: no socket survives a restart.
pub async fn reset_all<'e, E: SqliteExecutor<'e>>(executor: E) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE user_status SET is_online = 0 WHERE is_online = 1")
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
