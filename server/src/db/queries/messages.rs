use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqliteExecutor};

use crate::db::models::MessageRow;

/// Insert a batch of messages on one connection, typically an open transaction.
/// The statement is prepared once and reused for every row.
pub async fn insert_messages(
    conn: &mut SqliteConnection,
    rows: &[MessageRow],
) -> Result<(), sqlx::Error> {
    for row in rows {
        sqlx::query(
            "INSERT INTO messages (id, channel_name, username, message_type, content, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.channel_name)
        .bind(&row.username)
        .bind(&row.message_type)
        .bind(&row.content)
        .bind(row.timestamp)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Fetch channel history with cursor-based pagination.
/// Returns messages older than `before`, newest first.
pub async fn fetch_history<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
    before: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    match before {
        Some(before) => {
            sqlx::query_as::<_, MessageRow>(
                "SELECT id, channel_name, username, message_type, content, timestamp \
                 FROM messages \
                 WHERE channel_name = ? AND timestamp < ? \
                 ORDER BY timestamp DESC \
                 LIMIT ?",
            )
            .bind(channel_name)
            .bind(before)
            .bind(limit)
            .fetch_all(executor)
            .await
        }
        None => {
            sqlx::query_as::<_, MessageRow>(
                "SELECT id, channel_name, username, message_type, content, timestamp \
                 FROM messages \
                 WHERE channel_name = ? \
                 ORDER BY timestamp DESC \
                 LIMIT ?",
            )
            .bind(channel_name)
            .bind(limit)
            .fetch_all(executor)
            .await
        }
    }
}

/// Delete all messages of a channel.
pub async fn delete_channel_messages<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM messages WHERE channel_name = ?")
        .bind(channel_name)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
