use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;

use crate::db::models::UserRow;

/// Insert a new account. Fails with a unique violation if the username is taken.
pub async fn create_user<'e, E: SqliteExecutor<'e>>(
    executor: E,
    username: &str,
    hashed_password: &str,
    created_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO users (username, hashed_password, created_at) VALUES (?, ?, ?)")
        .bind(username)
        .bind(hashed_password)
        .bind(created_at)
        .execute(executor)
        .await?;
    Ok(())
}

/// Get a user by username.
pub async fn get_user<'e, E: SqliteExecutor<'e>>(
    executor: E,
    username: &str,
) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(
        "SELECT username, hashed_password, created_at, last_seen FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(executor)
    .await
}

/// Record a login.
pub async fn touch_last_seen<'e, E: SqliteExecutor<'e>>(
    executor: E,
    username: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET last_seen = ? WHERE username = ?")
        .bind(at)
        .bind(username)
        .execute(executor)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::test_pool;

    #[tokio::test]
    async fn test_create_and_get_user() {
        let pool = test_pool().await;
        create_user(&pool, "alice", "$argon2id$hash", Utc::now())
            .await
            .unwrap();

        let user = get_user(&pool, "alice").await.unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.hashed_password, "$argon2id$hash");
        assert!(user.last_seen.is_none());

        assert!(get_user(&pool, "nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_username_is_unique_violation() {
        let pool = test_pool().await;
        create_user(&pool, "alice", "h", Utc::now()).await.unwrap();
        let err = create_user(&pool, "alice", "h2", Utc::now())
            .await
            .unwrap_err();
        match err {
            sqlx::Error::Database(db) => assert!(db.is_unique_violation()),
            other => panic!("expected database error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_touch_last_seen() {
        let pool = test_pool().await;
        create_user(&pool, "alice", "h", Utc::now()).await.unwrap();
        touch_last_seen(&pool, "alice", Utc::now()).await.unwrap();
        let user = get_user(&pool, "alice").await.unwrap().unwrap();
        assert!(user.last_seen.is_some());
    }
}
