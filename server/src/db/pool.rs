use sqlx::Connection;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Create and initialize a SQLite connection pool with WAL mode.
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    info!("database connected: {}", database_url);
    Ok(pool)
}

/// Split SQL text into statements on semicolons, skipping comment-only lines.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }

        current.push_str(line);
        current.push('\n');

        while let Some(pos) = current.find(';') {
            let stmt = current[..pos].trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current = current[pos + 1..].to_string();
        }
    }

    let remaining = current.trim();
    if !remaining.is_empty() {
        statements.push(remaining.to_string());
    }

    statements
}

/// Versioned migrations, applied in order.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../../migrations/001_initial.sql"))];

/// Run all pending migration SQL files against the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (\
            version     INTEGER PRIMARY KEY, \
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))\
        )",
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;

    for &(version, sql) in MIGRATIONS {
        if version <= current_version {
            continue;
        }
        info!("applying migration {version}...");
        let mut conn = pool.acquire().await?;
        // Statements and the version row commit together so a partial failure
        // cannot leave the schema half-applied.
        let mut tx = conn.begin().await?;
        for statement in split_sql_statements(sql) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    let final_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0);
    info!("database migrations applied (version: {final_version})");
    Ok(())
}

/// Pool used by unit and integration tests: one shared in-memory database.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:", 1).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple_statements() {
        let sql = "CREATE TABLE a (id INT);\nCREATE TABLE b (id INT);";
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "CREATE TABLE a (id INT)");
        assert_eq!(stmts[1], "CREATE TABLE b (id INT)");
    }

    #[test]
    fn test_split_skips_comment_lines() {
        let sql = "-- This is a comment\nCREATE TABLE a (id INT);";
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts, vec!["CREATE TABLE a (id INT)".to_string()]);
    }

    #[test]
    fn test_split_empty_input() {
        assert!(split_sql_statements("").is_empty());
        assert!(split_sql_statements("-- only\n-- comments\n").is_empty());
    }

    #[test]
    fn test_split_multiline_statement() {
        let sql = "CREATE TABLE a (\n  id INT,\n  name TEXT\n);\n";
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].contains("name TEXT"));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_core_tables_created() {
        let pool = test_pool().await;
        for table in [
            "users",
            "user_status",
            "channels",
            "channel_member",
            "messages",
            "sketches",
            "sketch_regions",
        ] {
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert!(exists, "Table '{table}' should exist after migrations");
        }
    }

    #[tokio::test]
    async fn test_private_channel_requires_password_hash() {
        let pool = test_pool().await;
        let result = sqlx::query(
            "INSERT INTO channels (name, is_private, created_by, created_at) \
             VALUES ('vip', 1, 'alice', '2024-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err(), "private channel without hash must be rejected");
    }
}
