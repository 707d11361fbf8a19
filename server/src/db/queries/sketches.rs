use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqliteExecutor};

use crate::db::models::{SketchRegionRow, SketchRow};

/// Insert sketch metadata.
pub async fn insert_sketch<'e, E: SqliteExecutor<'e>>(
    executor: E,
    sketch: &SketchRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO sketches (id, channel_name, display_name, width, height, created_by, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&sketch.id)
    .bind(&sketch.channel_name)
    .bind(&sketch.display_name)
    .bind(sketch.width)
    .bind(sketch.height)
    .bind(&sketch.created_by)
    .bind(sketch.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Get a sketch by id.
pub async fn get_sketch<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: &str,
) -> Result<Option<SketchRow>, sqlx::Error> {
    sqlx::query_as::<_, SketchRow>(
        "SELECT id, channel_name, display_name, width, height, created_by, created_at \
         FROM sketches WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// List the sketches of one channel, oldest first.
pub async fn list_for_channel<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
) -> Result<Vec<SketchRow>, sqlx::Error> {
    sqlx::query_as::<_, SketchRow>(
        "SELECT id, channel_name, display_name, width, height, created_by, created_at \
         FROM sketches WHERE channel_name = ? ORDER BY created_at",
    )
    .bind(channel_name)
    .fetch_all(executor)
    .await
}

/// List every sketch (startup load).
pub async fn list_all<'e, E: SqliteExecutor<'e>>(
    executor: E,
) -> Result<Vec<SketchRow>, sqlx::Error> {
    sqlx::query_as::<_, SketchRow>(
        "SELECT id, channel_name, display_name, width, height, created_by, created_at \
         FROM sketches ORDER BY created_at",
    )
    .fetch_all(executor)
    .await
}

/// Count the sketches of a channel.
pub async fn count_for_channel<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM sketches WHERE channel_name = ?")
        .bind(channel_name)
        .fetch_one(executor)
        .await
}

/// Delete a sketch. Its regions cascade.
pub async fn delete_sketch<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sketches WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete every sketch of a channel. Returns how many were removed.
pub async fn delete_channel_sketches<'e, E: SqliteExecutor<'e>>(
    executor: E,
    channel_name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sketches WHERE channel_name = ?")
        .bind(channel_name)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Insert or replace a batch of regions on one connection, typically an
/// open transaction. Regions whose sketch no longer exists are skipped.
pub async fn upsert_regions(
    conn: &mut SqliteConnection,
    regions: &[SketchRegionRow],
) -> Result<(), sqlx::Error> {
    for region in regions {
        sqlx::query(
            "INSERT INTO sketch_regions (sketch_id, region_key, start_x, start_y, end_x, end_y, compressed) \
             SELECT ?, ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM sketches WHERE id = ?) \
             ON CONFLICT(sketch_id, region_key) DO UPDATE SET \
                start_x = excluded.start_x, \
                start_y = excluded.start_y, \
                end_x = excluded.end_x, \
                end_y = excluded.end_y, \
                compressed = excluded.compressed",
        )
        .bind(&region.sketch_id)
        .bind(&region.region_key)
        .bind(region.start_x)
        .bind(region.start_y)
        .bind(region.end_x)
        .bind(region.end_y)
        .bind(&region.compressed)
        .bind(&region.sketch_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Get all regions of a sketch.
pub async fn list_regions<'e, E: SqliteExecutor<'e>>(
    executor: E,
    sketch_id: &str,
) -> Result<Vec<SketchRegionRow>, sqlx::Error> {
    sqlx::query_as::<_, SketchRegionRow>(
        "SELECT sketch_id, region_key, start_x, start_y, end_x, end_y, compressed \
         FROM sketch_regions WHERE sketch_id = ? ORDER BY region_key",
    )
    .bind(sketch_id)
    .fetch_all(executor)
    .await
}

/// Wipe every region of a sketch.
pub async fn delete_regions<'e, E: SqliteExecutor<'e>>(
    executor: E,
    sketch_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sketch_regions WHERE sketch_id = ?")
        .bind(sketch_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Build a metadata row for a freshly created sketch.
pub fn new_sketch_row(
    id: &str,
    channel_name: &str,
    display_name: &str,
    width: u32,
    height: u32,
    created_by: &str,
    created_at: DateTime<Utc>,
) -> SketchRow {
    SketchRow {
        id: id.to_string(),
        channel_name: channel_name.to_string(),
        display_name: display_name.to_string(),
        width: i64::from(width),
        height: i64::from(height),
        created_by: created_by.to_string(),
        created_at,
    }
}
