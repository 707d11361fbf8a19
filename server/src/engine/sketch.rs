use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use super::raster::{Bitmap, Path, Point, rasterize_paths};
use super::rle;
use super::with_deadline;
use crate::db::models::{SketchRegionRow, SketchRow};
use crate::db::queries::{channels, sketches};
use crate::error::{CoreError, CoreResult};

/// Widest stroke accepted from clients.
pub const MAX_STROKE_WIDTH: u32 = 128;

/// Content of a `SKETCH_UPDATE` frame: paths painted into one region.
/// Bounds and points are in sketch coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchUpdate {
    pub sketch_id: String,
    pub start: Point,
    pub end: Point,
    pub paths: Vec<Path>,
}

impl SketchUpdate {
    /// Regions are keyed by their top-left corner.
    pub fn region_key(&self) -> String {
        region_key(self.start)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.sketch_id.trim().is_empty() {
            return Err(CoreError::Validation("Sketch id cannot be empty".into()));
        }
        if self.start.x < 0 || self.start.y < 0 || self.end.x < self.start.x || self.end.y < self.start.y {
            return Err(CoreError::Validation("Invalid region bounds".into()));
        }
        for path in &self.paths {
            if path.stroke_width > MAX_STROKE_WIDTH {
                return Err(CoreError::Validation(format!(
                    "Stroke width {} exceeds maximum of {MAX_STROKE_WIDTH}",
                    path.stroke_width
                )));
            }
            // A stroke may overhang its region by its radius and is clipped
            // there; points any further out are rejected.
            let reach = i64::from(path.stroke_width / 2) + 1;
            let inside = |p: &Point| {
                p.x >= self.start.x.saturating_sub(reach)
                    && p.x <= self.end.x.saturating_add(reach)
                    && p.y >= self.start.y.saturating_sub(reach)
                    && p.y <= self.end.y.saturating_add(reach)
            };
            if !path.points.iter().all(inside) {
                return Err(CoreError::Validation(
                    "Path point lies outside its region".into(),
                ));
            }
        }
        Ok(())
    }
}

pub fn region_key(start: Point) -> String {
    format!("{},{}", start.x, start.y)
}

/// A rectangular slice of a sketch. The bitmap is the working copy and
/// `compressed` its persisted form; both are kept in step.
#[derive(Debug, Clone)]
pub struct Region {
    pub start: Point,
    pub end: Point,
    /// Paths of the most recent update, in sketch coordinates.
    pub paths: Vec<Path>,
    bitmap: Bitmap,
    compressed: Vec<u8>,
}

impl Region {
    fn new(start: Point, end: Point) -> Self {
        let bitmap = Bitmap::new(
            (end.x - start.x + 1) as usize,
            (end.y - start.y + 1) as usize,
        );
        let compressed = rle::encode(bitmap.pixels());
        Self {
            start,
            end,
            paths: Vec::new(),
            bitmap,
            compressed,
        }
    }

    fn from_row(row: &SketchRegionRow) -> CoreResult<Self> {
        let start = Point::new(row.start_x, row.start_y);
        let end = Point::new(row.end_x, row.end_y);
        if end.x < start.x || end.y < start.y {
            return Err(CoreError::Internal(format!(
                "region {} of sketch {} has inverted bounds",
                row.region_key, row.sketch_id
            )));
        }
        let width = (end.x - start.x + 1) as usize;
        let height = (end.y - start.y + 1) as usize;
        let pixels = rle::decode(&row.compressed, width * height)
            .map_err(|e| CoreError::Internal(format!("region {}: {e}", row.region_key)))?;
        let bitmap = Bitmap::from_pixels(width, height, pixels)
            .ok_or_else(|| CoreError::Internal("region size mismatch".into()))?;
        Ok(Self {
            start,
            end,
            paths: Vec::new(),
            bitmap,
            compressed: row.compressed.clone(),
        })
    }

    fn apply(&mut self, paths: &[Path]) {
        let local: Vec<Path> = paths
            .iter()
            .map(|p| Path {
                points: p
                    .points
                    .iter()
                    .map(|pt| {
                        Point::new(
                            pt.x.saturating_sub(self.start.x),
                            pt.y.saturating_sub(self.start.y),
                        )
                    })
                    .collect(),
                stroke_width: p.stroke_width,
                is_drawing: p.is_drawing,
            })
            .collect();
        rasterize_paths(&mut self.bitmap, &local);
        self.compressed = rle::encode(self.bitmap.pixels());
        self.paths = paths.to_vec();
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn compressed(&self) -> &[u8] {
        &self.compressed
    }
}

/// A collaborative drawing surface. The region map has its own lock so
/// updates to one sketch never contend with another.
#[derive(Debug)]
pub struct Sketch {
    pub id: String,
    pub channel_name: String,
    pub display_name: String,
    pub width: u32,
    pub height: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    regions: RwLock<HashMap<String, Region>>,
}

impl Sketch {
    fn from_row(row: &SketchRow) -> Self {
        Self {
            id: row.id.clone(),
            channel_name: row.channel_name.clone(),
            display_name: row.display_name.clone(),
            width: row.width as u32,
            height: row.height as u32,
            created_by: row.created_by.clone(),
            created_at: row.created_at,
            regions: RwLock::new(HashMap::new()),
        }
    }

    /// Merge an update into its region, creating the region on first use.
    /// Returns the region key.
    pub fn apply_update(&self, update: &SketchUpdate) -> CoreResult<String> {
        update.validate()?;
        if update.end.x >= i64::from(self.width) || update.end.y >= i64::from(self.height) {
            return Err(CoreError::Validation(format!(
                "Region exceeds sketch bounds {}x{}",
                self.width, self.height
            )));
        }

        let key = update.region_key();
        let mut regions = self.regions.write();
        let region = regions
            .entry(key.clone())
            .or_insert_with(|| Region::new(update.start, update.end));
        if region.end != update.end {
            return Err(CoreError::Validation(format!(
                "Region {key} already exists with different bounds"
            )));
        }
        region.apply(&update.paths);
        Ok(key)
    }

    /// Wipe every region.
    pub fn clear(&self) {
        self.regions.write().clear();
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    pub fn region(&self, key: &str) -> Option<Region> {
        self.regions.read().get(key).cloned()
    }

    /// Persisted form of one region, if it still exists.
    pub fn region_row(&self, key: &str) -> Option<SketchRegionRow> {
        self.regions.read().get(key).map(|r| self.to_row(key, r))
    }

    /// Persisted form of every region, ordered by key.
    pub fn region_rows(&self) -> Vec<SketchRegionRow> {
        let regions = self.regions.read();
        let mut rows: Vec<SketchRegionRow> =
            regions.iter().map(|(k, r)| self.to_row(k, r)).collect();
        rows.sort_by(|a, b| a.region_key.cmp(&b.region_key));
        rows
    }

    fn to_row(&self, key: &str, region: &Region) -> SketchRegionRow {
        SketchRegionRow {
            sketch_id: self.id.clone(),
            region_key: key.to_string(),
            start_x: region.start.x,
            start_y: region.start.y,
            end_x: region.end.x,
            end_y: region.end.y,
            compressed: region.compressed.clone(),
        }
    }

    fn insert_region(&self, key: String, region: Region) {
        self.regions.write().insert(key, region);
    }
}

/// Limits applied when sketches are created.
#[derive(Debug, Clone)]
pub struct SketchLimits {
    pub max_per_channel: usize,
    pub max_dimension: u32,
}

impl Default for SketchLimits {
    fn default() -> Self {
        Self {
            max_per_channel: 8,
            max_dimension: 4096,
        }
    }
}

/// Registry of live sketches plus the transactional create/delete/clear
/// commands.
pub struct SketchEngine {
    pool: SqlitePool,
    sketches: DashMap<String, Arc<Sketch>>,
    limits: SketchLimits,
    op_timeout: Duration,
    /// Serialises the count-then-insert of sketch creation.
    create_lock: tokio::sync::Mutex<()>,
}

impl SketchEngine {
    pub fn new(pool: SqlitePool, limits: SketchLimits, op_timeout: Duration) -> Self {
        Self {
            pool,
            sketches: DashMap::new(),
            limits,
            op_timeout,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load every sketch and its regions from the database.
    pub async fn load_from_store(&self) -> CoreResult<usize> {
        let rows = sketches::list_all(&self.pool).await?;
        for row in &rows {
            let sketch = Sketch::from_row(row);
            for region_row in sketches::list_regions(&self.pool, &row.id).await? {
                match Region::from_row(&region_row) {
                    Ok(region) => sketch.insert_region(region_row.region_key.clone(), region),
                    Err(e) => warn!(
                        sketch_id = %row.id,
                        region = %region_row.region_key,
                        error = %e,
                        "skipping unreadable sketch region"
                    ),
                }
            }
            self.sketches.insert(row.id.clone(), Arc::new(sketch));
        }
        info!("loaded {} sketches from database", rows.len());
        Ok(rows.len())
    }

    /// Load a single sketch and its regions, replacing any in-memory copy.
    /// Returns `false` if the sketch is not in the database.
    pub async fn load_sketch(&self, sketch_id: &str) -> CoreResult<bool> {
        let Some(row) = sketches::get_sketch(&self.pool, sketch_id).await? else {
            return Ok(false);
        };
        let sketch = Sketch::from_row(&row);
        for region_row in sketches::list_regions(&self.pool, sketch_id).await? {
            let region = Region::from_row(&region_row)?;
            sketch.insert_region(region_row.region_key, region);
        }
        self.sketches.insert(row.id, Arc::new(sketch));
        Ok(true)
    }

    /// Drop a sketch from memory only.
    pub fn forget(&self, sketch_id: &str) {
        self.sketches.remove(sketch_id);
    }

    pub fn get(&self, sketch_id: &str) -> Option<Arc<Sketch>> {
        self.sketches.get(sketch_id).map(|s| s.value().clone())
    }

    pub fn list_for_channel(&self, channel_name: &str) -> Vec<Arc<Sketch>> {
        let mut list: Vec<Arc<Sketch>> = self
            .sketches
            .iter()
            .filter(|s| s.channel_name == channel_name)
            .map(|s| s.value().clone())
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Create a sketch. The creator must be a channel member and the channel
    /// must be under its sketch cap.
    pub async fn create_sketch(
        &self,
        channel_name: &str,
        username: &str,
        display_name: &str,
        width: u32,
        height: u32,
    ) -> CoreResult<Arc<Sketch>> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(CoreError::Validation("Sketch name cannot be empty".into()));
        }
        let max = self.limits.max_dimension;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(CoreError::Validation(format!(
                "Sketch dimensions must be between 1 and {max}"
            )));
        }

        let _guard = self.create_lock.lock().await;
        let row = with_deadline(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            if channels::get_member(&mut *tx, channel_name, username)
                .await?
                .is_none()
            {
                return Err(CoreError::Forbidden(
                    "Only channel members can create sketches".into(),
                ));
            }
            let count = sketches::count_for_channel(&mut *tx, channel_name).await?;
            if count as usize >= self.limits.max_per_channel {
                return Err(CoreError::Conflict(format!(
                    "Channel already has the maximum of {} sketches",
                    self.limits.max_per_channel
                )));
            }
            let row = sketches::new_sketch_row(
                &Uuid::new_v4().to_string(),
                channel_name,
                display_name,
                width,
                height,
                username,
                Utc::now(),
            );
            sketches::insert_sketch(&mut *tx, &row).await?;
            tx.commit().await?;
            Ok::<_, CoreError>(row)
        })
        .await?;

        let sketch = Arc::new(Sketch::from_row(&row));
        self.sketches.insert(row.id.clone(), sketch.clone());
        info!(sketch_id = %row.id, channel = %channel_name, "sketch created by {}", username);
        Ok(sketch)
    }

    /// Delete a sketch. Allowed for its creator or a channel admin.
    pub async fn delete_sketch(
        &self,
        channel_name: &str,
        sketch_id: &str,
        username: &str,
    ) -> CoreResult<()> {
        with_deadline(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            let sketch = sketches::get_sketch(&mut *tx, sketch_id)
                .await?
                .filter(|s| s.channel_name == channel_name)
                .ok_or_else(|| CoreError::NotFound("Sketch not found".into()))?;
            let is_admin = channels::get_member(&mut *tx, channel_name, username)
                .await?
                .is_some_and(|m| m.is_admin);
            if sketch.created_by != username && !is_admin {
                return Err(CoreError::Forbidden(
                    "Only the creator or a channel admin can delete a sketch".into(),
                ));
            }
            sketches::delete_sketch(&mut *tx, sketch_id).await?;
            tx.commit().await?;
            Ok::<_, CoreError>(())
        })
        .await?;

        self.sketches.remove(sketch_id);
        info!(sketch_id = %sketch_id, channel = %channel_name, "sketch deleted by {}", username);
        Ok(())
    }

    /// Wipe every region of a sketch. Requires channel membership.
    pub async fn clear_sketch(
        &self,
        channel_name: &str,
        sketch_id: &str,
        username: &str,
    ) -> CoreResult<()> {
        let sketch = self
            .get(sketch_id)
            .filter(|s| s.channel_name == channel_name)
            .ok_or_else(|| CoreError::NotFound("Sketch not found".into()))?;

        with_deadline(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            if channels::get_member(&mut *tx, channel_name, username)
                .await?
                .is_none()
            {
                return Err(CoreError::Forbidden(
                    "Only channel members can clear sketches".into(),
                ));
            }
            sketches::delete_regions(&mut *tx, sketch_id).await?;
            tx.commit().await?;
            Ok::<_, CoreError>(())
        })
        .await?;

        sketch.clear();
        Ok(())
    }

    /// Apply a region update from a channel member.
    pub fn apply_update(&self, channel_name: &str, update: &SketchUpdate) -> CoreResult<String> {
        let sketch = self
            .get(&update.sketch_id)
            .filter(|s| s.channel_name == channel_name)
            .ok_or_else(|| CoreError::NotFound("Sketch not found".into()))?;
        sketch.apply_update(update)
    }

    /// Current persisted form of a region, or `None` if the sketch or region
    /// is gone.
    pub fn region_row(&self, sketch_id: &str, region_key: &str) -> Option<SketchRegionRow> {
        self.get(sketch_id)?.region_row(region_key)
    }

    /// Drop the in-memory sketches of a deleted channel.
    pub fn remove_channel(&self, channel_name: &str) {
        self.sketches.retain(|_, s| s.channel_name != channel_name);
    }
}
