use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sketch::SketchEngine;
use crate::db::models::MessageRow;
use crate::db::queries::{channels, messages, sketches};

/// Destination of a batched writer. One call per flush.
pub trait BatchSink<T>: Send + Sync + 'static {
    fn write_batch(&self, items: &[T]) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

/// Bounded queue drained by one background task that flushes when a batch
/// is full or when the interval ticks with items pending.
pub struct BatchWriter<T> {
    name: &'static str,
    queue: mpsc::Sender<T>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchWriter<T> {
    pub fn spawn<S: BatchSink<T>>(
        name: &'static str,
        sink: S,
        config: BatchConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, rx) = mpsc::channel(config.capacity.max(1));
        let task = tokio::spawn(drain(name, rx, sink, config, cancel.clone()));
        Self {
            name,
            queue,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Enqueue without waiting. A full queue drops the item.
    pub fn add(&self, item: T) -> bool {
        match self.queue.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(writer = self.name, "batch queue full, dropping item");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(writer = self.name, "batch writer stopped, dropping item");
                false
            }
        }
    }

    /// Stop the drain task after it flushes everything still queued.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(writer = self.name, error = %e, "batch writer task failed");
        }
    }
}

async fn drain<T, S: BatchSink<T>>(
    name: &'static str,
    mut rx: mpsc::Receiver<T>,
    sink: S,
    config: BatchConfig,
    cancel: CancellationToken,
) {
    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<T> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => {
                    batch.push(item);
                    if batch.len() >= batch_size {
                        flush(name, &sink, &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(name, &sink, &mut batch).await;
                }
            }
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        batch.push(item);
        if batch.len() >= batch_size {
            flush(name, &sink, &mut batch).await;
        }
    }
    if !batch.is_empty() {
        flush(name, &sink, &mut batch).await;
    }
    info!(writer = name, "batch writer stopped");
}

/// Failed batches are dropped, not retried.
async fn flush<T, S: BatchSink<T>>(name: &'static str, sink: &S, batch: &mut Vec<T>) {
    match sink.write_batch(batch).await {
        Ok(()) => debug!(writer = name, count = batch.len(), "flushed batch"),
        Err(e) => error!(
            writer = name,
            count = batch.len(),
            error = %e,
            "batch flush failed, dropping batch"
        ),
    }
    batch.clear();
}

// ── Sinks ─────────────────────────────────────────────────────────────

/// Persists text and image messages, and each sender's last-message time.
/// Rows for a channel deleted while they were queued, or recreated since
/// they were sent, are dropped.
pub struct ChatSink {
    pool: SqlitePool,
}

impl ChatSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl BatchSink<MessageRow> for ChatSink {
    async fn write_batch(&self, items: &[MessageRow]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut created: HashMap<&str, Option<DateTime<Utc>>> = HashMap::new();
        let mut live = Vec::with_capacity(items.len());
        for row in items {
            let since = match created.get(row.channel_name.as_str()) {
                Some(since) => *since,
                None => {
                    let since = channels::get_channel(&mut *tx, &row.channel_name)
                        .await?
                        .map(|channel| channel.created_at);
                    created.insert(&row.channel_name, since);
                    since
                }
            };
            if since.is_some_and(|at| at <= row.timestamp) {
                live.push(row.clone());
            }
        }
        if live.len() < items.len() {
            warn!(dropped = items.len() - live.len(), "dropping messages for deleted channels");
        }
        if live.is_empty() {
            return Ok(());
        }

        messages::insert_messages(&mut tx, &live).await?;
        for row in &live {
            channels::touch_last_message(&mut *tx, &row.channel_name, &row.username, row.timestamp)
                .await?;
        }
        tx.commit().await
    }
}

/// A region whose in-memory state changed since it was last persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirtyRegion {
    pub sketch_id: String,
    pub region_key: String,
}

/// Persists dirty sketch regions. The region's state is read at flush time,
/// so several updates to one region cost a single write, and regions of
/// deleted or cleared sketches are skipped.
pub struct SketchSink {
    pool: SqlitePool,
    engine: Arc<SketchEngine>,
}

impl SketchSink {
    pub fn new(pool: SqlitePool, engine: Arc<SketchEngine>) -> Self {
        Self { pool, engine }
    }
}

impl BatchSink<DirtyRegion> for SketchSink {
    async fn write_batch(&self, items: &[DirtyRegion]) -> Result<(), sqlx::Error> {
        let mut seen = HashSet::new();
        let rows: Vec<_> = items
            .iter()
            .filter(|d| seen.insert(*d))
            .filter_map(|d| self.engine.region_row(&d.sketch_id, &d.region_key))
            .collect();
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        sketches::upsert_regions(&mut tx, &rows).await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::test_pool;
    use crate::db::queries::channels::{NewChannel, add_member, insert_channel};
    use crate::engine::raster::{Path, Point};
    use crate::engine::sketch::{SketchLimits, SketchUpdate};
    use chrono::Utc;
    use tokio::sync::Semaphore;

    #[derive(Clone, Default)]
    struct Recorder {
        batches: Arc<Mutex<Vec<Vec<u32>>>>,
        fail: bool,
        gate: Option<Arc<Semaphore>>,
    }

    impl BatchSink<u32> for Recorder {
        async fn write_batch(&self, items: &[u32]) -> Result<(), sqlx::Error> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.batches.lock().push(items.to_vec());
            if self.fail {
                return Err(sqlx::Error::PoolClosed);
            }
            Ok(())
        }
    }

    fn config(batch_size: usize, interval_ms: u64) -> BatchConfig {
        BatchConfig {
            capacity: 1000,
            batch_size,
            flush_interval: Duration::from_millis(interval_ms),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_flushes_when_batch_is_full() {
        let sink = Recorder::default();
        let writer = BatchWriter::spawn("test", sink.clone(), config(3, 60_000), CancellationToken::new());
        for i in 0..7 {
            assert!(writer.add(i));
        }
        settle().await;
        assert_eq!(*sink.batches.lock(), vec![vec![0, 1, 2], vec![3, 4, 5]]);

        writer.shutdown().await;
        assert_eq!(sink.batches.lock().last().unwrap(), &vec![6]);
    }

    #[tokio::test]
    async fn test_flushes_on_interval() {
        let sink = Recorder::default();
        let writer = BatchWriter::spawn("test", sink.clone(), config(100, 20), CancellationToken::new());
        writer.add(1);
        writer.add(2);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*sink.batches.lock(), vec![vec![1, 2]]);
        writer.shutdown().await;
        // Nothing left to flush.
        assert_eq!(sink.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped() {
        let sink = Recorder {
            fail: true,
            ..Default::default()
        };
        let writer = BatchWriter::spawn("test", sink.clone(), config(2, 60_000), CancellationToken::new());
        writer.add(1);
        writer.add(2);
        writer.add(3);
        writer.shutdown().await;
        // The failed batch was attempted once and never retried.
        assert_eq!(*sink.batches.lock(), vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_items() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Recorder {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let writer = BatchWriter::spawn(
            "test",
            sink.clone(),
            BatchConfig {
                capacity: 1,
                batch_size: 1,
                flush_interval: Duration::from_secs(60),
            },
            CancellationToken::new(),
        );
        assert!(writer.add(1));
        settle().await; // drain task is now blocked flushing item 1
        assert!(writer.add(2));
        assert!(!writer.add(3));

        gate.add_permits(10);
        writer.shutdown().await;
        assert_eq!(*sink.batches.lock(), vec![vec![1], vec![2]]);
        assert!(!writer.add(4));
    }

    #[tokio::test]
    async fn test_chat_sink_persists_rows() {
        let pool = test_pool().await;
        insert_channel(
            &pool,
            &NewChannel {
                name: "general",
                description: None,
                hashed_password: None,
                created_by: "alice",
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        add_member(&pool, "general", "alice", true, Utc::now()).await.unwrap();

        let now = Utc::now();
        let row = MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            channel_name: "general".into(),
            username: "alice".into(),
            message_type: "TEXT".into(),
            content: r#"{"text":"hi"}"#.into(),
            timestamp: now,
        };
        ChatSink::new(pool.clone()).write_batch(&[row]).await.unwrap();

        assert_eq!(messages::fetch_history(&pool, "general", None, 10).await.unwrap().len(), 1);
        let member = channels::get_member(&pool, "general", "alice").await.unwrap().unwrap();
        assert!(member.last_message.is_some());
    }

    #[tokio::test]
    async fn test_chat_sink_skips_rows_of_deleted_channels() {
        let pool = test_pool().await;
        let sent_before = Utc::now() - chrono::Duration::seconds(5);
        insert_channel(
            &pool,
            &NewChannel {
                name: "general",
                description: None,
                hashed_password: None,
                created_by: "alice",
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        add_member(&pool, "general", "alice", true, Utc::now()).await.unwrap();

        let row = |channel: &str, timestamp| MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            channel_name: channel.into(),
            username: "alice".into(),
            message_type: "TEXT".into(),
            content: r#"{"text":"hi"}"#.into(),
            timestamp,
        };
        // Queued for a channel that is gone, and for an earlier channel of
        // the same name.
        let batch = [
            row("deleted", Utc::now()),
            row("general", sent_before),
            row("general", Utc::now()),
        ];
        ChatSink::new(pool.clone()).write_batch(&batch).await.unwrap();

        let history = messages::fetch_history(&pool, "general", None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, batch[2].id);
        assert!(messages::fetch_history(&pool, "deleted", None, 10).await.unwrap().is_empty());

        ChatSink::new(pool.clone())
            .write_batch(&[row("deleted", Utc::now())])
            .await
            .unwrap();
        assert!(messages::fetch_history(&pool, "deleted", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sketch_sink_writes_current_region_state_once() {
        let pool = test_pool().await;
        insert_channel(
            &pool,
            &NewChannel {
                name: "general",
                description: None,
                hashed_password: None,
                created_by: "alice",
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        add_member(&pool, "general", "alice", true, Utc::now()).await.unwrap();
        let engine = Arc::new(SketchEngine::new(
            pool.clone(),
            SketchLimits::default(),
            Duration::from_secs(5),
        ));
        let sketch = engine
            .create_sketch("general", "alice", "Board", 10, 10)
            .await
            .unwrap();
        let update = SketchUpdate {
            sketch_id: sketch.id.clone(),
            start: Point::new(0, 0),
            end: Point::new(9, 9),
            paths: vec![Path {
                points: vec![Point::new(0, 0), Point::new(3, 0)],
                stroke_width: 1,
                is_drawing: true,
            }],
        };
        let key = engine.apply_update("general", &update).unwrap();
        let dirty = DirtyRegion {
            sketch_id: sketch.id.clone(),
            region_key: key,
        };
        let missing = DirtyRegion {
            sketch_id: "gone".into(),
            region_key: "0,0".into(),
        };

        SketchSink::new(pool.clone(), engine.clone())
            .write_batch(&[dirty.clone(), dirty, missing])
            .await
            .unwrap();

        let regions = sketches::list_regions(&pool, &sketch.id).await.unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].compressed, vec![0, 4, 96]);
    }
}
