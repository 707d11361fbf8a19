use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::auth::config::AuthConfig;
use crate::config::ServerConfig;
use crate::db::models::MessageRow;
use crate::engine::batch_writer::{BatchConfig, BatchWriter, ChatSink, DirtyRegion, SketchSink};
use crate::engine::broadcast::Broadcaster;
use crate::engine::channel_manager::ChannelManager;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::hub::Hub;
use crate::engine::sketch::{SketchEngine, SketchLimits};
use crate::error::CoreResult;
use crate::pubsub::relay::{Relay, Target};
use crate::pubsub::{PubSub, SYSTEM_TOPIC};

/// Idle time after which a user's message rate bucket is dropped.
const LIMITER_IDLE: Duration = Duration::from_secs(600);

/// Shared application state for axum handlers.
pub struct AppState {
    pub db: SqlitePool,
    pub auth_config: AuthConfig,
    pub hub: Arc<Hub>,
    pub channels: Arc<ChannelManager>,
    pub sketches: Arc<SketchEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub instance_id: Uuid,
    /// Deadline for writes to a single socket.
    pub write_timeout: Duration,
    /// Server-wide cancellation signal.
    pub shutdown: CancellationToken,
    chat_writer: Arc<BatchWriter<MessageRow>>,
    sketch_writer: Arc<BatchWriter<DirtyRegion>>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Wire the engine over an open pool and broker, load persisted state,
    /// and start the background tasks (subscription relays, batched writers,
    /// liveness check).
    pub async fn start(
        db: SqlitePool,
        config: &ServerConfig,
        pubsub: Arc<dyn PubSub>,
        shutdown: CancellationToken,
    ) -> CoreResult<Arc<Self>> {
        let instance_id = Uuid::new_v4();
        let op_timeout = config.operation_timeout();
        let write_timeout = Duration::from_secs(config.hub.write_timeout_secs);

        let hub = Arc::new(Hub::new(write_timeout));
        let sketches = Arc::new(SketchEngine::new(
            db.clone(),
            SketchLimits {
                max_per_channel: config.sketch.max_per_channel,
                max_dimension: config.sketch.max_dimension,
            },
            op_timeout,
        ));
        sketches.load_from_store().await?;

        let relay = Arc::new(Relay::new(hub.clone(), sketches.clone(), instance_id));
        let broadcaster = Arc::new(Broadcaster::new(hub.clone(), pubsub.clone(), instance_id));
        let channels = Arc::new(ChannelManager::new(
            db.clone(),
            hub.clone(),
            pubsub.clone(),
            relay.clone(),
            broadcaster.clone(),
            sketches.clone(),
            op_timeout,
            shutdown.clone(),
        ));
        relay.attach_directory(&channels);
        channels.load_from_store().await?;

        let mut background = Vec::new();
        let system = pubsub.subscribe(SYSTEM_TOPIC).await?;
        background.push(relay.spawn(Target::All, system, shutdown.child_token()));

        let batching = &config.batching;
        let chat_writer = Arc::new(BatchWriter::spawn(
            "chat",
            ChatSink::new(db.clone()),
            BatchConfig {
                capacity: batching.queue_capacity,
                batch_size: batching.chat_batch_size,
                flush_interval: Duration::from_millis(batching.chat_flush_interval_ms),
            },
            CancellationToken::new(),
        ));
        let sketch_writer = Arc::new(BatchWriter::spawn(
            "sketch",
            SketchSink::new(db.clone(), sketches.clone()),
            BatchConfig {
                capacity: batching.queue_capacity,
                batch_size: batching.sketch_batch_size,
                flush_interval: Duration::from_millis(batching.sketch_flush_interval_ms),
            },
            CancellationToken::new(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            channels.clone(),
            sketches.clone(),
            broadcaster,
            chat_writer.clone(),
            sketch_writer.clone(),
        ));

        background.push(tokio::spawn(channels.clone().run_liveness(
            Duration::from_secs(config.hub.ping_interval_secs),
            shutdown.child_token(),
        )));
        background.push(tokio::spawn(cleanup_limiter(
            dispatcher.clone(),
            shutdown.child_token(),
        )));

        info!(instance = %instance_id, "engine started");
        Ok(Arc::new(Self {
            db,
            auth_config: config.to_auth_config(),
            hub,
            channels,
            sketches,
            dispatcher,
            instance_id,
            write_timeout,
            shutdown,
            chat_writer,
            sketch_writer,
            background: parking_lot::Mutex::new(background),
        }))
    }

    /// Stop background tasks, flush the batched writers and close every
    /// socket. The writers have their own cancellation tokens so they drain
    /// only after every socket reader has stopped producing.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.hub.close_all().await;
        self.chat_writer.shutdown().await;
        self.sketch_writer.shutdown().await;
        info!("engine stopped");
    }
}

async fn cleanup_limiter(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(LIMITER_IDLE);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => dispatcher.cleanup_limiter(LIMITER_IDLE),
        }
    }
}
