use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inkroom_server::config::ServerConfig;
use inkroom_server::db::pool::{create_pool, run_migrations};
use inkroom_server::db::queries::presence;
use inkroom_server::pubsub::PubSub;
use inkroom_server::pubsub::local::LocalBroker;
use inkroom_server::pubsub::redis_broker::RedisBroker;
use inkroom_server::web::app_state::AppState;
use inkroom_server::web::router::build_router;

#[derive(Parser)]
#[command(name = "inkroom-server", about = "Multi-channel chat server with shared sketches")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "inkroom.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;
    let auth_config = config.to_auth_config();
    auth_config
        .validate()
        .context("invalid authentication settings")?;

    info!(filestore = %config.storage.filestore_path, "image storage path");
    if let Some(region) = &config.storage.aws_region {
        info!(region = %region, "object storage region configured but not used by this build");
    }

    let pool = create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;
    // Nobody is connected to a process that just started.
    presence::reset_all(&pool)
        .await
        .context("failed to reset presence")?;

    let pubsub: Arc<dyn PubSub> = match &config.pubsub.redis_url {
        Some(url) => Arc::new(
            RedisBroker::connect(url)
                .await
                .context("failed to connect to redis")?,
        ),
        None => {
            warn!("no REDIS_URL configured, using the in-process broker (single instance only)");
            Arc::new(LocalBroker::new())
        }
    };

    let shutdown = CancellationToken::new();
    let state = AppState::start(pool.clone(), &config, pubsub, shutdown.clone())
        .await
        .context("failed to start engine")?;

    let app = build_router(
        state.clone(),
        config.server.allowed_origin.as_deref(),
        config.server.max_body_bytes,
    );
    let listener = tokio::net::TcpListener::bind(&config.server.web_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.web_address))?;
    info!("Inkroom server listening on {}", config.server.web_address);

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            _ = signal.cancelled() => {}
        }
        signal.cancel();
    })
    .await
    .context("server error")?;

    state.stop().await;
    pool.close().await;
    info!("Inkroom server stopped");
    Ok(())
}
