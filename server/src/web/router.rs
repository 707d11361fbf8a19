use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use super::app_state::AppState;
use super::rate_limit::{ApiRateLimiters, auth_rate_limit, ws_rate_limit};
use super::{rest_api, ws_handler};

/// Build the axum router with all HTTP and WebSocket routes.
pub fn build_router(
    state: Arc<AppState>,
    allowed_origin: Option<&str>,
    max_body_bytes: usize,
) -> Router {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let cors = match allowed_origin.map(str::parse::<HeaderValue>) {
        Some(Ok(origin)) => cors.allow_origin(origin),
        Some(Err(_)) => {
            warn!("allowed_origin is not a valid header value, allowing any origin");
            cors.allow_origin(Any)
        }
        None => cors.allow_origin(Any),
    };

    let rate_limiters = Arc::new(ApiRateLimiters::default());

    // Account routes: per-IP limit against credential stuffing.
    let auth_routes = Router::new()
        .route("/api/register", post(rest_api::register))
        .route("/api/login", post(rest_api::login))
        .layer(axum::middleware::from_fn(auth_rate_limit));

    let ws_routes = Router::new()
        .route("/api/ws", get(ws_handler::system_upgrade))
        .route("/api/ws/{channel_name}", get(ws_handler::channel_upgrade))
        .layer(axum::middleware::from_fn(ws_rate_limit));

    let api_routes = Router::new()
        .route("/api/channels", get(rest_api::get_channels))
        .route(
            "/api/channels/{name}/messages",
            get(rest_api::get_channel_history),
        )
        .route(
            "/api/channels/{name}/sketches",
            get(rest_api::get_channel_sketches),
        )
        .route("/api/createchannel", post(rest_api::create_channel))
        .route("/api/joinchannel", post(rest_api::join_channel))
        .route("/api/leavechannel", post(rest_api::leave_channel))
        .route("/api/deletechannel", post(rest_api::delete_channel))
        .route(
            "/api/updatememberrole",
            post(rest_api::update_member_role),
        );

    Router::new()
        .merge(ws_routes)
        .merge(auth_routes)
        .merge(api_routes)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(axum::Extension(rate_limiters))
        .with_state(state)
}
