use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::auth::token::{token_from_subprotocol, validate_token};
use crate::db::queries::presence;
use crate::engine::connection::{Connection, ConnectionKind};
use crate::engine::events::ChatMessage;
use crate::error::{CoreError, CoreResult};

use super::app_state::AppState;

/// Subprotocol a client offers, followed by its token, to authenticate.
const AUTH_PROTOCOL: &str = "Authentication";

/// GET /api/ws/{channelName}: channel socket. The user must already be a
/// member of the channel.
pub async fn channel_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(channel_name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let username = match authenticate(&state, &headers) {
        Ok(username) => username,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = state.channels.require_member(&channel_name, &username) {
        return e.into_response();
    }
    ws.protocols([AUTH_PROTOCOL])
        .on_upgrade(move |socket| run_channel_socket(state, socket, username, channel_name))
}

/// GET /api/ws: channel-agnostic system socket.
pub async fn system_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let username = match authenticate(&state, &headers) {
        Ok(username) => username,
        Err(e) => return e.into_response(),
    };
    ws.protocols([AUTH_PROTOCOL])
        .on_upgrade(move |socket| run_system_socket(state, socket, username))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> CoreResult<String> {
    let token = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(token_from_subprotocol)
        .ok_or_else(|| CoreError::Unauthorized("Missing authentication subprotocol".into()))?;
    let claims = validate_token(token, &state.auth_config.secret_key)
        .map_err(|_| CoreError::Unauthorized("Invalid or expired token".into()))?;
    Ok(claims.username)
}

async fn run_channel_socket(
    state: Arc<AppState>,
    socket: WebSocket,
    username: String,
    channel_name: String,
) {
    let (sink, stream) = socket.split();
    let conn = Arc::new(Connection::new(&username, ConnectionKind::Channel, sink));

    // A newer session replaces the old one.
    if let Some(previous) = state.hub.get_connection(&username) {
        state.channels.disconnect(&previous).await;
        previous.close(state.write_timeout).await;
    }
    if let Err(e) = state.hub.add_connection(conn.clone()) {
        reject(&state, &conn, &e).await;
        return;
    }
    if let Err(e) = state.channels.join(&channel_name, &username, None).await {
        state.hub.remove_connection(&conn);
        reject(&state, &conn, &e).await;
        return;
    }
    set_presence(&state, &username, true).await;
    info!(user = %username, channel = %channel_name, "channel socket connected");

    read_frames(&state, &conn, stream).await;

    state.channels.disconnect(&conn).await;
    if state.hub.get_connection(&username).is_none() {
        set_presence(&state, &username, false).await;
    }
    conn.close(state.write_timeout).await;
    info!(user = %username, channel = %channel_name, "channel socket closed");
}

async fn run_system_socket(state: Arc<AppState>, socket: WebSocket, username: String) {
    let (sink, stream) = socket.split();
    let conn = Arc::new(Connection::new(&username, ConnectionKind::System, sink));

    if let Some(previous) = state.hub.get_system_connection(&username) {
        state.hub.remove_system_connection(&previous);
        previous.close(state.write_timeout).await;
    }
    if let Err(e) = state.hub.add_system_connection(conn.clone()) {
        reject(&state, &conn, &e).await;
        return;
    }
    debug!(user = %username, "system socket connected");

    read_frames(&state, &conn, stream).await;

    state.hub.remove_system_connection(&conn);
    conn.close(state.write_timeout).await;
    debug!(user = %username, "system socket closed");
}

/// Serial reader: one frame is fully dispatched before the next is read.
/// Ends when the client goes away, the socket is reaped, or the server
/// shuts down.
async fn read_frames(
    state: &AppState,
    conn: &Connection,
    mut stream: futures_util::stream::SplitStream<WebSocket>,
) {
    loop {
        let message = tokio::select! {
            _ = conn.closed() => break,
            _ = state.shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = state
                    .dispatcher
                    .handle_frame(&conn.username, text.as_str())
                    .await
                {
                    debug!(user = %conn.username, error = %e, "frame rejected");
                    send_error(state, conn, &e).await;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(user = %conn.username, error = %e, "socket read failed");
                break;
            }
        }
    }
}

async fn send_error(state: &AppState, conn: &Connection, err: &CoreError) {
    let frame = ChatMessage::error(err).to_json();
    if let Err(e) = conn.send_text(frame.into(), state.write_timeout).await {
        debug!(user = %conn.username, error = %e, "could not deliver error frame");
    }
}

async fn reject(state: &AppState, conn: &Connection, err: &CoreError) {
    warn!(user = %conn.username, error = %err, "socket registration failed");
    send_error(state, conn, err).await;
    conn.close(state.write_timeout).await;
}

async fn set_presence(state: &AppState, username: &str, online: bool) {
    if let Err(e) = presence::set_status(&state.db, username, online, Utc::now()).await {
        warn!(user = %username, error = %e, "failed to update presence");
    }
}
