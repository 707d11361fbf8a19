use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::token::{create_token, hash_password, verify_password};
use crate::db::models::SketchRegionRow;
use crate::db::queries::{messages, users};
use crate::engine::channel_manager::{ChannelInfo, NewChannelRequest};
use crate::engine::events::ChatMessage;
use crate::engine::sketch::Sketch;
use crate::engine::validation;
use crate::error::{ApiResponse, CoreError, CoreResult};

use super::app_state::AppState;
use super::auth_middleware::AuthUser;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

// ── Accounts ────────────────────────────────────────────

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub username: String,
    pub token: String,
}

fn issue_token(state: &AppState, username: &str) -> CoreResult<String> {
    create_token(
        username,
        &state.auth_config.secret_key,
        state.auth_config.token_expiry_hours,
    )
    .map_err(|e| CoreError::Internal(format!("token signing failed: {e}")))
}

/// POST /api/register: create an account and return a token for it.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Credentials>,
) -> CoreResult<ApiResponse<AuthResponse>> {
    validation::validate_username(&body.username).map_err(CoreError::Validation)?;
    validation::validate_password(&body.password).map_err(CoreError::Validation)?;

    let hashed =
        hash_password(&body.password).map_err(|e| CoreError::Internal(e.to_string()))?;
    users::create_user(&state.db, &body.username, &hashed, Utc::now())
        .await
        .map_err(|e| match CoreError::from(e) {
            CoreError::Conflict(_) => {
                CoreError::Conflict(format!("Username {} is taken", body.username))
            }
            other => other,
        })?;

    info!(user = %body.username, "account registered");
    let token = issue_token(&state, &body.username)?;
    Ok(ApiResponse::ok(AuthResponse {
        username: body.username,
        token,
    }))
}

/// POST /api/login: exchange credentials for a token.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Credentials>,
) -> CoreResult<ApiResponse<AuthResponse>> {
    let invalid = || CoreError::Unauthorized("Invalid username or password".into());
    let user = users::get_user(&state.db, &body.username)
        .await?
        .ok_or_else(invalid)?;
    if !verify_password(&body.password, &user.hashed_password) {
        return Err(invalid());
    }
    users::touch_last_seen(&state.db, &user.username, Utc::now()).await?;

    let token = issue_token(&state, &user.username)?;
    Ok(ApiResponse::ok(AuthResponse {
        username: user.username,
        token,
    }))
}

// ── Channels ────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateChannelBody {
    pub name: String,
    pub description: Option<String>,
    pub password: Option<String>,
}

/// POST /api/createchannel: create a channel; the caller becomes its admin.
pub async fn create_channel(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateChannelBody>,
) -> CoreResult<ApiResponse<ChannelInfo>> {
    let info = state
        .channels
        .create(NewChannelRequest {
            name: body.name,
            description: body.description.filter(|d| !d.trim().is_empty()),
            password: body.password.filter(|p| !p.is_empty()),
            creator: auth.username,
        })
        .await?;
    Ok(ApiResponse::ok(info))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChannelBody {
    pub channel_name: String,
    pub password: Option<String>,
}

/// POST /api/joinchannel
pub async fn join_channel(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<JoinChannelBody>,
) -> CoreResult<ApiResponse<ChannelInfo>> {
    let info = state
        .channels
        .join(&body.channel_name, &auth.username, body.password.as_deref())
        .await?;
    Ok(ApiResponse::ok(info))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelNameBody {
    pub channel_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub channel_name: String,
}

/// POST /api/leavechannel
pub async fn leave_channel(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ChannelNameBody>,
) -> CoreResult<ApiResponse<ChannelRef>> {
    state
        .channels
        .leave(&body.channel_name, &auth.username)
        .await?;
    Ok(ApiResponse::ok(ChannelRef {
        channel_name: body.channel_name,
    }))
}

/// POST /api/deletechannel: admins only.
pub async fn delete_channel(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ChannelNameBody>,
) -> CoreResult<ApiResponse<ChannelRef>> {
    state
        .channels
        .delete(&body.channel_name, &auth.username)
        .await?;
    Ok(ApiResponse::ok(ChannelRef {
        channel_name: body.channel_name,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoleBody {
    pub channel_name: String,
    pub username: String,
    pub is_admin: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleResponse {
    pub channel_name: String,
    pub username: String,
    pub is_admin: bool,
}

/// POST /api/updatememberrole: grant or revoke channel admin.
pub async fn update_member_role(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<UpdateRoleBody>,
) -> CoreResult<ApiResponse<RoleResponse>> {
    state
        .channels
        .update_member_role(&body.channel_name, &body.username, body.is_admin, &auth.username)
        .await?;
    Ok(ApiResponse::ok(RoleResponse {
        channel_name: body.channel_name,
        username: body.username,
        is_admin: body.is_admin,
    }))
}

/// GET /api/channels
pub async fn get_channels(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> ApiResponse<Vec<ChannelInfo>> {
    ApiResponse::ok(state.channels.list(&auth.username))
}

// ── History and sketches ────────────────────────────────

#[derive(Deserialize)]
pub struct HistoryParams {
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub channel_name: String,
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
}

/// GET /api/channels/{name}/messages: newest first, members only.
pub async fn get_channel_history(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(channel_name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> CoreResult<ApiResponse<HistoryResponse>> {
    state.channels.require_member(&channel_name, &auth.username)?;

    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    // One extra row tells whether an older page exists.
    let mut rows =
        messages::fetch_history(&state.db, &channel_name, params.before, limit + 1).await?;
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let messages = rows
        .iter()
        .filter_map(|row| match ChatMessage::from_row(row) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(id = %row.id, error = %e, "skipping unreadable stored message");
                None
            }
        })
        .collect();

    Ok(ApiResponse::ok(HistoryResponse {
        channel_name,
        messages,
        has_more,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionView {
    pub key: String,
    pub start_x: i64,
    pub start_y: i64,
    pub end_x: i64,
    pub end_y: i64,
    /// Run-length encoded pixels, base64.
    pub compressed: String,
}

impl From<SketchRegionRow> for RegionView {
    fn from(row: SketchRegionRow) -> Self {
        Self {
            key: row.region_key,
            start_x: row.start_x,
            start_y: row.start_y,
            end_x: row.end_x,
            end_y: row.end_y,
            compressed: BASE64.encode(&row.compressed),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchView {
    pub id: String,
    pub display_name: String,
    pub width: u32,
    pub height: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub regions: Vec<RegionView>,
}

impl From<&Sketch> for SketchView {
    fn from(sketch: &Sketch) -> Self {
        Self {
            id: sketch.id.clone(),
            display_name: sketch.display_name.clone(),
            width: sketch.width,
            height: sketch.height,
            created_by: sketch.created_by.clone(),
            created_at: sketch.created_at,
            regions: sketch.region_rows().into_iter().map(RegionView::from).collect(),
        }
    }
}

/// GET /api/channels/{name}/sketches: current sketch state, members only.
pub async fn get_channel_sketches(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(channel_name): Path<String>,
) -> CoreResult<ApiResponse<Vec<SketchView>>> {
    state.channels.require_member(&channel_name, &auth.username)?;
    let sketches = state
        .sketches
        .list_for_channel(&channel_name)
        .iter()
        .map(|s| SketchView::from(s.as_ref()))
        .collect();
    Ok(ApiResponse::ok(sketches))
}
