use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;

use crate::auth::token::validate_token;
use crate::error::CoreError;

use super::app_state::AppState;

/// Extractor that validates the `Authorization: Bearer <token>` header.
/// Use this in any handler that requires authentication.
pub struct AuthUser {
    pub username: String,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = CoreError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| CoreError::Unauthorized("Missing bearer token".into()))?;

        let claims = validate_token(bearer.token(), &state.auth_config.secret_key)
            .map_err(|_| CoreError::Unauthorized("Invalid or expired token".into()))?;

        Ok(AuthUser {
            username: claims.username,
        })
    }
}
