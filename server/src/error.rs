use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the collaboration core. Each variant maps to one
/// status code, used both for HTTP responses and for WebSocket error frames.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Rate limit exceeded. Please slow down.")]
    RateLimited,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
            CoreError::Persistence(_) | CoreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Numeric code carried in error payloads; always equal to the HTTP status.
    pub fn code(&self) -> u16 {
        self.status().as_u16()
    }

    /// Message safe to show to clients. Store and transport details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            CoreError::Persistence(_) => "Database error".to_string(),
            CoreError::Internal(_) => "Internal server error".to_string(),
            CoreError::Transport(_) => "Message transport unavailable".to_string(),
            other => other.to_string(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            message: self.public_message(),
            code: self.code(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.is_unique_violation()
        {
            return CoreError::Conflict("Resource already exists".into());
        }
        if let sqlx::Error::RowNotFound = err {
            return CoreError::NotFound("Resource not found".into());
        }
        CoreError::Persistence(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CoreError::Timeout("deadline exceeded".into())
    }
}

/// `error` member of the response envelope.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct ErrorBody {
    pub message: String,
    pub code: u16,
}

/// Response envelope shared by every REST endpoint:
/// `{success, data?, error?{message, code}}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = self
            .error
            .as_ref()
            .and_then(|e| StatusCode::from_u16(e.code).ok())
            .unwrap_or(StatusCode::OK);
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        match &self {
            CoreError::Persistence(detail) | CoreError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
            }
            CoreError::Transport(detail) => {
                tracing::warn!(error = %detail, "transport failure during request");
            }
            _ => {}
        }
        ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.body()),
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(CoreError::Validation("x".into()).code(), 400);
        assert_eq!(CoreError::Unauthorized("x".into()).code(), 401);
        assert_eq!(CoreError::Forbidden("x".into()).code(), 403);
        assert_eq!(CoreError::NotFound("x".into()).code(), 404);
        assert_eq!(CoreError::Conflict("x".into()).code(), 409);
        assert_eq!(CoreError::RateLimited.code(), 429);
        assert_eq!(CoreError::Persistence("x".into()).code(), 500);
    }

    #[test]
    fn test_persistence_details_are_hidden() {
        let err = CoreError::Persistence("disk I/O error at page 7".into());
        assert_eq!(err.public_message(), "Database error");
        let err = CoreError::Forbidden("Admin privileges required".into());
        assert_eq!(err.public_message(), "Admin privileges required");
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn test_error_envelope_shape() {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(CoreError::Conflict("Channel already exists".into()).body()),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("data").is_none());
        assert_eq!(json["error"]["code"], 409);
        assert_eq!(json["error"]["message"], "Channel already exists");
    }

    #[test]
    fn test_ok_envelope_omits_error() {
        let json = serde_json::to_value(ApiResponse::ok(vec![1, 2])).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], serde_json::json!([1, 2]));
        assert!(json.get("error").is_none());
    }
}
