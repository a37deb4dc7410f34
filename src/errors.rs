use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Per-field validation messages for token creation. Only the first failing
/// rule of each field is recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputErrors {
    pub title: Option<String>,
    pub description: Option<String>,
    pub permissions: Option<String>,
    pub resources: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl InputErrors {
    pub fn permissions(message: impl Into<String>) -> Self {
        Self {
            permissions: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn resources(message: impl Into<String>) -> Self {
        Self {
            resources: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0:?}")]
    InvalidInput(InputErrors),

    #[error("missing credential")]
    MissingCredential,

    #[error("Invalid token provided")]
    InvalidToken,

    #[error("Missing permission for performing '{permission}' on resource")]
    Unauthorized { permission: String },

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn unauthorized(permission: impl std::fmt::Display) -> Self {
        AppError::Unauthorized {
            permission: permission.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::InvalidInput(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "INVALID_INPUT",
                "Invalid input provided.".to_string(),
            ),
            AppError::MissingCredential => (
                StatusCode::BAD_REQUEST,
                "authentication_error",
                "MISSING_AUTH_KEY",
                "Missing authorization credential".to_string(),
            ),
            AppError::InvalidToken => (
                StatusCode::FORBIDDEN,
                "authentication_error",
                "INVALID_AUTH_KEY",
                "Invalid token provided".to_string(),
            ),
            AppError::Unauthorized { permission } => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "UNAUTHORISED",
                format!(
                    "No access (reason: \"Missing permission for performing '{}' on resource\")",
                    permission
                ),
            ),
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "NOT_FOUND",
                "Resource not found".to_string(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let mut error = json!({
            "message": msg,
            "type": error_type,
            "code": code,
        });
        if let AppError::InvalidInput(details) = &self {
            error["details"] = json!(details);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

// ── Tests ───────────────────────────────────────────────────────
