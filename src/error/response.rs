use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use super::kinds::{BackendError, ExecutionError, ExportError, SessionError};

/// Structured error information extracted from an [`ExportError`].
///
/// This is intended to be serialized to JSON and consumed by HTTP clients
/// and the push channel.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// JSON body wrapping [`ErrorInfo`] in an `error` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

impl ErrorResponse {
    pub fn from_error(err: &ExportError) -> Self {
        Self {
            error: extract_error_info(err),
        }
    }

    /// Convert to pretty-printed JSON string.
    pub fn to_json_pretty(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Extract the machine-readable type and message of an error.
pub fn extract_error_info(err: &ExportError) -> ErrorInfo {
    let error_type = match err {
        ExportError::Backend(BackendError::Unavailable(_)) => "backend.unavailable",
        ExportError::Backend(BackendError::QueryError(_)) => "backend.query_error",
        ExportError::Backend(BackendError::CursorExpired(_)) => "backend.cursor_expired",
        ExportError::Write(_) => "export.write_error",
        ExportError::Session(SessionError::NotFound(_)) => "session.not_found",
        ExportError::Session(SessionError::Unauthorized(_)) => "session.unauthorized",
        ExportError::Session(SessionError::Cancelled(_)) => "session.cancelled",
        ExportError::Transition(_) => "export.invalid_transition",
        ExportError::Parse(_) => "query.parse_error",
        ExportError::Execution(ExecutionError::InvalidParameters(_)) => "request.invalid_parameters",
        ExportError::Execution(ExecutionError::UnknownFile(_)) => "export.unknown_file",
        ExportError::Execution(ExecutionError::FileNotReady { .. }) => "export.file_not_ready",
        ExportError::Config(_) => "config.error",
        ExportError::Protocol(_) => "protocol.error",
        ExportError::Io(_) => "io.error",
        ExportError::Json(_) => "json.error",
        ExportError::Generic(_) => "internal.error",
    };

    ErrorInfo {
        error_type: error_type.to_string(),
        message: err.to_string(),
    }
}

/// HTTP status for an error surfaced by a handler.
pub fn status_code(err: &ExportError) -> StatusCode {
    match err {
        ExportError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
        ExportError::Session(SessionError::Unauthorized(_)) => StatusCode::FORBIDDEN,
        ExportError::Session(SessionError::Cancelled(_)) => StatusCode::CONFLICT,
        ExportError::Transition(_) => StatusCode::CONFLICT,
        ExportError::Execution(ExecutionError::InvalidParameters(_)) => StatusCode::BAD_REQUEST,
        ExportError::Execution(ExecutionError::UnknownFile(_)) => StatusCode::NOT_FOUND,
        ExportError::Execution(ExecutionError::FileNotReady { .. }) => StatusCode::CONFLICT,
        ExportError::Parse(_) | ExportError::Protocol(_) => StatusCode::BAD_REQUEST,
        ExportError::Backend(BackendError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        ExportError::Backend(BackendError::QueryError(_)) => StatusCode::BAD_GATEWAY,
        ExportError::Backend(BackendError::CursorExpired(_)) => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ExportError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(ErrorResponse::from_error(&self))).into_response()
    }
}
