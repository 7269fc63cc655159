use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the dashboard
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors raised while managing servers or talking to them over SSH
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Server missing connection details (Key/Password or Hostname)")]
    MissingConnectionDetails,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Connection(String),

    #[error("Authentication failed")]
    Authentication,

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Command execution failed: {0}")]
    Command(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
}

impl MonitorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Failures that happen before any diagnostic command could run.
    /// These are reported as an offline host, not as an error response.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Authentication | Self::Timeout(_) | Self::Ssh(_) | Self::Io(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingConnectionDetails | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Connection(_) | Self::Authentication | Self::Ssh(_) => StatusCode::BAD_GATEWAY,
            Self::Command(_) | Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
