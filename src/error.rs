use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors raised by the chat core, the stores and the upstream clients.
#[derive(Debug, Error)]
pub enum BuddyError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    /// A backend that is optional was not configured.
    #[error("{0} is not configured")]
    Disabled(&'static str),

    /// An upstream service answered with a non-success status.
    #[error("{service} returned {status}: {body}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("empty response from {0}")]
    EmptyResponse(&'static str),

    #[error("no speech could be recognized")]
    NoSpeech,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuddyError>;

impl BuddyError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } | Self::EmptyResponse(_) | Self::NoSpeech | Self::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Config(_) | Self::Serialization(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for BuddyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
