//! Agent error taxonomy and its HTTP rendering.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// An OS metric call failed. Never cached; the next call retries.
    #[error("failed to read {kind}: {reason}")]
    Provider { kind: &'static str, reason: String },

    #[error("invalid metric: {0}")]
    InvalidMetric(String),

    #[error("invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("missing token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("cannot sign token: {0}")]
    Signing(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("secret key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    pub fn provider(kind: &'static str, reason: impl ToString) -> Self {
        AgentError::Provider {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AgentError::InvalidMetric(_) | AgentError::InvalidDuration(_) => {
                StatusCode::BAD_REQUEST
            }
            AgentError::MissingToken | AgentError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AgentError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AgentError::Provider { .. }
            | AgentError::Signing(_)
            | AgentError::Task(_)
            | AgentError::KeyFile { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "error": self.to_string() });
        if status == StatusCode::TOO_MANY_REQUESTS {
            body["retry_after"] = json!(60);
        }
        (status, Json(body)).into_response()
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
