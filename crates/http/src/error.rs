use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use engine::BundleError;
use pool::PoolError;
use resolver::ResolveError;
use transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The metadata source answered with something that is not a file match.
    #[error("malformed function metadata: {0}")]
    Metadata(String),
    #[error(transparent)]
    Spawn(#[from] PoolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("isolate at {address} did not respond within {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("invalid request body: {0}")]
    Body(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        let code = match self {
            ProxyError::Resolve(err) => err.status(),
            ProxyError::Body(_) => 400,
            ProxyError::Metadata(_)
            | ProxyError::Spawn(_)
            | ProxyError::Transport(_)
            | ProxyError::Timeout { .. }
            | ProxyError::Bundle(_) => 500,
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Message shown to the caller. Metadata detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::Metadata(_) => "failed to load function metadata".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": { "message": self.public_message() } })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        } else {
            tracing::debug!("Request failed: {}", self);
        }
        (status, Json(self.to_json())).into_response()
    }
}
