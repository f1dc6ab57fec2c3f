//! Error taxonomy → HTTP status mapping (spec §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use meshnode_core::CoreError;
use meshnode_core::ProtocolError;
use meshnode_link::LinkError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("config: {0}")]
    Config(String),
    #[error("auth hook rejected the request")]
    AuthRejected,
    #[error("client source host does not match the server's bound host")]
    CrossHost,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("request timed out")]
    Timeout,
    #[error("subsystem unavailable: {0}")]
    SubsystemAbsent(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Config(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthRejected => StatusCode::UNAUTHORIZED,
            ApiError::CrossHost => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Timeout => StatusCode::BAD_GATEWAY,
            ApiError::SubsystemAbsent(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Config(msg) => ApiError::Config(msg),
            CoreError::Protocol(ProtocolError::Timeout) => ApiError::Timeout,
            CoreError::Protocol(ProtocolError::BadRequest(msg)) => ApiError::Config(msg),
            CoreError::Protocol(ProtocolError::NotReachable(msg)) => ApiError::Timeout.with_detail(msg),
            CoreError::Link(err) => err.into(),
            CoreError::PacketConn(err) => ApiError::Internal(err.to_string()),
            CoreError::Fatal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<meshnode_core::nodeinfo::NodeInfoError> for ApiError {
    fn from(e: meshnode_core::nodeinfo::NodeInfoError) -> Self {
        ApiError::Config(e.to_string())
    }
}

impl From<LinkError> for ApiError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::AlreadyConfigured(uri) => ApiError::Config(format!("already configured: {uri}")),
            LinkError::NotConfigured(uri) => ApiError::NotFound(format!("not configured: {uri}")),
            LinkError::InvalidUrl(uri) => ApiError::Config(format!("invalid peer url: {uri}")),
            LinkError::UnsupportedScheme(scheme) => ApiError::Config(format!("unsupported scheme: {scheme}")),
            LinkError::Timeout => ApiError::Timeout,
            LinkError::Transport(msg) | LinkError::Protocol(msg) => ApiError::Internal(msg),
        }
    }
}

impl ApiError {
    /// `NotReachable` carries a message the `Timeout` variant otherwise
    /// drops; logging it here keeps the mapping lossless without adding a
    /// status code the taxonomy doesn't define.
    fn with_detail(self, detail: String) -> Self {
        tracing::debug!(%detail, "mapped NotReachable to 502");
        self
    }
}
