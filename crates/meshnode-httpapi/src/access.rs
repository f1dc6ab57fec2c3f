//! Access control (spec §4.9): reject any request whose TCP source host
//! does not equal the server's bound host, then run the optional external
//! auth hook.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tokio::process::Command;
use tracing::warn;

use crate::error::ApiError;
use crate::AppState;

pub async fn authorize<B>(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    state: axum::extract::State<Arc<AppState>>,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, ApiError> {
    if peer.ip() != state.bound_host {
        warn!(client = %peer, bound = %state.bound_host, "rejecting cross-host request");
        return Err(ApiError::CrossHost);
    }

    if let Some(hook) = &state.auth_hook {
        run_auth_hook(hook, &request, peer).await?;
    }

    Ok(next.run(request).await)
}

/// Invokes the configured hook executable with request metadata in
/// environment variables (spec §6.3's `AuthHook`); a non-zero exit rejects
/// the request.
async fn run_auth_hook<B>(hook: &Path, request: &Request<B>, peer: SocketAddr) -> Result<(), ApiError> {
    let status = Command::new(hook)
        .env("MESHNODE_AUTH_METHOD", request.method().as_str())
        .env("MESHNODE_AUTH_PATH", request.uri().path())
        .env(
            "MESHNODE_AUTH_QUERY",
            request.uri().query().unwrap_or_default(),
        )
        .env("MESHNODE_AUTH_REMOTE_ADDR", peer.to_string())
        .status()
        .await
        .map_err(|e| ApiError::Internal(format!("auth hook failed to start: {e}")))?;

    if !status.success() {
        return Err(ApiError::AuthRejected);
    }
    Ok(())
}
