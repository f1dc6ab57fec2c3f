//! Control HTTP API (C9): JSON/REST introspection and management, plus
//! server-sent events for live peer/throughput updates (spec §4.9).
//!
//! Grounded on `examples/kizzafredrichkibalama-ic`'s certificate-issuer
//! service — the only real axum source retrieved into the pack —  for the
//! `Router::new().route(...)` shape, `Extension`/`State` shared state,
//! `middleware::from_fn` for cross-cutting concerns, and plain
//! `hyper::Server::bind` (that example serves its API over bare HTTP too;
//! this control-plane listener has no need for TLS, since access control is
//! host-equality plus an optional auth hook, not transport security).

pub mod access;
pub mod error;
pub mod format;
pub mod handlers;
pub mod health;
pub mod sse;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::{middleware, Router};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use meshnode_core::Core;
use meshnode_multicast::MulticastDiscovery;

pub use error::ApiError;
pub use health::{GeoDatabase, GeoInfo, MaxMindGeoDatabase};

const HEALTH_EVENT_CAPACITY: usize = 64;

/// Persists peer/nodeinfo mutations to the config file when a request
/// carries `Riv-Save-Config: true` (spec §4.9). Kept as a trait so this
/// crate has no hard dependency on the config file format or location.
#[async_trait]
pub trait ConfigPersist: Send + Sync {
    async fn persist_peers(&self, peers: Vec<String>) -> std::io::Result<()>;
    async fn persist_nodeinfo(&self, nodeinfo: serde_json::Value) -> std::io::Result<()>;
}

pub struct HttpApiConfig {
    pub bind_addr: SocketAddr,
    pub auth_hook: Option<PathBuf>,
    pub public_peers_url: Option<String>,
    pub nodeinfo_privacy: bool,
}

pub(crate) struct AppState {
    core: Arc<Core>,
    multicast: Option<Arc<MulticastDiscovery>>,
    config_persist: Option<Arc<dyn ConfigPersist>>,
    geo: Option<Arc<dyn GeoDatabase>>,
    auth_hook: Option<PathBuf>,
    bound_host: IpAddr,
    public_peers_url: Option<String>,
    nodeinfo_privacy: bool,
    health_events: broadcast::Sender<serde_json::Value>,
    http_client: hyper::Client<HttpsConnector<HttpConnector>, hyper::Body>,
}

impl AppState {
    async fn maybe_persist_peers(&self, save: bool) {
        if !save {
            return;
        }
        if let Some(persist) = &self.config_persist {
            let peers = self
                .core
                .link_manager()
                .peers()
                .await
                .into_iter()
                .map(|p| p.key.uri)
                .collect();
            if let Err(e) = persist.persist_peers(peers).await {
                tracing::warn!(error = %e, "failed to persist peer config");
            }
        }
    }

    async fn maybe_persist_nodeinfo(&self, save: bool) {
        if !save {
            return;
        }
        if let Some(persist) = &self.config_persist {
            let nodeinfo = self.core.nodeinfo_store().nodeinfo().await;
            if let Err(e) = persist.persist_nodeinfo(nodeinfo).await {
                tracing::warn!(error = %e, "failed to persist nodeinfo config");
            }
        }
    }
}

/// `Riv-Save-Config: true` request header (spec §4.9).
pub(crate) fn wants_save(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get("Riv-Save-Config")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// The running HTTP API server. Construction binds and starts serving
/// immediately; `shutdown` stops it gracefully.
pub struct HttpApi {
    shutdown_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpApi {
    pub fn start(
        config: HttpApiConfig,
        core: Arc<Core>,
        multicast: Option<Arc<MulticastDiscovery>>,
        config_persist: Option<Arc<dyn ConfigPersist>>,
        geo: Option<Arc<dyn GeoDatabase>>,
    ) -> Arc<Self> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let http_client = hyper::Client::builder().build(https);
        let (health_events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);

        let state = Arc::new(AppState {
            core,
            multicast,
            config_persist,
            geo,
            auth_hook: config.auth_hook,
            bound_host: config.bind_addr.ip(),
            public_peers_url: config.public_peers_url,
            nodeinfo_privacy: config.nodeinfo_privacy,
            health_events,
            http_client,
        });

        let app = router(Arc::clone(&state));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let bind_addr = config.bind_addr;

        let task = tokio::spawn(async move {
            info!(addr = %bind_addr, "control HTTP API listening");
            let server = hyper::Server::bind(&bind_addr).serve(
                app.into_make_service_with_connect_info::<SocketAddr>(),
            );
            if let Err(e) = server
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %e, "control HTTP API server exited with error");
            }
        });

        Arc::new(HttpApi {
            shutdown_tx: parking_lot::Mutex::new(Some(shutdown_tx)),
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api", get(handlers::catalog))
        .route("/api/self", get(handlers::self_info))
        .route(
            "/api/nodeinfo",
            get(handlers::nodeinfo_get).put(handlers::nodeinfo_put),
        )
        .route(
            "/api/peers",
            get(handlers::peers_get)
                .post(handlers::peers_post)
                .put(handlers::peers_put)
                .delete(handlers::peers_delete),
        )
        .route("/api/publicpeers", get(handlers::public_peers))
        .route("/api/paths", get(handlers::paths))
        .route("/api/dht", get(handlers::dht))
        .route("/api/tree", get(handlers::tree))
        .route("/api/sessions", get(handlers::sessions))
        .route("/api/multicastinterfaces", get(handlers::multicast_interfaces))
        .route("/api/remote/:kind/:key", get(handlers::remote))
        .route("/api/health", post(handlers::health))
        .route("/api/sse", get(sse::sse_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), access::authorize))
        .with_state(state)
}
