//! `GET /api/sse` (spec §4.9): a single event stream multiplexing `peers`,
//! `rxtx`, `coord`, and `health` events, so a dashboard only needs one
//! connection.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::AppState;

const EVENT_CHANNEL_CAPACITY: usize = 128;
const RXTX_INTERVAL: Duration = Duration::from_secs(5);
const COORD_INTERVAL: Duration = Duration::from_secs(30);

pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(forward_peers_changed(Arc::clone(&state), tx.clone()));
    tokio::spawn(emit_rxtx_snapshots(Arc::clone(&state), tx.clone()));
    tokio::spawn(emit_coord_snapshots(Arc::clone(&state), tx.clone()));
    tokio::spawn(forward_health_events(Arc::clone(&state), tx));

    let stream = ReceiverStream::new(rx).map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn send_event(tx: &mpsc::Sender<Event>, kind: &str, data: serde_json::Value) {
    let event = Event::default().event(kind).json_data(data);
    if let Ok(event) = event {
        let _ = tx.send(event).await;
    }
}

/// `peers` events: fired whenever the link manager's peer set changes.
async fn forward_peers_changed(state: Arc<AppState>, tx: mpsc::Sender<Event>) {
    let mut changed = state.core.link_manager().subscribe_peers_changed();
    loop {
        if changed.changed().await.is_err() {
            return;
        }
        let peers = state.core.peers().await;
        send_event(&tx, "peers", json!(peers)).await;
        if tx.is_closed() {
            return;
        }
    }
}

/// `rxtx` events: periodic per-peer throughput counters.
async fn emit_rxtx_snapshots(state: Arc<AppState>, tx: mpsc::Sender<Event>) {
    let mut ticker = tokio::time::interval(RXTX_INTERVAL);
    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }
        let peers = state.core.peers().await;
        let snapshot: Vec<_> = peers
            .iter()
            .map(|p| json!({ "uri": p.key.uri, "rx": p.state.rx, "tx": p.state.tx }))
            .collect();
        send_event(&tx, "rxtx", json!(snapshot)).await;
    }
}

/// `coord` events: periodic self/tree coordinate snapshot, for dashboards
/// that plot this node's position in the spanning tree.
async fn emit_coord_snapshots(state: Arc<AppState>, tx: mpsc::Sender<Event>) {
    let mut ticker = tokio::time::interval(COORD_INTERVAL);
    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }
        let self_info = state.core.self_info().await;
        let tree = state.core.tree().await;
        send_event(&tx, "coord", json!({ "self": self_info, "tree": tree })).await;
    }
}

/// `health` events: results from `POST /api/health` probes, forwarded as
/// they complete.
async fn forward_health_events(state: Arc<AppState>, tx: mpsc::Sender<Event>) {
    let mut rx = state.health_events.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                send_event(&tx, "health", event).await;
                if tx.is_closed() {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
