//! NodeInfo store (C6): this node's published metadata, plus the pending
//! remote-query callback table shared by the protocol handler.
//!
//! Grounded on `examples/original_source/src/core/nodeinfo.go`'s map +
//! mutex shape and spec §4.6/§9's TTL/interval entanglement note.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, warn};

pub const MAX_NODEINFO_BYTES: usize = 16 * 1024;
pub const DEFAULT_CALLBACK_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum NodeInfoError {
    #[error("nodeinfo exceeds {MAX_NODEINFO_BYTES} bytes after serialization")]
    TooLarge,
    #[error("nodeinfo must serialize to a JSON object")]
    NotAnObject,
}

struct PendingCallback {
    tx: Option<oneshot::Sender<Value>>,
    created_at: SystemTime,
}

struct State {
    my_nodeinfo: Value,
    pending: HashMap<[u8; 32], PendingCallback>,
}

/// Holds this node's own published metadata and the table of in-flight
/// remote nodeinfo queries. All mutation goes through `&self` methods
/// backed by a single `tokio::sync::RwLock`, matching the "single-consumer
/// actor" note in spec §5 (approach (b): a lock-guarded struct where every
/// public method locks, rather than a separate command-channel task).
pub struct NodeInfoStore {
    state: RwLock<State>,
    ttl: Duration,
    gc_interval: Duration,
}

impl NodeInfoStore {
    /// `ttl` and `gc_interval` default to 60s/30s per spec §4.6. Rejecting
    /// `ttl < 2 * gc_interval` (spec §9) is `Core::new`'s job, since that's
    /// where the configured values first meet each other; this constructor
    /// just stores whatever it's given.
    pub fn new(ttl: Duration, gc_interval: Duration) -> Arc<Self> {
        Arc::new(NodeInfoStore {
            state: RwLock::new(State {
                my_nodeinfo: Value::Object(serde_json::Map::new()),
                pending: HashMap::new(),
            }),
            ttl,
            gc_interval,
        })
    }

    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.gc_interval);
            loop {
                interval.tick().await;
                this.gc().await;
            }
        })
    }

    async fn gc(&self) {
        let now = SystemTime::now();
        let ttl = self.ttl;
        let mut state = self.state.write().await;
        let before = state.pending.len();
        state
            .pending
            .retain(|_, cb| now.duration_since(cb.created_at).unwrap_or_default() < ttl);
        let evicted = before - state.pending.len();
        if evicted > 0 {
            debug!(evicted, "nodeinfo gc evicted stale pending callbacks");
        }
    }

    /// Replace this node's published metadata. When `privacy` is false,
    /// injects `buildname`/`buildversion`/`buildplatform`/`buildarch` into
    /// the map before storing, per spec §3's NodeInfo data model.
    pub async fn set_nodeinfo(
        &self,
        mut map: serde_json::Map<String, Value>,
        privacy: bool,
    ) -> Result<(), NodeInfoError> {
        if !privacy {
            map.insert("buildname".into(), Value::String(env!("CARGO_PKG_NAME").into()));
            map.insert(
                "buildversion".into(),
                Value::String(env!("CARGO_PKG_VERSION").into()),
            );
            map.insert(
                "buildplatform".into(),
                Value::String(std::env::consts::OS.into()),
            );
            map.insert(
                "buildarch".into(),
                Value::String(std::env::consts::ARCH.into()),
            );
        }
        let value = Value::Object(map);
        let encoded = serde_json::to_vec(&value).map_err(|_| NodeInfoError::NotAnObject)?;
        if encoded.len() > MAX_NODEINFO_BYTES {
            return Err(NodeInfoError::TooLarge);
        }
        self.state.write().await.my_nodeinfo = value;
        Ok(())
    }

    pub async fn nodeinfo(&self) -> Value {
        self.state.read().await.my_nodeinfo.clone()
    }

    /// Register a pending remote query and return a receiver woken exactly
    /// once: either by `resolve` on a matching response, or never (the
    /// caller applies its own 6s deadline per spec §4.5 — this store only
    /// owns the 60s/30s callback-table lifetime, not the request deadline).
    pub async fn register(&self, remote_key: [u8; 32]) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.write().await;
        state.pending.insert(
            remote_key,
            PendingCallback {
                tx: Some(tx),
                created_at: SystemTime::now(),
            },
        );
        rx
    }

    /// Deliver a response to the first still-pending callback for
    /// `remote_key`. A second call for the same key is a no-op: duplicate
    /// responses are ignored per spec §4.5.
    pub async fn resolve(&self, remote_key: [u8; 32], response: Value) {
        let tx = {
            let mut state = self.state.write().await;
            state.pending.get_mut(&remote_key).and_then(|cb| cb.tx.take())
        };
        if let Some(tx) = tx {
            // Fire the callback after releasing the map lock (spec §9's
            // "suspension inside a lock" note): `send` never awaits, but
            // keeping the lock released here matches the required shape.
            let _ = tx.send(response);
        }
    }
}
