//! Protocol handler (C5): the request/response plane running on top of the
//! control session tag (spec §4.5). Handles `nodeinfo_request`/
//! `nodeinfo_response` and the `debug` sub-family (`get_self`, `get_peers`,
//! `get_tree`).
//!
//! Grounded on `examples/original_source/src/core/proto.go`'s request
//! table and `controller::handler::Inner`'s callback-registry-plus-reaper
//! shape (here realized with a `tokio::time::timeout` per call instead of
//! a dedicated reaper, since each call's cleanup horizon is fixed at 60s
//! from registration).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use meshnode_proto::{ControlMessage, DebugMessage};
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

const REQUEST_DEADLINE: Duration = Duration::from_secs(6);
const CALLBACK_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("request timed out waiting for a response")]
    Timeout,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("peer not reachable: {0}")]
    NotReachable(String),
}

struct PendingCall {
    tx: Option<oneshot::Sender<DebugMessage>>,
    created_at: SystemTime,
}

struct State {
    pending: HashMap<[u8; 32], PendingCall>,
}

/// The sink a `ProtocolHandler` sends encoded control frames through. In
/// the running node this is `meshnode_core::Core::write_control`; kept as
/// a trait so the handler's request/response logic can be exercised
/// without a full `PacketConn`.
#[async_trait::async_trait]
pub trait ControlSink: Send + Sync {
    async fn send_control(&self, to_domain: &str, msg: ControlMessage) -> Result<(), ProtocolError>;
}

/// Request/response plane over the control session tag (spec C5).
pub struct ProtocolHandler {
    state: RwLock<State>,
}

impl ProtocolHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(ProtocolHandler {
            state: RwLock::new(State {
                pending: HashMap::new(),
            }),
        })
    }

    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let now = SystemTime::now();
                let mut state = this.state.write().await;
                let before = state.pending.len();
                state
                    .pending
                    .retain(|_, c| now.duration_since(c.created_at).unwrap_or_default() < CALLBACK_TTL);
                let evicted = before - state.pending.len();
                if evicted > 0 {
                    debug!(evicted, "protocol handler gc evicted stale calls");
                }
            }
        })
    }

    /// Send a debug request to `remote_key`/`domain` and wait up to 6s for
    /// a matching response (spec §4.5's request pattern).
    pub async fn request_debug<S: ControlSink + ?Sized>(
        &self,
        sink: &S,
        remote_key: [u8; 32],
        domain: &str,
        request: DebugMessage,
    ) -> Result<DebugMessage, ProtocolError> {
        if !matches!(
            request,
            DebugMessage::GetSelfRequest
                | DebugMessage::GetPeersRequest
                | DebugMessage::GetTreeRequest
                | DebugMessage::Dummy
        ) {
            return Err(ProtocolError::BadRequest(
                "request_debug called with a response variant".into(),
            ));
        }

        let rx = {
            let (tx, rx) = oneshot::channel();
            let mut state = self.state.write().await;
            state.pending.insert(
                remote_key,
                PendingCall {
                    tx: Some(tx),
                    created_at: SystemTime::now(),
                },
            );
            rx
        };

        sink.send_control(domain, ControlMessage::Debug(request))
            .await
            .map_err(|e| {
                ProtocolError::NotReachable(e.to_string())
            })?;

        match tokio::time::timeout(REQUEST_DEADLINE, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProtocolError::Timeout),
            Err(_) => {
                self.state.write().await.pending.remove(&remote_key);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Deliver an inbound debug response, firing the matching pending
    /// call exactly once. A response for a key with no pending call (a
    /// duplicate, or one that already timed out) is silently dropped.
    pub async fn deliver_debug_response(&self, remote_key: [u8; 32], response: DebugMessage) {
        let tx = {
            let mut state = self.state.write().await;
            state.pending.get_mut(&remote_key).and_then(|c| c.tx.take())
        };
        if let Some(tx) = tx {
            let _ = tx.send(response);
        }
    }

    /// Build the JSON body for a `get_self` response per spec §4.5.
    pub fn self_response_json(domain: &str, tld: &str, public_key: &[u8; 32]) -> Value {
        serde_json::json!({
            "key": hex::encode(public_key),
            "domain": domain,
            "tld": tld,
        })
    }

    /// Pack as many 32-byte keys as fit under `mtu - 2` bytes (spec
    /// §4.5's "truncated to fit under the session MTU minus 2-byte
    /// overhead; any key that would overflow is omitted").
    pub fn pack_keys(keys: &[[u8; 32]], mtu: usize) -> Vec<u8> {
        let budget = mtu.saturating_sub(2);
        let max_keys = budget / 32;
        let mut out = Vec::with_capacity(max_keys.min(keys.len()) * 32);
        for key in keys.iter().take(max_keys) {
            out.extend_from_slice(key);
        }
        out
    }

    pub fn unpack_keys(buf: &[u8]) -> Vec<[u8; 32]> {
        buf.chunks_exact(32)
            .map(|c| {
                let mut k = [0u8; 32];
                k.copy_from_slice(c);
                k
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoopbackSink {
        handler: Arc<ProtocolHandler>,
        remote_key: [u8; 32],
    }

    #[async_trait::async_trait]
    impl ControlSink for LoopbackSink {
        async fn send_control(&self, _to: &str, msg: ControlMessage) -> Result<(), ProtocolError> {
            if let ControlMessage::Debug(DebugMessage::GetSelfRequest) = msg {
                let handler = Arc::clone(&self.handler);
                let key = self.remote_key;
                tokio::spawn(async move {
                    handler
                        .deliver_debug_response(
                            key,
                            DebugMessage::GetSelfResponse(Bytes::from_static(b"{}")),
                        )
                        .await;
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn request_debug_resolves_on_matching_response() {
        let handler = ProtocolHandler::new();
        let remote_key = [7u8; 32];
        let sink = LoopbackSink {
            handler: Arc::clone(&handler),
            remote_key,
        };

        let response = handler
            .request_debug(&sink, remote_key, "peer.mesh", DebugMessage::GetSelfRequest)
            .await
            .expect("response should arrive");

        assert!(matches!(response, DebugMessage::GetSelfResponse(_)));
    }

    #[tokio::test]
    async fn duplicate_response_after_resolution_is_ignored() {
        let handler = ProtocolHandler::new();
        let remote_key = [9u8; 32];
        handler
            .deliver_debug_response(remote_key, DebugMessage::GetSelfResponse(Bytes::new()))
            .await;
        // No pending call was ever registered; this must not panic and
        // must not create a dangling entry.
        let state = handler.state.read().await;
        assert!(state.pending.is_empty());
    }

    #[test]
    fn pack_keys_omits_keys_that_would_overflow_mtu() {
        let keys = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
        let packed = ProtocolHandler::pack_keys(&keys, 70);
        assert_eq!(packed.len(), 64);
        assert_eq!(ProtocolHandler::unpack_keys(&packed), vec![[1u8; 32], [2u8; 32]]);
    }
}
