//! The `PacketConn` collaborator (spec §6.3): an authenticated, routed
//! datagram endpoint. The core never encrypts or routes traffic itself —
//! it owns identity and dispatch, and hands both raw link streams and
//! outbound frames to whatever implements this trait.

use async_trait::async_trait;
use serde_json::Value;

use meshnode_link::{Conn, LinkInfo, LinkError, PeerHandoff};

#[derive(Debug, thiserror::Error)]
pub enum PacketConnError {
    #[error("packet conn closed")]
    Closed,
    #[error("link rejected: {0}")]
    LinkRejected(String),
    #[error("io: {0}")]
    Io(String),
}

/// Authenticated routed datagram endpoint (spec §6.3's `PacketConn`).
///
/// `add_link` is not part of the spec's minimal `PacketConn` method list,
/// but is required by the data flow in spec §2 ("C2 ... hands authenticated
/// streams to C4 which feeds them to PacketConn"): it is how the core (C4)
/// delivers an authenticated physical connection, handed off by the link
/// manager, into whatever does the actual encryption and routing.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one already-decrypted, already-routed application datagram
    /// along with the domain name of the peer it arrived from.
    async fn read_from(&self) -> Result<(Vec<u8>, String), PacketConnError>;

    /// Send one application datagram to the peer identified by domain name.
    async fn write_to(&self, payload: &[u8], to_domain: &str) -> Result<(), PacketConnError>;

    /// Maximum application payload size this conn can carry in one datagram.
    fn mtu(&self) -> usize;

    async fn close(&self);

    /// Feed a freshly authenticated physical link into the routing layer.
    async fn add_link(
        &self,
        conn: Conn,
        info: LinkInfo,
        remote_key: [u8; 32],
        domain_name: String,
    ) -> Result<PeerHandoff, PacketConnError>;

    async fn debug_get_self(&self) -> Value;
    async fn debug_get_peers(&self) -> Vec<Value>;
    async fn debug_get_tree(&self) -> Vec<Value>;
    async fn debug_get_paths(&self) -> Vec<Value>;
    async fn debug_get_sessions(&self) -> Vec<Value>;
    async fn debug_get_dht(&self) -> Vec<Value>;
}

impl From<LinkError> for PacketConnError {
    fn from(e: LinkError) -> Self {
        PacketConnError::LinkRejected(e.to_string())
    }
}

/// An in-memory test double. Carries no real routing: `add_link` accepts
/// the handoff and immediately closes it, and reads never produce data.
/// Useful for exercising `Core`'s dispatch and query paths without a real
/// crypto/routing backend.
pub struct NullPacketConn {
    mtu: usize,
}

impl NullPacketConn {
    pub fn new(mtu: usize) -> Self {
        NullPacketConn { mtu }
    }
}

#[async_trait]
impl PacketConn for NullPacketConn {
    async fn read_from(&self) -> Result<(Vec<u8>, String), PacketConnError> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn write_to(&self, _payload: &[u8], _to_domain: &str) -> Result<(), PacketConnError> {
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn close(&self) {}

    async fn add_link(
        &self,
        _conn: Conn,
        _info: LinkInfo,
        _remote_key: [u8; 32],
        _domain_name: String,
    ) -> Result<PeerHandoff, PacketConnError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = tx.send(());
        Ok(PeerHandoff {
            stats: std::sync::Arc::new(meshnode_link::LinkStats::default()),
            closed: rx,
        })
    }

    async fn debug_get_self(&self) -> Value {
        Value::Null
    }
    async fn debug_get_peers(&self) -> Vec<Value> {
        Vec::new()
    }
    async fn debug_get_tree(&self) -> Vec<Value> {
        Vec::new()
    }
    async fn debug_get_paths(&self) -> Vec<Value> {
        Vec::new()
    }
    async fn debug_get_sessions(&self) -> Vec<Value> {
        Vec::new()
    }
    async fn debug_get_dht(&self) -> Vec<Value> {
        Vec::new()
    }
}
