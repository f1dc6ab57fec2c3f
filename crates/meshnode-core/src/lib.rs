//! Core runtime (C4): owns identity, the authenticated [`PacketConn`], and
//! the handles to [`meshnode_link::LinkManager`] and
//! [`protocol::ProtocolHandler`]. Demultiplexes inbound frames to traffic
//! vs. control and exposes the query surface the HTTP API (C9) reads from.
//!
//! Grounded on `zerotier-vl1-service::vl1service::VL1Service` (owns its
//! sibling components, runs the inbound read loop as a daemon task) and
//! `controller::handler::Handler`/`Inner` (the `Weak` back-reference
//! pattern this crate's `PeerSink` impl reuses).

pub mod nodeinfo;
pub mod packet_conn;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ed25519_dalek::SigningKey;
use meshnode_address::{derive_address, derive_subnet, Address, Prefix, Subnet};
use meshnode_link::{Conn, LinkInfo, LinkManager, PeerHandoff, PeerSink, PeerSnapshot};
use meshnode_proto::{ControlMessage, DebugMessage, Frame};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use packet_conn::{NullPacketConn, PacketConn, PacketConnError};
pub use protocol::{ControlSink, ProtocolError, ProtocolHandler};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Link(#[from] meshnode_link::LinkError),
    #[error(transparent)]
    PacketConn(#[from] PacketConnError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// A node's identity material (spec §9's open question: the source has two
/// divergent `core.New` signatures, one taking a private key, one a TLS
/// certificate). We resolve it with a single enum so `Core::new` has one
/// constructor regardless of how the caller obtained the key material.
pub enum Identity {
    /// The common case: an Ed25519 signing key loaded from config or
    /// generated at first run.
    FromSigningKey(SigningKey),
    /// A signing key recovered from an externally managed certificate's
    /// key material (e.g. provisioned by an orchestrator). Treated
    /// identically to `FromSigningKey` once unwrapped; kept as a distinct
    /// variant so callers can tell which path a node's key came from.
    FromCert { signing_key: SigningKey, cert_der: Vec<u8> },
}

impl Identity {
    pub fn signing_key(&self) -> &SigningKey {
        match self {
            Identity::FromSigningKey(k) => k,
            Identity::FromCert { signing_key, .. } => signing_key,
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key().verifying_key().to_bytes()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfInfo {
    pub domain: String,
    #[serde(with = "hex_key")]
    pub public_key: [u8; 32],
    pub tld: String,
    pub address: String,
    pub subnet: String,
}

mod hex_key {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }
}

struct Inner {
    identity: Identity,
    domain_name: String,
    tld: String,
    prefix: Prefix,
    address: Address,
    subnet: Subnet,
    packet_conn: Arc<dyn PacketConn>,
    link_manager: Arc<LinkManager>,
    protocol: Arc<ProtocolHandler>,
    nodeinfo: Arc<nodeinfo::NodeInfoStore>,
    domain_keys: DomainKeyTable,
    read_loop: RwLock<Option<JoinHandle<()>>>,
    traffic_tx: mpsc::UnboundedSender<(Bytes, String)>,
    traffic_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<(Bytes, String)>>>,
}

/// The core runtime actor. Cheap to clone (an `Arc` around a handful of
/// `Arc`-wrapped collaborators); every mutating method takes `&self` and
/// serializes through an internal lock, per the "single-consumer actor"
/// note in spec §5.
pub struct Core {
    inner: Arc<Inner>,
}

impl Core {
    /// `tld` is the DNS suffix this node answers for (used only in
    /// `self()`'s response, not by the core itself). `nodeinfo_ttl`/
    /// `nodeinfo_gc_interval` must satisfy `ttl >= 2 * gc_interval`
    /// (spec §9); violating configs are rejected as `CoreError::Config`.
    pub async fn new(
        identity: Identity,
        domain_name: String,
        tld: String,
        prefix: Prefix,
        packet_conn: Arc<dyn PacketConn>,
        link_manager: Arc<LinkManager>,
        nodeinfo_ttl: std::time::Duration,
        nodeinfo_gc_interval: std::time::Duration,
    ) -> Result<Arc<Self>, CoreError> {
        if nodeinfo_ttl < nodeinfo_gc_interval * 2 {
            return Err(CoreError::Config(format!(
                "nodeinfo ttl ({:?}) must be at least 2x the gc interval ({:?})",
                nodeinfo_ttl, nodeinfo_gc_interval
            )));
        }
        let address = derive_address(prefix, &domain_name)
            .map_err(|e| CoreError::Config(format!("invalid domain name {domain_name:?}: {e}")))?;
        let subnet = derive_subnet(prefix, &domain_name)
            .map_err(|e| CoreError::Config(format!("invalid domain name {domain_name:?}: {e}")))?;

        let nodeinfo = nodeinfo::NodeInfoStore::new(nodeinfo_ttl, nodeinfo_gc_interval);
        let (traffic_tx, traffic_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            identity,
            domain_name,
            tld,
            prefix,
            address,
            subnet,
            packet_conn,
            link_manager,
            protocol: ProtocolHandler::new(),
            nodeinfo,
            domain_keys: DomainKeyTable::new(),
            read_loop: RwLock::new(None),
            traffic_tx,
            traffic_rx: parking_lot::Mutex::new(Some(traffic_rx)),
        });

        Ok(Arc::new(Core { inner }))
    }

    /// Start the background inbound read loop and the nodeinfo/protocol
    /// garbage collectors. Idempotent: calling twice replaces the prior
    /// read loop handle (the old task is simply dropped by Rust's normal
    /// `JoinHandle` semantics, which does not abort it — callers should
    /// only call this once per `Core`).
    pub async fn spawn(self: &Arc<Self>) {
        self.inner.nodeinfo.spawn_gc();
        self.inner.protocol.spawn_gc();

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match this.inner.packet_conn.read_from().await {
                    Ok((payload, from_domain)) => {
                        if let Err(e) = this.dispatch_inbound(Bytes::from(payload), from_domain).await {
                            warn!(error = %e, "dropping malformed inbound frame");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "packet conn read failed, core read loop exiting");
                        break;
                    }
                }
            }
        });
        *self.inner.read_loop.write().await = Some(handle);
    }

    /// Tag-byte dispatch per spec §4.4: demultiplexes every inbound frame
    /// into application traffic (forwarded to whoever holds the traffic
    /// receiver, normally the TUN bridge) vs. control (handled here).
    /// Anything that fails to parse as a frame is silently discarded.
    async fn dispatch_inbound(&self, packet: Bytes, from_domain: String) -> Result<(), CoreError> {
        let frame = match Frame::parse(packet) {
            Ok(f) => f,
            Err(_) => return Ok(()), // anything else -> discard, per spec §4.4
        };
        match frame {
            Frame::Traffic(payload) => {
                if self.inner.traffic_tx.send((payload, from_domain)).is_err() {
                    debug!("no traffic receiver attached, dropping inbound traffic frame");
                }
                Ok(())
            }
            Frame::Control(msg) => self.dispatch_control(msg, from_domain).await,
        }
    }

    async fn dispatch_control(&self, msg: ControlMessage, from_domain: String) -> Result<(), CoreError> {
        match msg {
            ControlMessage::NodeInfoRequest => {
                let nodeinfo = self.inner.nodeinfo.nodeinfo().await;
                let encoded = serde_json::to_vec(&nodeinfo).unwrap_or_default();
                let response = ControlMessage::NodeInfoResponse(Bytes::from(encoded));
                self.write_control(&from_domain, response).await
            }
            ControlMessage::NodeInfoResponse(payload) => {
                if let Some(remote_key) = self.remote_key_for_domain(&from_domain) {
                    let value: Value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
                    self.inner.nodeinfo.resolve(remote_key, value).await;
                }
                Ok(())
            }
            ControlMessage::Debug(debug_msg) => self.dispatch_debug(debug_msg, from_domain).await,
        }
    }

    async fn dispatch_debug(&self, msg: DebugMessage, from_domain: String) -> Result<(), CoreError> {
        match msg {
            DebugMessage::Dummy => Ok(()),
            DebugMessage::GetSelfRequest => {
                let self_info = self.self_info().await;
                let json = ProtocolHandler::self_response_json(
                    &self_info.domain,
                    &self_info.tld,
                    &self_info.public_key,
                );
                let body = serde_json::to_vec(&json).unwrap_or_default();
                let response = DebugMessage::GetSelfResponse(Bytes::from(body));
                self.write_control(&from_domain, ControlMessage::Debug(response)).await
            }
            DebugMessage::GetPeersRequest => {
                let keys: Vec<[u8; 32]> = self
                    .peers()
                    .await
                    .into_iter()
                    .map(|p| p.state.remote_key)
                    .collect();
                let mtu = self.mtu();
                let packed = ProtocolHandler::pack_keys(&keys, mtu);
                let response = DebugMessage::GetPeersResponse(Bytes::from(packed));
                self.write_control(&from_domain, ControlMessage::Debug(response)).await
            }
            DebugMessage::GetTreeRequest => {
                // Without a real routing layer this node's tree is just
                // its direct peers; a production `PacketConn` backend
                // would supply a richer tree via `debug_get_tree`.
                let tree = self.inner.packet_conn.debug_get_tree().await;
                let keys: Vec<[u8; 32]> = tree
                    .iter()
                    .filter_map(|v| v.get("key").and_then(Value::as_str))
                    .filter_map(|s| {
                        let bytes = hex::decode(s).ok()?;
                        let arr: [u8; 32] = bytes.try_into().ok()?;
                        Some(arr)
                    })
                    .collect();
                let mtu = self.mtu();
                let packed = ProtocolHandler::pack_keys(&keys, mtu);
                let response = DebugMessage::GetTreeResponse(Bytes::from(packed));
                self.write_control(&from_domain, ControlMessage::Debug(response)).await
            }
            DebugMessage::GetSelfResponse(_) | DebugMessage::GetPeersResponse(_) | DebugMessage::GetTreeResponse(_) => {
                // Find the peer by domain to recover its public key, then
                // hand the response to the waiting caller, if any.
                if let Some(remote_key) = self.remote_key_for_domain(&from_domain) {
                    self.inner.protocol.deliver_debug_response(remote_key, msg).await;
                }
                Ok(())
            }
        }
    }

    async fn write_control(&self, to_domain: &str, msg: ControlMessage) -> Result<(), CoreError> {
        let encoded = Frame::Control(msg).encode();
        self.inner
            .packet_conn
            .write_to(&encoded, to_domain)
            .await
            .map_err(CoreError::from)
    }

    fn remote_key_for_domain(&self, domain: &str) -> Option<[u8; 32]> {
        self.inner.domain_keys.get(domain)
    }

    /// For the HTTP API's `/api/remote/{self|peers|tree|nodeinfo}/{key}`
    /// endpoints, which only know the peer's hex-encoded public key.
    pub fn domain_for_key(&self, key: [u8; 32]) -> Option<String> {
        self.inner.domain_keys.get_domain(key)
    }

    pub async fn self_info(&self) -> SelfInfo {
        SelfInfo {
            domain: self.inner.domain_name.clone(),
            public_key: self.inner.identity.public_key(),
            tld: self.inner.tld.clone(),
            address: self.inner.address.to_string(),
            subnet: self.inner.subnet.to_string(),
        }
    }

    /// The node's domain name, fixed for the life of the process (spec §3's
    /// identity lifecycle: identity persists for the life of the process).
    pub fn domain_name(&self) -> &str {
        &self.inner.domain_name
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn subnet(&self) -> Subnet {
        self.inner.subnet
    }

    /// The DNS suffix this node answers for (spec §4.10).
    pub fn tld(&self) -> &str {
        &self.inner.tld
    }

    pub fn prefix(&self) -> Prefix {
        self.inner.prefix
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        self.inner.link_manager.peers().await
    }

    pub async fn paths(&self) -> Vec<Value> {
        self.inner.packet_conn.debug_get_paths().await
    }

    pub async fn tree(&self) -> Vec<Value> {
        self.inner.packet_conn.debug_get_tree().await
    }

    pub async fn sessions(&self) -> Vec<Value> {
        self.inner.packet_conn.debug_get_sessions().await
    }

    pub async fn dht(&self) -> Vec<Value> {
        self.inner.packet_conn.debug_get_dht().await
    }

    pub fn protocol_handler(&self) -> Arc<ProtocolHandler> {
        Arc::clone(&self.inner.protocol)
    }

    pub fn nodeinfo_store(&self) -> Arc<nodeinfo::NodeInfoStore> {
        Arc::clone(&self.inner.nodeinfo)
    }

    pub fn link_manager(&self) -> Arc<LinkManager> {
        Arc::clone(&self.inner.link_manager)
    }

    /// `PacketConn.mtu() - 1`, capped at 65535 (spec §4.4).
    pub fn mtu(&self) -> usize {
        self.inner.packet_conn.mtu().saturating_sub(1).min(65535)
    }

    /// Send a debug request (`get_self`/`get_peers`/`get_tree`) to
    /// `domain` and wait up to 6s for a response (spec §4.5).
    pub async fn request_debug(
        &self,
        remote_key: [u8; 32],
        domain: &str,
        request: DebugMessage,
    ) -> Result<DebugMessage, CoreError> {
        self.inner
            .protocol
            .request_debug(self, remote_key, domain, request)
            .await
            .map_err(CoreError::from)
    }

    /// Ask `domain` for its published nodeinfo, waiting up to 6s (spec
    /// §4.5's request pattern, applied to the nodeinfo sub-protocol rather
    /// than a debug request).
    pub async fn request_nodeinfo(&self, remote_key: [u8; 32], domain: &str) -> Result<Value, CoreError> {
        let rx = self.inner.nodeinfo.register(remote_key).await;
        self.write_control(domain, ControlMessage::NodeInfoRequest).await?;
        match tokio::time::timeout(std::time::Duration::from_secs(6), rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => Err(CoreError::Protocol(ProtocolError::Timeout)),
        }
    }

    /// Take ownership of the inbound application-traffic channel. Meant to
    /// be called exactly once, by whatever owns the TUN bridge; a second
    /// call (or one after the first) returns `None`.
    pub fn take_traffic_receiver(&self) -> Option<mpsc::UnboundedReceiver<(Bytes, String)>> {
        self.inner.traffic_rx.lock().take()
    }

    pub async fn write_traffic(&self, payload: &[u8], to_domain: &str) -> Result<(), CoreError> {
        let encoded = Frame::Traffic(Bytes::copy_from_slice(payload)).encode();
        self.inner
            .packet_conn
            .write_to(&encoded, to_domain)
            .await
            .map_err(CoreError::from)
    }

    pub async fn shutdown(&self) {
        self.inner.link_manager.shutdown().await;
        self.inner.packet_conn.close().await;
        if let Some(handle) = self.inner.read_loop.write().await.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ControlSink for Core {
    async fn send_control(&self, to_domain: &str, msg: ControlMessage) -> Result<(), ProtocolError> {
        self.write_control(to_domain, msg)
            .await
            .map_err(|e| ProtocolError::NotReachable(e.to_string()))
    }
}

/// The non-owning back-reference the link manager calls into once a link
/// authenticates (spec §9's "cyclic ownership" note): `Core` feeds the raw
/// `Conn` into its `PacketConn`, which owns the actual encryption/routing
/// state for that link from then on.
#[async_trait]
impl PeerSink for Core {
    async fn on_peer_connected(
        &self,
        conn: Conn,
        info: LinkInfo,
        remote_key: [u8; 32],
        domain_name: String,
    ) -> Result<PeerHandoff, meshnode_link::LinkError> {
        info!(domain = %domain_name, remote = %hex::encode(remote_key), "handing authenticated link to packet conn");
        self.inner.domain_keys.insert(domain_name.clone(), remote_key);
        self.inner
            .packet_conn
            .add_link(conn, info, remote_key, domain_name)
            .await
            .map_err(|e| meshnode_link::LinkError::Protocol(e.to_string()))
    }
}

/// Remembers which domain name maps to which remote public key, populated
/// as links authenticate (spec §4.5's responses are matched by key, but
/// `PacketConn.write_to`/dispatch addresses peers by domain).
#[derive(Default)]
pub struct DomainKeyTable {
    inner: parking_lot::RwLock<HashMap<String, [u8; 32]>>,
}

impl DomainKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, domain: String, key: [u8; 32]) {
        self.inner.write().insert(domain, key);
    }

    pub fn get(&self, domain: &str) -> Option<[u8; 32]> {
        self.inner.read().get(domain).copied()
    }

    /// Reverse lookup for the HTTP API's `/api/remote/*` endpoints, which
    /// address peers by key. Peer counts are small enough that a linear
    /// scan beats keeping a second map in sync.
    pub fn get_domain(&self, key: [u8; 32]) -> Option<String> {
        self.inner
            .read()
            .iter()
            .find(|(_, k)| **k == key)
            .map(|(domain, _)| domain.clone())
    }

    pub fn remove(&self, domain: &str) {
        self.inner.write().remove(domain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn test_identity() -> Identity {
        let mut csprng = rand::rngs::OsRng;
        Identity::FromSigningKey(SigningKey::generate(&mut csprng))
    }

    fn test_link_manager() -> Arc<LinkManager> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.serialize_der().unwrap();
        let key_der = cert.serialize_private_key_der();
        LinkManager::new([0u8; 32], "node".into(), HashSet::new(), (cert_der, key_der)).unwrap()
    }

    #[tokio::test]
    async fn mtu_is_packet_conn_mtu_minus_one() {
        let packet_conn: Arc<dyn PacketConn> = Arc::new(NullPacketConn::new(1400));
        let link_manager = test_link_manager();
        let core = Core::new(
            test_identity(),
            "alice".into(),
            "mesh.".into(),
            Prefix::default(),
            packet_conn,
            link_manager,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(core.mtu(), 1399);
    }

    #[tokio::test]
    async fn rejects_ttl_less_than_twice_gc_interval() {
        let packet_conn: Arc<dyn PacketConn> = Arc::new(NullPacketConn::new(1400));
        let link_manager = test_link_manager();
        let err = Core::new(
            test_identity(),
            "alice".into(),
            "mesh.".into(),
            Prefix::default(),
            packet_conn,
            link_manager,
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[tokio::test]
    async fn self_info_reflects_constructed_identity_and_domain() {
        let packet_conn: Arc<dyn PacketConn> = Arc::new(NullPacketConn::new(1400));
        let link_manager = test_link_manager();
        let identity = test_identity();
        let expected_key = identity.public_key();
        let core = Core::new(
            identity,
            "bob".into(),
            "mesh.".into(),
            Prefix::default(),
            packet_conn,
            link_manager,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let info = core.self_info().await;
        assert_eq!(info.domain, "bob");
        assert_eq!(info.public_key, expected_key);
    }
}
