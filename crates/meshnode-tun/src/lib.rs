//! TUN bridge (C7): shuttles IPv6 packets between a platform tunnel
//! interface and the core runtime's traffic channel (spec §4.7).
//!
//! Grounded on the teacher's daemon-actor shape (`JoinHandle`s collected in
//! a lock, `tokio::select!`-free paired loops) and, for the read/write loop
//! pairing itself, the `tun`-crate outbound/inbound pattern seen in the
//! pack's `rustyguard` tunnel example. No corpus platform driver survived
//! retrieval, so [`driver::TunnelDriver`] stays an injected trait only, per
//! spec §1/§6.3.

pub mod driver;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use meshnode_address::{decode_address, derive_address, is_valid_address, Address};
use meshnode_core::Core;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use driver::{NullTunnelDriver, NullTunnelDriverFactory, TunError, TunnelDriver, TunnelDriverFactory};

/// Spec §4.7: tunnel MTU is never configured below this, regardless of
/// what the platform or the caller asks for.
pub const MIN_MTU: usize = 1280;

/// Used when no explicit MTU is configured and no better platform default
/// is known to this crate.
pub const DEFAULT_MAX_MTU: usize = 9000;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum TunBridgeError {
    #[error(transparent)]
    Tun(#[from] TunError),
}

fn resolve_mtu(configured: Option<usize>) -> usize {
    configured.unwrap_or(DEFAULT_MAX_MTU).max(MIN_MTU)
}

/// A small FIFO with drop-oldest-on-overflow semantics (spec §4.7's
/// outbound send buffer): the tun-read loop must never block waiting on
/// network congestion, so it pushes into this queue instead, and a
/// separate writer task drains it into `PacketConn.write_to` at its own
/// pace.
struct OutboundQueue {
    inner: parking_lot::Mutex<VecDeque<(Bytes, String)>>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        OutboundQueue {
            inner: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, packet: Bytes, domain: String) {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            q.pop_front();
            debug!("outbound tun queue full, dropped oldest packet");
        }
        q.push_back((packet, domain));
        drop(q);
        self.notify.notify_one();
    }

    async fn pop(&self) -> (Bytes, String) {
        loop {
            if let Some(item) = self.inner.lock().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

/// Validates an outbound IPv6 packet per spec §4.7 and, if valid, returns
/// the domain name its destination decodes to.
fn outbound_domain(core: &Core, packet: &[u8]) -> Option<String> {
    if packet.len() < 40 || packet[0] >> 4 != 6 {
        return None;
    }
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&packet[24..40]);
    let dst = Address(dst);
    if !is_valid_address(core.prefix(), dst) {
        return None;
    }
    Some(decode_address(dst))
}

/// Validates an inbound packet's source address against the domain it
/// actually arrived from (spec §4.7: "packets whose source does not match
/// the derived address of the sender's domain MUST be dropped").
fn inbound_source_matches(core: &Core, packet: &[u8], from_domain: &str) -> bool {
    if packet.len() < 40 || packet[0] >> 4 != 6 {
        return false;
    }
    let expected = match derive_address(core.prefix(), from_domain) {
        Ok(addr) => addr,
        Err(_) => return false,
    };
    packet[8..24] == expected.0
}

/// The TUN bridge actor. Holds a shared reference to the core and the
/// opened tunnel driver; owns the two background loops that move packets
/// between them.
pub struct TunBridge {
    driver: Arc<dyn TunnelDriver>,
    core: Arc<Core>,
    outbound: OutboundQueue,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TunBridge {
    /// Opens the tunnel interface named `name` at the resolved MTU
    /// (`configured_mtu`, or [`DEFAULT_MAX_MTU`], floored at [`MIN_MTU`])
    /// and configures it with the core's own `/128` address.
    pub async fn open(
        factory: &dyn TunnelDriverFactory,
        name: &str,
        configured_mtu: Option<usize>,
        core: Arc<Core>,
    ) -> Result<Arc<Self>, TunBridgeError> {
        let mtu = resolve_mtu(configured_mtu);
        let driver = factory.open(name, mtu).await?;
        driver.set_address(core.address()).await?;
        Ok(Arc::new(TunBridge {
            driver,
            core,
            outbound: OutboundQueue::new(OUTBOUND_QUEUE_CAPACITY),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Starts the outbound (tun → mesh) and inbound (mesh → tun) loops.
    /// The inbound loop takes ownership of the core's traffic receiver, so
    /// this must be called at most once per `Core`.
    pub fn spawn(self: &Arc<Self>) {
        let reader = Arc::clone(self);
        let read_task = tokio::spawn(async move { reader.read_loop().await });

        let writer = Arc::clone(self);
        let write_task = tokio::spawn(async move { writer.write_loop().await });

        match self.core.take_traffic_receiver() {
            Some(traffic_rx) => {
                let inbound = Arc::clone(self);
                let inbound_task = tokio::spawn(async move { inbound.inbound_loop(traffic_rx).await });
                self.tasks.lock().extend([read_task, write_task, inbound_task]);
            }
            None => {
                warn!("tun bridge started after traffic receiver was already taken");
                self.tasks.lock().extend([read_task, write_task]);
            }
        }
    }

    /// Reads packets off the tunnel device and enqueues the ones that pass
    /// validation; never talks to the core directly so a slow network
    /// write can't stall tunnel reads.
    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = match self.driver.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "tun read failed, outbound loop exiting");
                    return;
                }
            };
            let packet = Bytes::copy_from_slice(&buf[..n]);
            match outbound_domain(&self.core, &packet) {
                Some(domain) => self.outbound.push(packet, domain),
                None => debug!("dropping invalid outbound tun packet"),
            }
        }
    }

    /// Drains the outbound queue into `Core::write_traffic` at whatever
    /// pace the network allows.
    async fn write_loop(self: Arc<Self>) {
        loop {
            let (packet, domain) = self.outbound.pop().await;
            if let Err(e) = self.core.write_traffic(&packet, &domain).await {
                debug!(error = %e, %domain, "failed to forward outbound tun packet");
            }
        }
    }

    async fn inbound_loop(self: Arc<Self>, mut rx: tokio::sync::mpsc::UnboundedReceiver<(Bytes, String)>) {
        while let Some((packet, from_domain)) = rx.recv().await {
            if !inbound_source_matches(&self.core, &packet, &from_domain) {
                debug!(%from_domain, "dropping inbound packet with spoofed source address");
                continue;
            }
            if let Err(e) = self.driver.write(&packet).await {
                warn!(error = %e, "tun write failed");
            }
        }
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.driver.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use ed25519_dalek::SigningKey;
    use meshnode_address::Prefix;
    use meshnode_core::{Identity, NullPacketConn, PacketConn};
    use meshnode_link::LinkManager;

    fn test_identity() -> Identity {
        Identity::FromSigningKey(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    fn test_link_manager() -> Arc<LinkManager> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.serialize_der().unwrap();
        let key_der = cert.serialize_private_key_der();
        LinkManager::new([0u8; 32], "node".into(), HashSet::new(), (cert_der, key_der)).unwrap()
    }

    async fn test_core(domain: &str) -> Arc<Core> {
        let packet_conn: Arc<dyn PacketConn> = Arc::new(NullPacketConn::new(1400));
        Core::new(
            test_identity(),
            domain.into(),
            "mesh.".into(),
            Prefix::default(),
            packet_conn,
            test_link_manager(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
        .await
        .unwrap()
    }

    #[test]
    fn mtu_is_floored_at_1280() {
        assert_eq!(resolve_mtu(Some(500)), MIN_MTU);
        assert_eq!(resolve_mtu(Some(9000)), 9000);
        assert_eq!(resolve_mtu(None), DEFAULT_MAX_MTU);
    }

    #[tokio::test]
    async fn outbound_domain_rejects_short_and_non_ipv6_packets() {
        let core = test_core("alice").await;
        assert!(outbound_domain(&core, &[0x60; 10]).is_none());
        let mut bad_version = vec![0u8; 40];
        bad_version[0] = 0x40; // version 4
        assert!(outbound_domain(&core, &bad_version).is_none());
    }

    #[tokio::test]
    async fn outbound_domain_decodes_destination_inside_prefix() {
        let core = test_core("alice").await;
        let dst = meshnode_address::derive_address(core.prefix(), "bob").unwrap();
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[24..40].copy_from_slice(&dst.0);
        assert_eq!(outbound_domain(&core, &packet), Some("bob".to_string()));
    }

    #[tokio::test]
    async fn inbound_source_mismatch_is_rejected() {
        let core = test_core("alice").await;
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        // source left zeroed, which does not decode to "bob"'s address
        assert!(!inbound_source_matches(&core, &packet, "bob"));

        let src = meshnode_address::derive_address(core.prefix(), "bob").unwrap();
        packet[8..24].copy_from_slice(&src.0);
        assert!(inbound_source_matches(&core, &packet, "bob"));
    }
}
