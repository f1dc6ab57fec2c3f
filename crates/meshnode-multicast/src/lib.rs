//! Multicast discovery (C8): link-local beaconing for same-LAN peer
//! discovery (spec §4.8).
//!
//! Grounded on `examples/original_source/src/multicast/multicast_unix.go`'s
//! `SO_REUSEPORT` socket option (needed here for the same reason: several
//! per-interface sockets share one UDP port) and
//! `examples/original_source/src/multicast/admin.go`'s
//! `GetMulticastInterfacesResponse` shape, reused verbatim for
//! [`MulticastDiscovery::active_interfaces`]. Interface enumeration is
//! grounded on `radicle-dev-radicle-link::librad::net::peer::Peer::bootstrap`'s
//! `pnet_datalink::interfaces()` use.

use std::collections::HashSet;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use meshnode_link::{LinkKind, LinkManager};

/// A fixed, arbitrarily chosen link-local multicast group for this
/// overlay's beacons (spec §4.8 calls for "a fixed IPv6 link-local
/// multicast group" but does not name one).
pub const BEACON_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x4d4e);
pub const BEACON_PORT: u16 = 9735;

const BEACON_INTERVAL: Duration = Duration::from_secs(10);
const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum MulticastError {
    #[error("invalid interface filter regex: {0}")]
    InvalidFilter(#[from] regex::Error),
    #[error("socket error on interface {iface}: {source}")]
    Socket {
        iface: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Beacon {
    #[serde(with = "hex_key")]
    public_key: [u8; 32],
    domain: String,
    scheme: String,
    port: u16,
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))
    }
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

struct MatchedInterface {
    name: String,
    index: u32,
}

fn matched_interfaces(filter: &Regex) -> Vec<MatchedInterface> {
    pnet_datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && filter.is_match(&iface.name))
        .map(|iface| MatchedInterface {
            name: iface.name,
            index: iface.index,
        })
        .collect()
}

/// Per-interface beacon sender/listener, plus the set of remote keys
/// already dialed so a steady stream of beacons doesn't re-trigger a dial
/// every interval.
pub struct MulticastDiscovery {
    local_public_key: [u8; 32],
    local_domain: String,
    advertise_scheme: String,
    advertise_port: u16,
    link_manager: Arc<LinkManager>,
    interface_filter: Regex,
    known_keys: parking_lot::RwLock<HashSet<[u8; 32]>>,
    active_interfaces: parking_lot::RwLock<Vec<String>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl MulticastDiscovery {
    /// `advertise_scheme`/`advertise_port` are what this node tells
    /// beacon-receiving neighbours to dial back on (the locally listened
    /// transport, e.g. `("tcp", 9000)`). `interface_filter_pattern` is the
    /// regex matched against OS interface names (spec §4.8).
    pub fn new(
        local_public_key: [u8; 32],
        local_domain: String,
        advertise_scheme: String,
        advertise_port: u16,
        link_manager: Arc<LinkManager>,
        interface_filter_pattern: &str,
    ) -> Result<Arc<Self>, MulticastError> {
        let interface_filter = Regex::new(interface_filter_pattern)?;
        Ok(Arc::new(MulticastDiscovery {
            local_public_key,
            local_domain,
            advertise_scheme,
            advertise_port,
            link_manager,
            interface_filter,
            known_keys: parking_lot::RwLock::new(HashSet::new()),
            active_interfaces: parking_lot::RwLock::new(Vec::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Opens one socket per matched interface, scoped to that interface's
    /// multicast zone, and spawns its beacon + listen loop.
    pub fn spawn(self: &Arc<Self>) -> Result<(), MulticastError> {
        let mut active = Vec::new();
        let mut tasks = Vec::new();

        for iface in matched_interfaces(&self.interface_filter) {
            let socket = bind_multicast_socket(iface.index).map_err(|e| MulticastError::Socket {
                iface: iface.name.clone(),
                source: e,
            })?;
            let socket = Arc::new(socket);
            active.push(iface.name.clone());

            let this = Arc::clone(self);
            let beacon_socket = Arc::clone(&socket);
            let iface_name = iface.name.clone();
            tasks.push(tokio::spawn(async move {
                this.beacon_loop(beacon_socket, iface_name).await;
            }));

            let this = Arc::clone(self);
            let iface_name = iface.name.clone();
            tasks.push(tokio::spawn(async move {
                this.listen_loop(socket, iface_name, iface.index).await;
            }));
        }

        *self.active_interfaces.write() = active;
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    async fn beacon_loop(self: Arc<Self>, socket: Arc<UdpSocket>, iface_name: String) {
        let beacon = Beacon {
            public_key: self.local_public_key,
            domain: self.local_domain.clone(),
            scheme: self.advertise_scheme.clone(),
            port: self.advertise_port,
        };
        let payload = match serde_json::to_vec(&beacon) {
            Ok(p) => p,
            Err(_) => {
                warn!(iface = %iface_name, "failed to encode beacon, disabling beacon loop for this interface");
                return;
            }
        };
        let dest = SocketAddrV6::new(BEACON_GROUP, BEACON_PORT, 0, 0);
        let mut interval = tokio::time::interval(BEACON_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = socket.send_to(&payload, dest).await {
                debug!(iface = %iface_name, error = %e, "beacon send failed");
            }
        }
    }

    async fn listen_loop(self: Arc<Self>, socket: Arc<UdpSocket>, iface_name: String, iface_index: u32) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(iface = %iface_name, error = %e, "multicast recv failed, listen loop exiting");
                    return;
                }
            };
            let beacon: Beacon = match serde_json::from_slice(&buf[..n]) {
                Ok(b) => b,
                Err(_) => continue,
            };
            if beacon.public_key == self.local_public_key {
                continue;
            }
            if !self.known_keys.write().insert(beacon.public_key) {
                continue;
            }

            let ip = match from.ip() {
                std::net::IpAddr::V6(v6) => v6,
                std::net::IpAddr::V4(_) => continue,
            };
            let host = if is_link_local(&ip) {
                format!("[{ip}%{iface_index}]")
            } else {
                format!("[{ip}]")
            };
            let uri = format!("{}://{}:{}", beacon.scheme, host, beacon.port);

            info!(domain = %beacon.domain, %uri, iface = %iface_name, "discovered neighbour via multicast beacon");
            if let Err(e) = self
                .link_manager
                .add(&uri, Some(iface_name.clone()), LinkKind::Ephemeral)
                .await
            {
                debug!(%uri, error = %e, "failed to add discovered multicast peer");
            }
        }
    }

    /// For the HTTP API's `/api/multicastinterfaces` (spec §4.9), mirroring
    /// the reference implementation's `GetMulticastInterfacesResponse`.
    pub fn active_interfaces(&self) -> Vec<String> {
        self.active_interfaces.read().clone()
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn bind_multicast_socket(iface_index: u32) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Socket, Type};

    let socket = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.set_only_v6(true)?;
    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, BEACON_PORT, 0, 0);
    let bind_addr: std::net::SocketAddr = bind_addr.into();
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v6(&BEACON_GROUP, iface_index)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_local_detection() {
        assert!(is_link_local(&"fe80::1".parse().unwrap()));
        assert!(!is_link_local(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn beacon_round_trips_through_json() {
        let beacon = Beacon {
            public_key: [7u8; 32],
            domain: "alice".into(),
            scheme: "tcp".into(),
            port: 9000,
        };
        let encoded = serde_json::to_vec(&beacon).unwrap();
        let decoded: Beacon = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.public_key, beacon.public_key);
        assert_eq!(decoded.domain, "alice");
    }

    #[tokio::test]
    async fn new_rejects_invalid_regex() {
        let result = MulticastDiscovery::new(
            [0u8; 32],
            "alice".into(),
            "tcp".into(),
            9000,
            test_link_manager(),
            "[invalid(",
        );
        assert!(matches!(result, Err(MulticastError::InvalidFilter(_))));
    }

    fn test_link_manager() -> Arc<LinkManager> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.serialize_der().unwrap();
        let key_der = cert.serialize_private_key_der();
        LinkManager::new([0u8; 32], "node".into(), HashSet::new(), (cert_der, key_der)).unwrap()
    }
}
