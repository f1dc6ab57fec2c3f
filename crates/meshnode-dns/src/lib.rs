//! DNS façade (C10, spec §4.10): a forwarder that resolves a configured
//! TLD by deriving an overlay address from the requested label, answers
//! `PTR` queries under `ip6.arpa.` from local knowledge where possible,
//! and forwards everything else upstream over DNS-over-TLS.
//!
//! Grounded on the original `dnsapi/dns_server.go`: match queries whose
//! name ends in the configured TLD, trim the suffix, and answer with a
//! derived `AAAA` record regardless of the query's own type; anything
//! left unanswered falls through to upstream forwarding. The PTR-specific
//! handling (own-address short-circuit, then the link manager's
//! known-peer table, then forwarding to the peer itself) has no
//! counterpart in that file — it's this façade's own resolution order,
//! built from spec §4.10's requirement and the supplement in SPEC_FULL.md.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::{Name, RData, Record};
use trust_dns_resolver::config::{
    NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts,
};
use trust_dns_resolver::TokioAsyncResolver;

use meshnode_address::{decode_address, derive_address, is_valid_address, Address, Prefix};
use meshnode_core::Core;

const MAX_DATAGRAM: usize = 4096;
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
const ANSWER_TTL: u32 = 60;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
}

pub struct DnsConfig {
    pub bind_addr: SocketAddr,
    pub tld: String,
    /// Upstream DoT resolvers, each `(address, tls_name)` — `tls_name` is
    /// the name the resolver's certificate is validated against.
    pub upstream: Vec<(SocketAddr, String)>,
}

/// The running DNS façade. Construction binds and starts serving
/// immediately; `shutdown` stops it.
pub struct DnsServer {
    shutdown_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DnsServer {
    pub async fn start(config: DnsConfig, core: Arc<Core>) -> Result<Arc<Self>, DnsError> {
        let socket = Arc::new(
            UdpSocket::bind(config.bind_addr)
                .await
                .map_err(DnsError::Bind)?,
        );
        let upstream = build_resolver(&config.upstream);

        let resolution = Resolution {
            core,
            tld: normalize_tld(&config.tld),
            upstream,
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            info!(addr = %config.bind_addr, "DNS façade listening");
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                let (len, peer) = tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "DNS façade recv failed");
                            continue;
                        }
                    },
                    _ = &mut shutdown_rx => return,
                };

                let query_bytes = buf[..len].to_vec();
                let resolution = resolution.clone();
                let reply_socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    let response = resolution.handle_datagram(&query_bytes).await;
                    if let Ok(bytes) = response.to_vec() {
                        if let Err(e) = reply_socket.send_to(&bytes, peer).await {
                            warn!(error = %e, %peer, "DNS façade reply send failed");
                        }
                    }
                });
            }
        });

        Ok(Arc::new(DnsServer {
            shutdown_tx: parking_lot::Mutex::new(Some(shutdown_tx)),
            task: parking_lot::Mutex::new(Some(task)),
        }))
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

fn normalize_tld(tld: &str) -> String {
    let trimmed = tld.trim_end_matches('.').to_ascii_lowercase();
    format!("{trimmed}.")
}

fn build_resolver(upstream: &[(SocketAddr, String)]) -> TokioAsyncResolver {
    let mut group = NameServerConfigGroup::new();
    for (addr, tls_name) in upstream {
        group.push(NameServerConfig {
            socket_addr: *addr,
            protocol: Protocol::Tls,
            tls_dns_name: Some(tls_name.clone()),
            trust_negative_responses: true,
            tls_config: None,
            bind_addr: None,
        });
    }
    let config = ResolverConfig::from_parts(None, Vec::new(), group);
    TokioAsyncResolver::tokio(config, ResolverOpts::default())
        .expect("resolver construction from a static config cannot fail")
}

#[derive(Clone)]
struct Resolution {
    core: Arc<Core>,
    tld: String,
    upstream: TokioAsyncResolver,
}

impl Resolution {
    async fn handle_datagram(&self, bytes: &[u8]) -> Message {
        let mut response = Message::new();
        let query_msg = match Message::from_vec(bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "DNS façade failed to parse query");
                response.set_response_code(ResponseCode::FormErr);
                return response;
            }
        };

        response.set_id(query_msg.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(query_msg.recursion_desired());
        response.set_recursion_available(true);

        let query = match query_msg.queries().first() {
            Some(q) => q.clone(),
            None => {
                response.set_response_code(ResponseCode::FormErr);
                return response;
            }
        };
        response.add_query(query.clone());

        let name_lower = query.name().to_utf8().to_ascii_lowercase();

        if name_lower.ends_with(&self.tld) {
            return self.answer_tld(query.name(), response);
        }
        if name_lower.ends_with("ip6.arpa.") {
            return self.answer_ptr(query.name(), response).await;
        }

        self.forward_upstream(query_msg, response).await
    }

    /// Derives an `AAAA` record from the label regardless of the query's
    /// own record type, matching the original forwarder's behavior.
    fn answer_tld(&self, name: &Name, mut response: Message) -> Message {
        let full = name.to_utf8().to_ascii_lowercase();
        let label = full
            .strip_suffix(&self.tld)
            .unwrap_or(&full)
            .trim_end_matches('.');

        match derive_address(self.core.prefix(), label) {
            Ok(addr) => {
                let ip = Ipv6Addr::from(addr.0);
                let record = Record::from_rdata(name.clone(), ANSWER_TTL, RData::AAAA(ip));
                response.add_answer(record);
                response.set_response_code(ResponseCode::NoError);
            }
            Err(e) => {
                debug!(%label, error = %e, "DNS façade: label does not decode to a valid address");
                response.set_response_code(ResponseCode::NXDomain);
            }
        }
        response
    }

    /// Resolution order (spec §4.10 plus its SPEC_FULL supplement): this
    /// node's own address, then the link manager's known-peer table, then
    /// forward the query to the queried address itself (treated as an
    /// upstream DNS server reachable over the overlay).
    async fn answer_ptr(&self, name: &Name, mut response: Message) -> Message {
        let addr = match parse_ptr_name(name) {
            Some(addr) => addr,
            None => {
                response.set_response_code(ResponseCode::FormErr);
                return response;
            }
        };

        if !is_valid_address(self.core.prefix(), addr) {
            response.set_response_code(ResponseCode::NXDomain);
            return response;
        }

        if addr == self.core.address() {
            let fqdn = format!("{}{}", self.core.domain_name(), self.tld);
            return self.ptr_answer(name, &fqdn, response);
        }

        if let Some(domain) = self.known_peer_domain(addr).await {
            let fqdn = format!("{domain}{}", self.tld);
            response = self.ptr_answer(name, &fqdn, response);
            return response;
        }

        match self.forward_ptr_to_peer(addr, name, &response).await {
            Some(forwarded) => forwarded,
            None => {
                response.set_response_code(ResponseCode::ServFail);
                response
            }
        }
    }

    fn ptr_answer(&self, name: &Name, fqdn: &str, mut response: Message) -> Message {
        match Name::from_utf8(fqdn) {
            Ok(ptr_name) => {
                let record = Record::from_rdata(name.clone(), ANSWER_TTL, RData::PTR(ptr_name));
                response.add_answer(record);
                response.set_response_code(ResponseCode::NoError);
            }
            Err(e) => {
                debug!(%fqdn, error = %e, "DNS façade: fqdn is not a valid DNS name");
                response.set_response_code(ResponseCode::ServFail);
            }
        }
        response
    }

    /// Checks whether `addr` decodes to a domain name this node currently
    /// has a live link to, answering from the link manager's known-peer
    /// table before paying for a round trip over the mesh.
    async fn known_peer_domain(&self, addr: Address) -> Option<String> {
        let candidate = decode_address(addr);
        let peers = self.core.peers().await;
        for peer in peers {
            if let Some(domain) = self.core.domain_for_key(peer.state.remote_key) {
                if domain == candidate {
                    return Some(domain);
                }
            }
        }
        None
    }

    /// Forwards the raw query datagram to `addr`'s port 53 and relays
    /// whatever reply comes back, unmodified save for the original query
    /// ID being restored by the caller already matching (both sides parse
    /// the same wire query).
    async fn forward_ptr_to_peer(&self, addr: Address, _name: &Name, request: &Message) -> Option<Message> {
        let target = SocketAddr::new(Ipv6Addr::from(addr.0).into(), 53);
        let socket = UdpSocket::bind("[::]:0").await.ok()?;
        let bytes = request.to_vec().ok()?;
        socket.send_to(&bytes, target).await.ok()?;

        let mut buf = [0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(FORWARD_TIMEOUT, socket.recv(&mut buf))
            .await
            .ok()?
            .ok()?;
        Message::from_vec(&buf[..len]).ok()
    }

    async fn forward_upstream(&self, query_msg: Message, mut response: Message) -> Message {
        let query = match query_msg.queries().first() {
            Some(q) => q.clone(),
            None => {
                response.set_response_code(ResponseCode::FormErr);
                return response;
            }
        };

        let lookup = tokio::time::timeout(
            FORWARD_TIMEOUT,
            self.upstream.lookup(query.name().clone(), query.query_type()),
        )
        .await;

        match lookup {
            Ok(Ok(answer)) => {
                for record in answer.record_iter() {
                    response.add_answer(record.clone());
                }
                response.set_response_code(ResponseCode::NoError);
            }
            Ok(Err(e)) => {
                debug!(error = %e, "DNS façade upstream lookup failed");
                response.set_response_code(upstream_error_code(&e));
            }
            Err(_) => {
                warn!("DNS façade upstream lookup timed out");
                response.set_response_code(ResponseCode::ServFail);
            }
        }
        response
    }
}

fn upstream_error_code(e: &trust_dns_resolver::error::ResolveError) -> ResponseCode {
    use trust_dns_resolver::error::ResolveErrorKind;
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => *response_code,
        _ => ResponseCode::ServFail,
    }
}

/// Parses a reversed-nibble `ip6.arpa.` query name back into an [`Address`].
fn parse_ptr_name(name: &Name) -> Option<Address> {
    let full = name.to_utf8().to_ascii_lowercase();
    let labels: Vec<&str> = full.trim_end_matches('.').split('.').collect();
    // 32 nibble labels + "ip6" + "arpa"
    if labels.len() < 34 {
        return None;
    }
    let nibbles = &labels[..32];
    let mut bytes = [0u8; 16];
    for (i, byte) in bytes.iter_mut().enumerate() {
        let hi = nibbles[i * 2 + 1].chars().next()?.to_digit(16)?;
        let lo = nibbles[i * 2].chars().next()?.to_digit(16)?;
        *byte = ((hi << 4) | lo) as u8;
    }
    Some(Address(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_tld_adds_trailing_dot() {
        assert_eq!(normalize_tld("mesh"), "mesh.");
        assert_eq!(normalize_tld("mesh."), "mesh.");
        assert_eq!(normalize_tld("MESH"), "mesh.");
    }

    #[test]
    fn parse_ptr_name_round_trips_an_address() {
        let addr = derive_address(Prefix(0xFC), "example").unwrap();
        let reversed: String = addr
            .0
            .iter()
            .rev()
            .flat_map(|b| vec![format!("{:x}", b & 0xF), format!("{:x}", b >> 4)])
            .collect::<Vec<_>>()
            .join(".");
        let fqdn = format!("{reversed}.ip6.arpa.");
        let name = Name::from_utf8(&fqdn).unwrap();
        let parsed = parse_ptr_name(&name).expect("should parse");
        assert_eq!(parsed, addr);
    }

    #[test]
    fn parse_ptr_name_rejects_short_names() {
        let name = Name::from_utf8("1.2.3.ip6.arpa.").unwrap();
        assert!(parse_ptr_name(&name).is_none());
    }
}
