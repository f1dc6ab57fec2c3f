//! Top-level runtime wiring: turns a [`NodeConfig`] into the running set of
//! components (spec §2's data flow) and tears them down in the order spec
//! §7 requires on shutdown.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use meshnode_address::Prefix;
use meshnode_config::{generate_signing_key, key_fingerprint, parse_private_key_pem, FileConfigPersist, NodeConfig};
use meshnode_core::{Core, CoreError, Identity, NullPacketConn, PacketConn};
use meshnode_dns::{DnsConfig, DnsServer};
use meshnode_httpapi::{HttpApi, HttpApiConfig};
use meshnode_link::{LinkKind, LinkManager, PeerSink};
use meshnode_multicast::MulticastDiscovery;
use meshnode_tun::driver::NullTunnelDriverFactory;
use meshnode_tun::TunBridge;
use tracing::{info, warn};

const NODEINFO_TTL: Duration = Duration::from_secs(300);
const NODEINFO_GC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_HTTP_ADDRESS: &str = "127.0.0.1:9993";
const DEFAULT_IF_NAME: &str = "meshnode0";

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Link(#[from] meshnode_link::LinkError),
    #[error(transparent)]
    Tun(#[from] meshnode_tun::TunBridgeError),
    #[error(transparent)]
    Dns(#[from] meshnode_dns::DnsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Every running component, held long enough to tear them down in order.
pub struct Runtime {
    multicast: Option<Arc<MulticastDiscovery>>,
    tun: Option<Arc<TunBridge>>,
    core: Arc<Core>,
    http: Arc<HttpApi>,
    dns: Option<Arc<DnsServer>>,
}

impl Runtime {
    /// Shutdown order per spec §7: multicast, then TUN, then the core's
    /// `PacketConn`, then the control-plane listeners.
    pub async fn shutdown(&self) {
        if let Some(multicast) = &self.multicast {
            multicast.shutdown().await;
        }
        if let Some(tun) = &self.tun {
            tun.shutdown().await;
        }
        self.core.shutdown().await;
        self.http.shutdown().await;
        if let Some(dns) = &self.dns {
            dns.shutdown().await;
        }
    }
}

pub fn resolve_identity(config: &NodeConfig) -> Result<Identity, StartError> {
    if let Some(pem_text) = &config.private_key {
        let key = parse_private_key_pem(pem_text).map_err(|e| StartError::Config(e.to_string()))?;
        return Ok(Identity::FromSigningKey(key));
    }
    if let Some(path) = &config.private_key_path {
        let text = std::fs::read_to_string(path)?;
        let key = parse_private_key_pem(&text).map_err(|e| StartError::Config(e.to_string()))?;
        return Ok(Identity::FromSigningKey(key));
    }
    Err(StartError::Config(
        "no PrivateKey or PrivateKeyPath configured; use --genconf or --autoconf".into(),
    ))
}

fn parse_allowed_keys(config: &NodeConfig) -> Result<HashSet<[u8; 32]>, StartError> {
    config
        .allowed_public_keys
        .iter()
        .map(|s| {
            let bytes = hex::decode(s).map_err(|e| StartError::Config(format!("bad AllowedPublicKeys entry {s:?}: {e}")))?;
            bytes
                .try_into()
                .map_err(|_| StartError::Config(format!("AllowedPublicKeys entry {s:?} is not 32 bytes")))
        })
        .collect()
}

/// Splits `scheme://host:port` far enough to recover the scheme and
/// trailing port, for advertising this node's listen address over
/// multicast beacons (spec §4.8).
fn scheme_and_port(uri: &str) -> Option<(String, u16)> {
    let scheme = uri.split("://").next()?.to_string();
    let port_str = uri.rsplit(':').next()?.trim_end_matches(']');
    let port: u16 = port_str.parse().ok()?;
    Some((scheme, port))
}

pub async fn start(config: NodeConfig, config_path: Option<PathBuf>) -> Result<Runtime, StartError> {
    let domain_name = config
        .domain
        .clone()
        .ok_or_else(|| StartError::Config("no Domain configured".into()))?;
    let identity = resolve_identity(&config)?;
    let public_key = identity.public_key();
    info!(fingerprint = %key_fingerprint(&public_key), domain = %domain_name, "identity loaded");

    let prefix = config.network_domain.prefix.map(Prefix).unwrap_or_default();
    let tld = config
        .ddns_server
        .as_ref()
        .and_then(|d| d.tld.clone())
        .unwrap_or_else(|| "mesh.".to_string());

    let cert = rcgen::generate_simple_self_signed(vec![domain_name.clone()])
        .map_err(|e| StartError::Config(format!("self-signed cert generation failed: {e}")))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| StartError::Config(format!("self-signed cert serialization failed: {e}")))?;
    let key_der = cert.serialize_private_key_der();

    let allowed_keys = parse_allowed_keys(&config)?;
    let link_manager = LinkManager::new(public_key, domain_name.clone(), allowed_keys, (cert_der, key_der))?;

    // No real PacketConn backend was retrieved for this component (spec
    // §6.3 describes it as injected); the null implementation accepts
    // authenticated handoffs and discards traffic, so routing is
    // exercised by the link manager and core dispatch but no packets
    // actually flow end to end yet.
    let mtu = config.if_mtu.unwrap_or(meshnode_tun::DEFAULT_MAX_MTU);
    let packet_conn: Arc<dyn PacketConn> = Arc::new(NullPacketConn::new(mtu));

    let core = Core::new(
        identity,
        domain_name.clone(),
        tld.clone(),
        prefix,
        packet_conn,
        Arc::clone(&link_manager),
        NODEINFO_TTL,
        NODEINFO_GC_INTERVAL,
    )
    .await?;
    link_manager
        .set_peer_sink(Arc::downgrade(&core) as std::sync::Weak<dyn PeerSink>)
        .await;
    core.spawn().await;

    for uri in &config.listen {
        link_manager.listen(uri, None).await?;
    }
    for uri in &config.peers {
        link_manager.add(uri, None, LinkKind::Persistent).await?;
    }
    for (iface, uris) in &config.interface_peers {
        for uri in uris {
            link_manager.add(uri, Some(iface.clone()), LinkKind::Persistent).await?;
        }
    }

    let if_name = config.if_name.clone().unwrap_or_else(|| DEFAULT_IF_NAME.to_string());
    let tun = TunBridge::open(&NullTunnelDriverFactory, &if_name, config.if_mtu, Arc::clone(&core)).await?;
    tun.spawn();
    let tun = Some(tun);

    let multicast = match config.listen.first().and_then(|uri| scheme_and_port(uri)) {
        Some((scheme, port)) if !config.multicast_interfaces.is_empty() => {
            let pattern = format!("^(?:{})$", config.multicast_interfaces.join("|"));
            let discovery = MulticastDiscovery::new(public_key, domain_name.clone(), scheme, port, Arc::clone(&link_manager), &pattern)
                .map_err(|e| StartError::Config(format!("multicast discovery: {e}")))?;
            if let Err(e) = discovery.spawn() {
                warn!(error = %e, "multicast discovery failed to bind any interface");
            }
            Some(discovery)
        }
        _ => {
            info!("no MulticastInterfaces/Listen configured, running without multicast discovery");
            None
        }
    };

    let default_http_address = DEFAULT_HTTP_ADDRESS.parse().expect("valid default socket address");
    let http_addr: SocketAddr = match &config.http_address {
        Some(addr) => addr
            .parse()
            .map_err(|e| StartError::Config(format!("invalid HttpAddress {addr:?}: {e}")))?,
        None => default_http_address,
    };
    let config_persist = config_path.map(|path| Arc::new(FileConfigPersist::new(path)) as Arc<dyn meshnode_httpapi::ConfigPersist>);
    let http = HttpApi::start(
        HttpApiConfig {
            bind_addr: http_addr,
            auth_hook: None,
            public_peers_url: config.public_peers_url.clone(),
            nodeinfo_privacy: config.node_info_privacy.unwrap_or(false),
        },
        Arc::clone(&core),
        multicast.clone(),
        config_persist,
        None,
    );

    let dns = match &config.ddns_server {
        Some(ddns) if ddns.listen_address.is_some() => {
            let bind_addr: SocketAddr = ddns
                .listen_address
                .as_ref()
                .unwrap()
                .parse()
                .map_err(|e| StartError::Config(format!("invalid DDnsServer.ListenAddress: {e}")))?;
            let upstream = ddns
                .upstream_servers
                .iter()
                .filter_map(|s| {
                    let addr: SocketAddr = s.parse().ok()?;
                    Some((addr, addr.ip().to_string()))
                })
                .collect();
            let server = DnsServer::start(
                DnsConfig {
                    bind_addr,
                    tld: tld.clone(),
                    upstream,
                },
                Arc::clone(&core),
            )
            .await?;
            Some(server)
        }
        _ => {
            info!("no DDnsServer configured, running without the DNS façade");
            None
        }
    };

    Ok(Runtime {
        multicast,
        tun,
        core,
        http,
        dns,
    })
}

pub fn autoconf() -> NodeConfig {
    let key = generate_signing_key();
    let mut domain = String::from("node-");
    domain.push_str(&hex::encode(rand::random::<[u8; 4]>()));
    NodeConfig {
        domain: Some(domain),
        private_key: Some(meshnode_config::export_private_key_pem(&key)),
        http_address: Some(DEFAULT_HTTP_ADDRESS.to_string()),
        ..Default::default()
    }
}
