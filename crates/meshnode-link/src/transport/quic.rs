use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, IdleTimeout, ServerConfig, TransportConfig};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, PrivateKey, ServerName};
use tracing::debug;

use super::{dial_first_of, Conn, Listener, Transport};
use crate::peer_url::PeerUrl;
use crate::LinkError;

const LOG_TARGET: &str = "meshnode::link::quic";
const DIAL_STAGGER: Duration = Duration::from_millis(150);
const ALPN: &[u8] = b"meshnode";
/// Matches the spec's "token store of 255x255 for 0-RTT resumption":
/// up to 255 cached sessions, each good for a 0-RTT attempt.
const SESSION_CACHE_CAPACITY: usize = 255;

struct TofuVerifier;

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// One long-lived stream per connection, QUIC providing framing and key
/// update at the transport level (spec §4.3). Idle timeout 60s, keep-alive
/// 20s, datagrams enabled.
pub struct QuicTransport {
    client_config: ClientConfig,
    server_config: Arc<ServerConfig>,
}

impl QuicTransport {
    pub fn new(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Self, LinkError> {
        let cert = Certificate(cert_der);
        let key = PrivateKey(key_der);

        let mut client_crypto = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(TofuVerifier))
            .with_no_client_auth();
        client_crypto.alpn_protocols = vec![ALPN.to_vec()];
        client_crypto.session_storage =
            rustls::client::ClientSessionMemoryCache::new(SESSION_CACHE_CAPACITY);
        client_crypto.enable_early_data = true;

        let mut client_config = ClientConfig::new(Arc::new(client_crypto));
        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            IdleTimeout::try_from(Duration::from_secs(60)).expect("60s fits in a VarInt"),
        ));
        transport.keep_alive_interval(Some(Duration::from_secs(20)));
        transport.datagram_receive_buffer_size(Some(64 * 1024));
        client_config.transport_config(Arc::new(transport.clone()));

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(|e| LinkError::Transport(format!("quic server config: {e}")))?;
        server_crypto.alpn_protocols = vec![ALPN.to_vec()];
        server_crypto.max_early_data_size = u32::MAX;

        let mut server_config = ServerConfig::with_crypto(Arc::new(server_crypto));
        server_config.transport_config(Arc::new(transport));

        Ok(QuicTransport {
            client_config,
            server_config: Arc::new(server_config),
        })
    }

    async fn connect_one(client_config: ClientConfig, endpoint_addr: String) -> Result<Conn, LinkError> {
        let addr: SocketAddr = endpoint_addr
            .parse()
            .map_err(|e| LinkError::InvalidUrl(format!("{endpoint_addr}: {e}")))?;
        let bind_addr: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let mut ep = Endpoint::client(bind_addr)
            .map_err(|e| LinkError::Transport(format!("quic bind: {e}")))?;
        ep.set_default_client_config(client_config);

        let connecting = ep
            .connect(addr, "meshnode-peer")
            .map_err(|e| LinkError::Transport(format!("quic connect {endpoint_addr}: {e}")))?;
        let connection = connecting
            .await
            .map_err(|e| LinkError::Transport(format!("quic handshake with {endpoint_addr}: {e}")))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| LinkError::Transport(format!("quic open_bi: {e}")))?;
        let local = connection.local_ip().map(|ip| ip.to_string()).unwrap_or_default();
        let remote = connection.remote_address().to_string();
        Ok(Conn::new(recv, send, local, remote))
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn scheme(&self) -> &'static str {
        "quic"
    }

    async fn dial(&self, url: &PeerUrl, _local_hint: Option<&str>) -> Result<Conn, LinkError> {
        debug!(target: LOG_TARGET, endpoints = ?url.endpoints, "dialing");
        let client_config = self.client_config.clone();
        dial_first_of(&url.endpoints, DIAL_STAGGER, move |ep| {
            Self::connect_one(client_config.clone(), ep)
        })
        .await
    }

    async fn listen(&self, url: &PeerUrl, _iface: Option<&str>) -> Result<Box<dyn Listener>, LinkError> {
        let addr: SocketAddr = url
            .endpoints
            .first()
            .ok_or_else(|| LinkError::InvalidUrl(url.canonical()))?
            .parse()
            .map_err(|e| LinkError::InvalidUrl(format!("{}: {e}", url.canonical())))?;
        let endpoint = Endpoint::server(self.server_config.as_ref().clone(), addr)
            .map_err(|e| LinkError::Transport(format!("quic listen {addr}: {e}")))?;
        Ok(Box::new(QuicListenerHandle { endpoint }))
    }
}

struct QuicListenerHandle {
    endpoint: Endpoint,
}

#[async_trait]
impl Listener for QuicListenerHandle {
    async fn accept(&mut self) -> Result<Conn, LinkError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| LinkError::Transport("quic endpoint closed".to_string()))?;
        let connection = incoming
            .await
            .map_err(|e| LinkError::Transport(format!("quic accept: {e}")))?;
        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| LinkError::Transport(format!("quic accept_bi: {e}")))?;
        let local = self.local_addr();
        let remote = connection.remote_address().to_string();
        Ok(Conn::new(recv, send, local, remote))
    }

    fn local_addr(&self) -> String {
        self.endpoint
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}
