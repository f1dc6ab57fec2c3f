use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, ServerConfig, ServerName};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use super::{dial_first_of, Conn, Listener, Transport};
use crate::peer_url::PeerUrl;
use crate::LinkError;

const LOG_TARGET: &str = "meshnode::link::tls";
const DIAL_STAGGER: Duration = Duration::from_millis(150);

/// Accepts any self-signed peer certificate. Transport-level trust here is
/// trust-on-first-use by design (spec §4.3): the certificate only carries
/// the encryption session, and the party's actual identity is the public
/// key asserted in the app-layer handshake frame, checked separately
/// against `AllowedPublicKeys`.
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

/// Length-prefixed framing inside TLS, using the node's self-signed cert
/// (spec §4.3). The cert's common name is the hex-encoded signing public
/// key, generated once at startup from the node identity.
pub struct TlsTransport {
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
}

impl TlsTransport {
    pub fn new(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Self, LinkError> {
        let cert = Certificate(cert_der);
        let key = PrivateKey(key_der);

        let client_config = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(TofuVerifier))
            .with_no_client_auth();

        let server_config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(|e| LinkError::Transport(format!("tls server config: {e}")))?;

        Ok(TlsTransport {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }

    async fn connect_one(connector: TlsConnector, endpoint: String) -> Result<Conn, LinkError> {
        let tcp = TcpStream::connect(&endpoint)
            .await
            .map_err(|e| LinkError::Transport(format!("tcp connect {endpoint}: {e}")))?;
        tcp.set_nodelay(true).ok();
        let local = tcp.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let remote = tcp
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| endpoint.clone());

        // The server name isn't actually verified (TofuVerifier accepts
        // everything); it just has to parse as a valid SNI value.
        let server_name = ServerName::try_from("meshnode-peer")
            .expect("\"meshnode-peer\" is a valid DNS name literal");
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| LinkError::Transport(format!("tls handshake with {endpoint}: {e}")))?;
        let (rd, wr) = tokio::io::split(tls_stream);
        Ok(Conn::new(rd, wr, local, remote))
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn scheme(&self) -> &'static str {
        "tls"
    }

    async fn dial(&self, url: &PeerUrl, _local_hint: Option<&str>) -> Result<Conn, LinkError> {
        debug!(target: LOG_TARGET, endpoints = ?url.endpoints, "dialing");
        let connector = TlsConnector::from(self.client_config.clone());
        dial_first_of(&url.endpoints, DIAL_STAGGER, move |ep| {
            Self::connect_one(connector.clone(), ep)
        })
        .await
    }

    async fn listen(&self, url: &PeerUrl, _iface: Option<&str>) -> Result<Box<dyn Listener>, LinkError> {
        let addr = url
            .endpoints
            .first()
            .ok_or_else(|| LinkError::InvalidUrl(url.canonical()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LinkError::Transport(format!("tls listen {addr}: {e}")))?;
        Ok(Box::new(TlsListenerHandle {
            listener,
            acceptor: TlsAcceptor::from(self.server_config.clone()),
        }))
    }
}

struct TlsListenerHandle {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl Listener for TlsListenerHandle {
    async fn accept(&mut self) -> Result<Conn, LinkError> {
        let (tcp, remote) = self
            .listener
            .accept()
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        tcp.set_nodelay(true).ok();
        let local = tcp.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let tls_stream = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| LinkError::Transport(format!("tls accept from {remote}: {e}")))?;
        let (rd, wr) = tokio::io::split(tls_stream);
        Ok(Conn::new(rd, wr, local, remote.to_string()))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}
