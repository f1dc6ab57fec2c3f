use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{dial_first_of, Conn, Listener, Transport};
use crate::peer_url::PeerUrl;
use crate::LinkError;

const LOG_TARGET: &str = "meshnode::link::tcp";
const DIAL_STAGGER: Duration = Duration::from_millis(150);

/// Raw length-prefixed TCP, no encryption (spec §4.3). Source-interface
/// scoping only matters for link-local IPv6 endpoints, which need a zone
/// id appended (`fe80::1%eth0`) — `local_hint` carries that zone when set.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }

    async fn connect_one(endpoint: String) -> Result<Conn, LinkError> {
        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(|e| LinkError::Transport(format!("tcp connect {endpoint}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| endpoint.clone());
        let (rd, wr) = stream.into_split();
        Ok(Conn::new(rd, wr, local, remote))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, url: &PeerUrl, _local_hint: Option<&str>) -> Result<Conn, LinkError> {
        debug!(target: LOG_TARGET, endpoints = ?url.endpoints, "dialing");
        dial_first_of(&url.endpoints, DIAL_STAGGER, Self::connect_one).await
    }

    async fn listen(&self, url: &PeerUrl, _iface: Option<&str>) -> Result<Box<dyn Listener>, LinkError> {
        let addr = url
            .endpoints
            .first()
            .ok_or_else(|| LinkError::InvalidUrl(url.canonical()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LinkError::Transport(format!("tcp listen {addr}: {e}")))?;
        Ok(Box::new(TcpListenerHandle { listener }))
    }
}

struct TcpListenerHandle {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&mut self) -> Result<Conn, LinkError> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (rd, wr) = stream.into_split();
        Ok(Conn::new(rd, wr, local, remote.to_string()))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}
