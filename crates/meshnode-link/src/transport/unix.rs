use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::{Conn, Listener, Transport};
use crate::peer_url::PeerUrl;
use crate::LinkError;

const LOG_TARGET: &str = "meshnode::link::unix";

/// Local stream socket, length-prefixed packets, used for local admin /
/// sidecar connections (spec §4.3). The "endpoint" is a filesystem path,
/// not a `host:port`, so multipath endpoint lists don't apply here.
pub struct UnixTransport;

impl UnixTransport {
    pub fn new() -> Self {
        UnixTransport
    }
}

impl Default for UnixTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn scheme(&self) -> &'static str {
        "unix"
    }

    async fn dial(&self, url: &PeerUrl, _local_hint: Option<&str>) -> Result<Conn, LinkError> {
        let path = url
            .endpoints
            .first()
            .ok_or_else(|| LinkError::InvalidUrl(url.canonical()))?;
        debug!(target: LOG_TARGET, %path, "dialing");
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| LinkError::Transport(format!("unix connect {path}: {e}")))?;
        let (rd, wr) = stream.into_split();
        Ok(Conn::new(rd, wr, path.clone(), path.clone()))
    }

    async fn listen(&self, url: &PeerUrl, _iface: Option<&str>) -> Result<Box<dyn Listener>, LinkError> {
        let path = url
            .endpoints
            .first()
            .ok_or_else(|| LinkError::InvalidUrl(url.canonical()))?;
        // Remove a stale socket file left behind by a previous run; a live
        // listener already bound to it would fail the subsequent bind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| LinkError::Transport(format!("unix listen {path}: {e}")))?;
        Ok(Box::new(UnixListenerHandle {
            listener,
            path: path.clone(),
        }))
    }
}

struct UnixListenerHandle {
    listener: UnixListener,
    path: String,
}

#[async_trait]
impl Listener for UnixListenerHandle {
    async fn accept(&mut self) -> Result<Conn, LinkError> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        let (rd, wr) = stream.into_split();
        Ok(Conn::new(rd, wr, self.path.clone(), self.path.clone()))
    }

    fn local_addr(&self) -> String {
        self.path.clone()
    }
}
