use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::{dial_first_of, Conn, Listener, Transport};
use crate::peer_url::PeerUrl;
use crate::LinkError;

const LOG_TARGET: &str = "meshnode::link::mpath";
const DIAL_STAGGER: Duration = Duration::from_millis(150);

#[cfg(target_os = "linux")]
const IPPROTO_TCP: libc::c_int = libc::IPPROTO_TCP;
#[cfg(target_os = "linux")]
const TCP_MULTIPATH: libc::c_int = 0x2e; // MPTCP_ENABLED isn't exposed by libc; matches the kernel's /proc/sys/net/mptcp sockopt number on recent LTS kernels.

/// TCP with multipath negotiated via a best-effort `setsockopt`; falls back
/// to plain TCP if the kernel refuses (spec §4.3). Framing is identical to
/// the `tcp` adapter.
pub struct MpathTransport;

impl MpathTransport {
    pub fn new() -> Self {
        MpathTransport
    }

    #[cfg(target_os = "linux")]
    fn try_enable_multipath(stream: &TcpStream) {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let enable: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                IPPROTO_TCP,
                TCP_MULTIPATH,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(target: LOG_TARGET, "kernel refused multipath TCP, continuing as plain TCP");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn try_enable_multipath(_stream: &TcpStream) {
        warn!(target: LOG_TARGET, "multipath TCP is only implemented on linux, falling back to plain TCP");
    }

    async fn connect_one(endpoint: String) -> Result<Conn, LinkError> {
        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(|e| LinkError::Transport(format!("mpath connect {endpoint}: {e}")))?;
        Self::try_enable_multipath(&stream);
        stream.set_nodelay(true).ok();
        let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| endpoint.clone());
        let (rd, wr) = stream.into_split();
        Ok(Conn::new(rd, wr, local, remote))
    }
}

impl Default for MpathTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MpathTransport {
    fn scheme(&self) -> &'static str {
        "mpath"
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
            .map_err(|e| LinkError::Transport(format!("mpath listen {addr}: {e}")))?;
        Ok(Box::new(MpathListenerHandle { listener }))
    }
}

struct MpathListenerHandle {
    listener: TcpListener,
}

#[async_trait]
impl Listener for MpathListenerHandle {
    async fn accept(&mut self) -> Result<Conn, LinkError> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        MpathTransport::try_enable_multipath(&stream);
        stream.set_nodelay(true).ok();
        let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
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
