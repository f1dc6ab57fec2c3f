//! Per-scheme dial/listen adapters (spec §4.3). Every adapter produces the
//! same [`Conn`] shape once connected, so the link manager's dial loop and
//! handshake logic are transport-agnostic.

mod mpath;
mod quic;
mod tcp;
mod tls;
mod unix;

pub use mpath::MpathTransport;
pub use quic::QuicTransport;
pub use tcp::TcpTransport;
pub use tls::TlsTransport;
pub use unix::UnixTransport;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::peer_url::PeerUrl;
use crate::LinkError;

/// A connected, not-yet-handshaked transport stream. Framing (length
/// prefix) is shared across every stream-based adapter via
/// [`crate::framing`]; QUIC keeps the same wire shape on its one
/// long-lived stream.
pub struct Conn {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    pub local_addr: String,
    pub remote_addr: String,
}

impl Conn {
    pub fn new(
        reader: impl AsyncRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
        local_addr: String,
        remote_addr: String,
    ) -> Self {
        Conn {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_addr,
            remote_addr,
        }
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        crate::framing::write_frame(&mut self.writer, payload).await
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>, LinkError> {
        crate::framing::read_frame(&mut self.reader).await
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&mut self) -> Result<Conn, LinkError>;
    fn local_addr(&self) -> String;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn scheme(&self) -> &'static str;
    async fn dial(&self, url: &PeerUrl, local_hint: Option<&str>) -> Result<Conn, LinkError>;
    async fn listen(&self, url: &PeerUrl, iface: Option<&str>) -> Result<Box<dyn Listener>, LinkError>;
}

/// Resolve the `host:port` endpoints of a (possibly multipath) peer URL in
/// parallel, keeping the first that completes, per spec §4.3's "staggered
/// start, keep the first" rule.
pub(crate) async fn dial_first_of<F, Fut>(endpoints: &[String], stagger: std::time::Duration, dial_one: F) -> Result<Conn, LinkError>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Conn, LinkError>> + Send,
{
    use futures::future::FutureExt;

    if endpoints.len() == 1 {
        return dial_one(endpoints[0].clone()).await;
    }

    let mut attempts = Vec::with_capacity(endpoints.len());
    for (i, ep) in endpoints.iter().enumerate() {
        let ep = ep.clone();
        let delay = stagger * i as u32;
        let fut = dial_one(ep.clone());
        attempts.push(
            async move {
                tokio::time::sleep(delay).await;
                fut.await
            }
            .boxed(),
        );
    }

    let (first_result, _index, rest) = futures::future::select_all(attempts).await;
    for remaining in rest {
        drop(remaining);
    }
    first_result
}
