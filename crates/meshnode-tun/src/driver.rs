//! The [`TunnelDriver`] collaborator (spec §6.3): a platform tunnel
//! interface, injected rather than implemented here — no corpus platform
//! driver was retrieved for this component, so only the trait and an
//! in-memory test double live in this crate.

use async_trait::async_trait;
use meshnode_address::Address;

#[derive(Debug, thiserror::Error)]
pub enum TunError {
    #[error("tunnel open failed: {0}")]
    Open(String),
    #[error("tunnel io error: {0}")]
    Io(String),
    #[error("tunnel closed")]
    Closed,
}

/// A platform tunnel interface. Implementations are platform-specific and
/// supplied by whatever wires this crate up (the `meshnode` binary); this
/// crate only depends on the trait.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Read one packet into `buf`, returning its length.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunError>;

    /// Write one packet.
    async fn write(&self, buf: &[u8]) -> Result<usize, TunError>;

    /// Configure the interface's `/128` address.
    async fn set_address(&self, address: Address) -> Result<(), TunError>;

    async fn close(&self);
}

/// Opens a [`TunnelDriver`] for a named interface at a given MTU. Kept as
/// a separate trait from `TunnelDriver` itself since "open" is a
/// constructor, not a method on an already-open handle (spec §6.3).
#[async_trait]
pub trait TunnelDriverFactory: Send + Sync {
    async fn open(&self, name: &str, mtu: usize) -> Result<std::sync::Arc<dyn TunnelDriver>, TunError>;
}

/// An in-memory loopback driver: whatever is written to it is immediately
/// available to read back. Used to exercise [`crate::TunBridge`]'s loops
/// without a real platform interface.
pub struct NullTunnelDriver {
    queue: parking_lot::Mutex<std::collections::VecDeque<Vec<u8>>>,
    notify: tokio::sync::Notify,
}

impl NullTunnelDriver {
    pub fn new() -> Self {
        NullTunnelDriver {
            queue: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Test helper: push a packet as if the platform interface had
    /// received it, for the bridge's inbound-to-tun direction.
    pub fn inject(&self, packet: Vec<u8>) {
        self.queue.lock().push_back(packet);
        self.notify.notify_one();
    }
}

impl Default for NullTunnelDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelDriver for NullTunnelDriver {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunError> {
        loop {
            if let Some(packet) = self.queue.lock().pop_front() {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                return Ok(n);
            }
            self.notify.notified().await;
        }
    }

    async fn write(&self, _buf: &[u8]) -> Result<usize, TunError> {
        Ok(_buf.len())
    }

    async fn set_address(&self, _address: Address) -> Result<(), TunError> {
        Ok(())
    }

    async fn close(&self) {}
}

pub struct NullTunnelDriverFactory;

#[async_trait]
impl TunnelDriverFactory for NullTunnelDriverFactory {
    async fn open(&self, _name: &str, _mtu: usize) -> Result<std::sync::Arc<dyn TunnelDriver>, TunError> {
        Ok(std::sync::Arc::new(NullTunnelDriver::new()))
    }
}
