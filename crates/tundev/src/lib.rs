//! Contracts the tunnel core consumes from the host platform: the TUN
//! device itself, the manager that owns device lifecycle, and an
//! injectable clock.
//!
//! Route and firewall mutation stays with the platform tooling; the traits
//! here only move IP packets and create/dispose devices.

pub mod memory;
#[cfg(unix)]
pub mod os;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

pub use memory::{MemoryTun, MemoryTunManager};

/// Virtual network device delivering whole IP packets to and from userspace.
///
/// `recv` returning `Ok(0)` means the device is gone (link down) and is
/// terminal for the session using it.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one IP packet into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one IP packet.
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// Release the device. Pending and future reads return `Ok(0)`.
    async fn close(&self);
}

/// Device lifecycle, owned by the session supervisor.
#[async_trait]
pub trait TunManager: Send + Sync {
    async fn create_device(&self) -> io::Result<Arc<dyn TunDevice>>;

    /// Tear down every device this manager created. Idempotent: safe to
    /// call on startup leftovers, between reconnects, and twice in a row.
    async fn dispose_devices(&self);

    /// Record the transport endpoint so platforms that pin a split default
    /// route know where the tunnel itself must keep flowing.
    async fn set_route_endpoint(&self, addr: SocketAddr);
}

/// Injectable time source, used for session activity tracking.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock backed [`Clock`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
