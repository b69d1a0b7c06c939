//! Server side of the tunnel: listeners, the per-client session registry,
//! and the TUN-read dispatch that routes decrypted traffic back out to
//! whichever session owns the destination address.

pub mod registry;

mod egress;
mod tcp;
mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tundev::{Clock, TunDevice, TunManager};

use tungo_core::framing::MAX_IP_PACKET;
use tungo_core::ip;
use tungo_core::keys::{AllowList, Identity};
use tungo_core::ServerConfig;

use registry::SessionRegistry;

/// Plaintext packets buffered per session between dispatch and egress.
pub(crate) const EGRESS_QUEUE: usize = 512;

/// State every listener and session task shares.
pub(crate) struct Shared {
    pub identity: Arc<Identity>,
    pub allow: Arc<AllowList>,
    pub registry: Arc<SessionRegistry>,
    pub tun: Arc<dyn TunDevice>,
}

/// Listeners bound ahead of serving, so callers learn the actual
/// addresses before any client dials in.
pub struct BoundListeners {
    tcp: Option<TcpListener>,
    udp: Option<Arc<UdpSocket>>,
}

impl BoundListeners {
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }
}

pub struct Server {
    config: ServerConfig,
    identity: Arc<Identity>,
    allow: Arc<AllowList>,
    registry: Arc<SessionRegistry>,
    manager: Arc<dyn TunManager>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        manager: Arc<dyn TunManager>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Server> {
        let identity = Identity::from_base64(&config.ed25519_private).context("ed25519Private")?;
        if !config.ed25519_public.is_empty() && identity.public_base64() != config.ed25519_public {
            anyhow::bail!("ed25519Public does not match the configured private key");
        }
        let allow =
            AllowList::from_base64_list(&config.allowed_peers).context("allowedPeers")?;
        if allow.is_empty() {
            info!("allow-list empty: accepting any client that completes the handshake");
        }
        Ok(Server {
            config,
            identity: Arc::new(identity),
            allow: Arc::new(allow),
            registry: SessionRegistry::new(clock),
            manager,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Tear one client down and tell it so; it will re-handshake.
    pub fn evict(&self, ip: std::net::IpAddr) -> bool {
        match self.registry.release(ip) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Bind every enabled listener. Separate from `serve` so bind errors
    /// surface before the server is considered up.
    pub async fn bind(&self) -> anyhow::Result<BoundListeners> {
        let tcp = if self.config.enable_tcp {
            let endpoint = self.config.tcp_settings.endpoint();
            let listener = TcpListener::bind(&endpoint)
                .await
                .with_context(|| format!("binding tcp listener on {endpoint}"))?;
            info!(addr = %listener.local_addr()?, "tcp listener bound");
            Some(listener)
        } else {
            None
        };
        let udp = if self.config.enable_udp {
            let endpoint = self.config.udp_settings.endpoint();
            let socket = UdpSocket::bind(&endpoint)
                .await
                .with_context(|| format!("binding udp socket on {endpoint}"))?;
            info!(addr = %socket.local_addr()?, "udp socket bound");
            Some(Arc::new(socket))
        } else {
            None
        };
        Ok(BoundListeners { tcp, udp })
    }

    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners, cancel).await
    }

    /// Serve until cancelled.
    pub async fn serve(
        &self,
        listeners: BoundListeners,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.manager.dispose_devices().await;
        let tun = self
            .manager
            .create_device()
            .await
            .context("creating tun device")?;

        let shared = Arc::new(Shared {
            identity: self.identity.clone(),
            allow: self.allow.clone(),
            registry: self.registry.clone(),
            tun: tun.clone(),
        });

        let tasks = cancel.child_token();
        let mut handles = Vec::new();

        handles.push(tokio::spawn(dispatch(
            tun,
            self.registry.clone(),
            tasks.clone(),
        )));
        if let Some(listener) = listeners.tcp {
            handles.push(tokio::spawn(tcp::serve(
                listener,
                shared.clone(),
                self.config.tcp_settings.clone(),
                tasks.clone(),
            )));
        }
        if let Some(socket) = listeners.udp {
            handles.push(tokio::spawn(udp::serve(
                socket,
                shared.clone(),
                self.config.udp_settings.clone(),
                tasks.clone(),
            )));
        }

        cancel.cancelled().await;
        info!("server shutting down");
        tasks.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        self.manager.dispose_devices().await;
        Ok(())
    }
}

/// Read the shared device and route each packet to the session owning its
/// destination. Unroutable traffic is dropped quietly; so are packets for
/// sessions whose egress queue is full, which is the tunnel behaving like
/// the unreliable link it is.
async fn dispatch(
    tun: Arc<dyn TunDevice>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_IP_PACKET];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tun.recv(&mut buf) => match read {
                Ok(0) => {
                    warn!("tun device closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("tun read: {e}");
                    break;
                }
            },
        };
        let Some(dst) = ip::destination(&buf[..n]) else {
            debug!(len = n, "dropping packet with unreadable header");
            continue;
        };
        match registry.lookup(dst) {
            Some(entry) => {
                if entry.outbound.try_send(buf[..n].to_vec()).is_err() {
                    debug!(ip = %dst, "egress queue full, dropping packet");
                }
            }
            None => debug!(ip = %dst, "no session for destination"),
        }
    }
}
