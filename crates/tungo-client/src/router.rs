//! The client supervisor.
//!
//! One loop, four phases: create the device, establish a session, run the
//! forwarding workers, tear everything down. Sessions are disposable;
//! every exit from the running phase disposes the device and loops back to
//! establishment unless the supervisor itself was cancelled. Device
//! disposal is idempotent and also runs on entry, so leftovers from a
//! crashed predecessor never survive.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tundev::TunManager;

use tungo_core::factory::{connect, ConnectError};
use tungo_core::handshake::HandshakeError;
use tungo_core::keys::{Identity, TrustAnchor};
use tungo_core::worker::{run_session, WorkerError};
use tungo_core::ClientConfig;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

pub struct ClientRouter {
    config: ClientConfig,
    manager: Arc<dyn TunManager>,
    /// Long-term client key, provisioned out of band. Required only when
    /// the server enforces an allow-list.
    identity: Option<Identity>,
}

impl ClientRouter {
    pub fn new(
        config: ClientConfig,
        manager: Arc<dyn TunManager>,
        identity: Option<Identity>,
    ) -> Self {
        ClientRouter {
            config,
            manager,
            identity,
        }
    }

    /// Drive the tunnel until `cancel` fires or a non-retryable error
    /// surfaces.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let transport = self.config.protocol;
        let settings = self.config.active().clone();
        let anchor = TrustAnchor::from_base64(&self.config.ed25519_server_public)
            .context("ed25519ServerPublic")?;
        info!(%transport, endpoint = %settings.endpoint(), server = %anchor.fingerprint(), "client starting");

        self.manager.dispose_devices().await;

        while !cancel.is_cancelled() {
            let tun = match self.manager.create_device().await {
                Ok(tun) => tun,
                Err(e) => {
                    warn!("creating tun device: {e}");
                    if !self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let established = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect(transport, &settings, anchor.clone(), self.identity.clone()) => result,
            };
            let established = match established {
                Ok(established) => established,
                Err(ConnectError::Handshake(HandshakeError::PeerNotAllowed)) => {
                    error!("server refused this client's identity; giving up");
                    self.manager.dispose_devices().await;
                    anyhow::bail!("peer not allowed");
                }
                Err(e) => {
                    warn!("establishing session: {e}");
                    self.manager.dispose_devices().await;
                    if !self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if let Ok(peer) = established.link.peer_addr() {
                self.manager.set_route_endpoint(peer).await;
            }

            let exit = run_session(
                tun,
                established.session,
                established.link,
                cancel.child_token(),
            )
            .await;
            self.manager.dispose_devices().await;

            match exit {
                WorkerError::Cancelled => break,
                exit if exit.is_recoverable() => {
                    info!("session ended ({exit}); reconnecting");
                }
                exit => {
                    error!("session ended ({exit})");
                    anyhow::bail!("session failed: {exit}");
                }
            }
        }

        self.manager.dispose_devices().await;
        info!("client stopped");
        Ok(())
    }

    /// Back off between attempts. Returns false when cancelled mid-sleep.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(RECONNECT_DELAY) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tundev::{MemoryTun, MemoryTunManager};
    use tungo_core::config::{ConnectionSettings, Transport};
    use tungo_core::handshake::{
        self, ServerHandshake,
    };
    use tungo_core::keys::AllowList;

    fn client_config(port: u16) -> ClientConfig {
        let settings = ConnectionSettings {
            connection_ip: "127.0.0.1".into(),
            port,
            interface_name: "tungo0".into(),
            interface_address: "10.0.0.2".into(),
            interface_ip_cidr: 24,
            interface_address_v6: None,
            interface_v6_cidr: None,
            mtu: 1420,
            dial_timeout_ms: 5000,
            replay_window: 1024,
        };
        ClientConfig {
            protocol: Transport::Tcp,
            tcp_settings: settings.clone(),
            udp_settings: settings,
            ed25519_server_public: Identity::generate().public_base64(),
        }
    }

    #[tokio::test]
    async fn refused_dials_retry_until_cancelled() {
        let manager = MemoryTunManager::new();
        for _ in 0..8 {
            let (_user, dev) = MemoryTun::pair();
            manager.push_device(dev);
        }
        let router = ClientRouter::new(client_config(1), manager.clone(), None);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            canceller.cancel();
        });
        router.run(cancel).await.unwrap();

        // Entry cleanup, one per failed attempt, final cleanup.
        assert!(manager.dispose_calls() >= 3);
    }

    #[tokio::test]
    async fn dropped_sessions_are_rebuilt() {
        let server_identity = Arc::new(Identity::generate());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handshakes = Arc::new(AtomicUsize::new(0));

        // A server that completes every handshake and immediately hangs
        // up, forcing the client back into establishment each time.
        let counted = handshakes.clone();
        let identity = server_identity.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut hs = ServerHandshake::new(identity.clone(), Arc::new(AllowList::default()));
                let hello = handshake::read_client_hello(&mut stream).await.unwrap();
                let reply = hs.receive_client_hello(&hello).unwrap();
                handshake::write_message(&mut stream, &reply.to_bytes())
                    .await
                    .unwrap();
                let sig = handshake::read_client_signature(&mut stream).await.unwrap();
                hs.receive_client_signature(&sig).unwrap();
                counted.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let mut config = client_config(port);
        config.ed25519_server_public = server_identity.public_base64();

        let manager = MemoryTunManager::new();
        for _ in 0..8 {
            let (_user, dev) = MemoryTun::pair();
            manager.push_device(dev);
        }

        let router = ClientRouter::new(config, manager.clone(), None);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let watched = handshakes.clone();
        tokio::spawn(async move {
            // Let at least two sessions come and go.
            for _ in 0..200 {
                if watched.load(Ordering::SeqCst) >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            canceller.cancel();
        });

        router.run(cancel).await.unwrap();
        assert!(handshakes.load(Ordering::SeqCst) >= 2);
    }
}
