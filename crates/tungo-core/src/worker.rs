//! The two forwarding loops of an established session.
//!
//! `tun_to_link` reads IP packets from the device, seals them, and ships
//! them; `link_to_tun` does the reverse. Each loop owns its half of the
//! session outright, so neither takes a lock on the fast path. The first
//! loop to hit a terminal condition wins: it cancels the shared token,
//! which unblocks its sibling, and `run_session` reports that first error
//! to the supervisor.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tundev::TunDevice;

use crate::framing::MAX_IP_PACKET;
use crate::link::{Inbound, Link, LinkError, LinkReader, LinkWriter};
use crate::session::{AeadSession, CryptoError, SessionReceiver, SessionSender};

/// Why a worker stopped. The supervisor maps these onto reconnect-or-exit.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("peer requested a session reset")]
    ResetRequested,
    #[error("transport closed by peer")]
    TransportClosed,
    #[error(transparent)]
    Crypto(CryptoError),
    #[error("transport: {0}")]
    Transport(LinkError),
    #[error("tun device closed")]
    TunClosed,
    #[error("tun read: {0}")]
    TunRead(io::Error),
    #[error("tun write: {0}")]
    TunWrite(io::Error),
    #[error("session cancelled")]
    Cancelled,
    #[error("worker task failed")]
    Join,
}

impl WorkerError {
    /// Whether the supervisor should rebuild the session and carry on.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, WorkerError::Cancelled)
    }
}

pub async fn tun_to_link(
    tun: Arc<dyn TunDevice>,
    mut sender: SessionSender,
    mut writer: LinkWriter,
    cancel: CancellationToken,
) -> WorkerError {
    let mut buf = vec![0u8; MAX_IP_PACKET];
    let mut packets: u64 = 0;
    let mut bytes: u64 = 0;
    let exit = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break WorkerError::Cancelled,
            read = tun.recv(&mut buf) => match read {
                Ok(0) => break WorkerError::TunClosed,
                Ok(n) => n,
                Err(e) => break WorkerError::TunRead(e),
            },
        };
        let (nonce, ciphertext) = match sender.seal(&buf[..n]) {
            Ok(sealed) => sealed,
            Err(e) => break WorkerError::Crypto(e),
        };
        if let Err(e) = writer.send(nonce, &ciphertext).await {
            break WorkerError::Transport(e);
        }
        packets += 1;
        bytes += n as u64;
    };
    info!(packets, bytes, "outbound worker stopped: {exit}");
    exit
}

pub async fn link_to_tun(
    tun: Arc<dyn TunDevice>,
    mut receiver: SessionReceiver,
    mut reader: LinkReader,
    cancel: CancellationToken,
) -> WorkerError {
    let mut packets: u64 = 0;
    let mut bytes: u64 = 0;
    let exit = loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break WorkerError::Cancelled,
            inbound = reader.recv() => match inbound {
                Ok(inbound) => inbound,
                Err(e) => break WorkerError::Transport(e),
            },
        };
        match inbound {
            Inbound::Closed => break WorkerError::TransportClosed,
            Inbound::Reset => break WorkerError::ResetRequested,
            Inbound::Packet { nonce, ciphertext } => {
                let opened = match nonce {
                    Some(nonce) => receiver.open(nonce, &ciphertext),
                    None => receiver.open_next(&ciphertext),
                };
                match opened {
                    Ok(plaintext) => {
                        if let Err(e) = tun.send(&plaintext).await {
                            break WorkerError::TunWrite(e);
                        }
                        packets += 1;
                        bytes += plaintext.len() as u64;
                    }
                    // Replayed or out-of-window datagrams are dropped
                    // without touching the session; the ordered stream
                    // never reaches this arm.
                    Err(CryptoError::ReplayRejected) if nonce.is_some() => {
                        debug!(
                            rejections = receiver.replay_rejections(),
                            "dropping replayed datagram"
                        );
                    }
                    Err(e) => break WorkerError::Crypto(e),
                }
            }
        }
    };
    info!(packets, bytes, "inbound worker stopped: {exit}");
    exit
}

/// Run both workers until one of them stops, then bring the other down
/// and surface the first error.
pub async fn run_session(
    tun: Arc<dyn TunDevice>,
    session: AeadSession,
    link: Link,
    cancel: CancellationToken,
) -> WorkerError {
    let id = session.short_id();
    let (sender, receiver) = session.split();
    let (reader, writer) = link.split();

    let mut outbound = tokio::spawn(tun_to_link(tun.clone(), sender, writer, cancel.clone()));
    let mut inbound = tokio::spawn(link_to_tun(tun, receiver, reader, cancel.clone()));

    let (first, second) = tokio::select! {
        out = &mut outbound => (out, &mut inbound),
        inb = &mut inbound => (inb, &mut outbound),
    };
    cancel.cancel();
    let _ = second.await;

    let exit = first.unwrap_or_else(|e| {
        warn!(session = %id, "worker task join failed: {e}");
        WorkerError::Join
    });
    info!(session = %id, "session ended: {exit}");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::DEFAULT_WINDOW;
    use crate::session::{SessionId, SessionKeys};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream, UdpSocket};
    use tundev::MemoryTun;

    fn session_pair() -> (AeadSession, AeadSession) {
        let id: SessionId = [9u8; 32];
        let c2s = [3u8; 32];
        let s2c = [4u8; 32];
        (
            AeadSession::new(id, SessionKeys { send: c2s, recv: s2c }, false, DEFAULT_WINDOW),
            AeadSession::new(id, SessionKeys { send: s2c, recv: c2s }, true, DEFAULT_WINDOW),
        )
    }

    async fn tcp_links() -> (Link, Link) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Link::Tcp(client), Link::Tcp(server))
    }

    async fn udp_links() -> (Link, Link) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (Link::Udp(Arc::new(a)), Link::Udp(Arc::new(b)))
    }

    /// Two full worker pairs wired back to back over a real transport:
    /// what goes into one side's device comes out of the other's.
    async fn forward_roundtrip(client_link: Link, server_link: Link) {
        let (client_session, server_session) = session_pair();
        let (client_user, client_dev) = MemoryTun::pair();
        let (server_user, server_dev) = MemoryTun::pair();
        let cancel = CancellationToken::new();

        let client = tokio::spawn(run_session(
            client_dev,
            client_session,
            client_link,
            cancel.child_token(),
        ));
        let server = tokio::spawn(run_session(
            server_dev,
            server_session,
            server_link,
            cancel.child_token(),
        ));

        let packet = b"\x45\x00\x00\x1c the payload".to_vec();
        client_user.send(&packet).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let n = tokio::time::timeout(Duration::from_millis(200), server_user.recv(&mut buf))
            .await
            .expect("packet crossed the tunnel")
            .unwrap();
        assert_eq!(&buf[..n], packet.as_slice());

        cancel.cancel();
        let _ = client.await;
        let _ = server.await;
    }

    #[tokio::test]
    async fn packets_cross_a_tcp_tunnel() {
        let (c, s) = tcp_links().await;
        forward_roundtrip(c, s).await;
    }

    #[tokio::test]
    async fn packets_cross_a_udp_tunnel() {
        let (c, s) = udp_links().await;
        forward_roundtrip(c, s).await;
    }

    #[tokio::test]
    async fn reset_byte_stops_the_session_with_reset_requested() {
        let (client_session, _server_session) = session_pair();
        let (c, s) = udp_links().await;
        let (_user, dev) = MemoryTun::pair();
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_session(dev, client_session, c, cancel));

        // The peer signals teardown out of band.
        if let Link::Udp(socket) = s {
            socket.send(&[crate::link::SESSION_RESET]).await.unwrap();
        }
        let exit = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, WorkerError::ResetRequested));
    }

    #[tokio::test]
    async fn peer_closing_tcp_stops_the_session() {
        let (client_session, _) = session_pair();
        let (c, s) = tcp_links().await;
        let (_user, dev) = MemoryTun::pair();

        let worker = tokio::spawn(run_session(dev, client_session, c, CancellationToken::new()));
        drop(s);
        let exit = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, WorkerError::TransportClosed));
    }

    #[tokio::test]
    async fn cancellation_unblocks_both_workers() {
        let (client_session, _) = session_pair();
        let (c, _s) = udp_links().await;
        let (_user, dev) = MemoryTun::pair();
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_session(dev, client_session, c, cancel.clone()));
        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, WorkerError::Cancelled));
    }

    #[tokio::test]
    async fn tun_eof_is_terminal() {
        let (client_session, _) = session_pair();
        let (c, _s) = udp_links().await;
        let (user, dev) = MemoryTun::pair();

        let worker = tokio::spawn(run_session(dev, client_session, c, CancellationToken::new()));
        user.close().await;
        drop(user);
        let exit = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, WorkerError::TunClosed));
    }
}
