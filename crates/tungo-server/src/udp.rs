//! Datagram listener.
//!
//! One socket serves every peer, so a demux task owns the address map and
//! routes each datagram to its session task's queue. A peer's first
//! datagram is its ClientHello: the session task runs the handshake off
//! the same queue, which makes registration single-flight per address:
//! datagrams racing in behind the hello simply wait in line.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tungo_core::config::ConnectionSettings;
use tungo_core::framing::MAX_IP_PACKET;
use tungo_core::handshake::{
    ClientHello, ClientSignature, HandshakeError, ServerHandshake, SessionSecrets, SIG_LEN,
};
use tungo_core::link::{LinkWriter, SESSION_RESET};
use tungo_core::nonce::{Nonce, NONCE_LEN};
use tungo_core::session::{CryptoError, TAG_LEN};
use tungo_core::worker::WorkerError;

use crate::registry::Reservation;
use crate::{Shared, EGRESS_QUEUE};

/// Queue depth per peer; covers handshake races and bursty inbound.
const PEER_QUEUE: usize = 512;
const MAX_DATAGRAM: usize = NONCE_LEN + MAX_IP_PACKET + TAG_LEN;
const MIN_DATA_DATAGRAM: usize = NONCE_LEN + TAG_LEN;

pub(crate) async fn serve(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) {
    let (gone_tx, mut gone_rx) = mpsc::channel::<SocketAddr>(64);
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            gone = gone_rx.recv() => {
                if let Some(addr) = gone {
                    peers.remove(&addr);
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, addr) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("udp recv: {e}");
                        continue;
                    }
                };
                if let Some(queue) = peers.get(&addr) {
                    if queue.try_send(buf[..n].to_vec()).is_err() {
                        if queue.is_closed() {
                            peers.remove(&addr);
                        } else {
                            debug!(%addr, "peer queue full, dropping datagram");
                        }
                    }
                } else {
                    let (queue_tx, queue_rx) = mpsc::channel(PEER_QUEUE);
                    let _ = queue_tx.try_send(buf[..n].to_vec());
                    peers.insert(addr, queue_tx);
                    tokio::spawn(handle_peer(
                        addr,
                        queue_rx,
                        socket.clone(),
                        shared.clone(),
                        settings.clone(),
                        cancel.child_token(),
                        gone_tx.clone(),
                    ));
                }
            }
        }
    }
}

async fn handle_peer(
    addr: SocketAddr,
    mut datagrams: mpsc::Receiver<Vec<u8>>,
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
    gone: mpsc::Sender<SocketAddr>,
) {
    let deadline = settings.handshake_deadline();
    let handshake = match timeout(
        deadline,
        server_handshake(&mut datagrams, &socket, addr, &shared),
    )
    .await
    {
        Err(_) => {
            debug!(%addr, "handshake deadline expired");
            let _ = gone.send(addr).await;
            return;
        }
        Ok(Err(e)) => {
            debug!(%addr, "handshake failed: {e}");
            let _ = gone.send(addr).await;
            return;
        }
        Ok(Ok(result)) => result,
    };
    let (secrets, reservation) = handshake;

    let session = secrets.into_session(true, settings.replay_window);
    let short = session.short_id();
    let (sender, mut receiver) = session.split();

    let (outbound_tx, outbound_rx) = mpsc::channel(EGRESS_QUEUE);
    let session_cancel = cancel.child_token();
    let tunnel_ip = reservation.ip();
    let entry = reservation.into_active(
        *receiver.session_id(),
        outbound_tx,
        Some(addr),
        session_cancel.clone(),
    );
    info!(session = %short, %addr, ip = %tunnel_ip, "udp client registered");

    let egress = tokio::spawn(crate::egress::run(
        outbound_rx,
        sender,
        LinkWriter::UdpTo(socket.clone(), addr),
        session_cancel.clone(),
    ));

    let exit = loop {
        let datagram = tokio::select! {
            _ = session_cancel.cancelled() => break WorkerError::Cancelled,
            datagram = datagrams.recv() => match datagram {
                Some(datagram) => datagram,
                None => break WorkerError::TransportClosed,
            },
        };
        if datagram.len() == 1 && datagram[0] == SESSION_RESET {
            break WorkerError::ResetRequested;
        }
        if datagram.len() < MIN_DATA_DATAGRAM {
            debug!(%addr, len = datagram.len(), "dropping runt datagram");
            continue;
        }
        let nonce_bytes: [u8; NONCE_LEN] = datagram[..NONCE_LEN].try_into().unwrap();
        let nonce = Nonce::from_bytes(&nonce_bytes);
        match receiver.open(nonce, &datagram[NONCE_LEN..]) {
            Ok(plaintext) => {
                entry.touch();
                if let Err(e) = shared.tun.send(&plaintext).await {
                    break WorkerError::TunWrite(e);
                }
            }
            Err(CryptoError::ReplayRejected) => {
                debug!(
                    session = %short,
                    rejections = receiver.replay_rejections(),
                    "dropping replayed datagram"
                );
            }
            Err(e) => break WorkerError::Crypto(e),
        }
    };

    session_cancel.cancel();
    let _ = egress.await;
    shared.registry.release_entry(&entry);

    // Unless the client initiated the teardown, tell it the session is
    // gone so it re-handshakes instead of shouting into the void.
    if !matches!(exit, WorkerError::ResetRequested) {
        let _ = socket.send_to(&[SESSION_RESET], addr).await;
    }

    let _ = gone.send(addr).await;
    info!(session = %short, %addr, ip = %tunnel_ip, "udp client gone: {exit}");
}

async fn server_handshake(
    datagrams: &mut mpsc::Receiver<Vec<u8>>,
    socket: &UdpSocket,
    addr: SocketAddr,
    shared: &Arc<Shared>,
) -> Result<(SessionSecrets, Reservation), HandshakeError> {
    let first = datagrams
        .recv()
        .await
        .ok_or(HandshakeError::Protocol("client hello"))?;
    let hello = ClientHello::parse(&first)?;

    let mut hs = ServerHandshake::new(shared.identity.clone(), shared.allow.clone());
    let reply = hs.receive_client_hello(&hello)?;

    let reservation = shared
        .registry
        .reserve(hello.tunnel_ip)
        .map_err(|_| HandshakeError::IpCollision(hello.tunnel_ip))?;

    socket.send_to(&reply.to_bytes(), addr).await?;

    let signature = loop {
        let datagram = datagrams
            .recv()
            .await
            .ok_or(HandshakeError::Protocol("client signature"))?;
        if datagram.len() == SIG_LEN {
            break ClientSignature::parse(&datagram)?;
        }
        debug!(%addr, len = datagram.len(), "ignoring datagram during handshake");
    };

    let secrets = hs.receive_client_signature(&signature)?;
    Ok((secrets, reservation))
}
