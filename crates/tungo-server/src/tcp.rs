//! Stream listener: one task pair per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tundev::TunDevice;

use tungo_core::config::ConnectionSettings;
use tungo_core::handshake::{self, HandshakeError, ServerHandshake, SessionSecrets};
use tungo_core::link::{Inbound, LinkReader, LinkWriter};
use tungo_core::session::SessionReceiver;
use tungo_core::worker::WorkerError;

use crate::registry::{ClientEntry, Reservation};
use crate::{Shared, EGRESS_QUEUE};

pub(crate) async fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle(
                    stream,
                    peer,
                    shared.clone(),
                    settings.clone(),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                warn!("tcp accept: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) {
    let deadline = settings.handshake_deadline();
    let handshake = match timeout(deadline, server_handshake(&mut stream, &shared)).await {
        Err(_) => {
            debug!(%peer, "handshake deadline expired");
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer, "handshake failed: {e}");
            return;
        }
        Ok(Ok(result)) => result,
    };
    let (secrets, reservation) = handshake;

    let session = secrets.into_session(true, settings.replay_window);
    let short = session.short_id();
    let (sender, receiver) = session.split();
    let (read_half, write_half) = stream.into_split();

    let (outbound_tx, outbound_rx) = mpsc::channel(EGRESS_QUEUE);
    let session_cancel = cancel.child_token();
    let tunnel_ip = reservation.ip();
    let entry = reservation.into_active(
        *receiver.session_id(),
        outbound_tx,
        None,
        session_cancel.clone(),
    );
    info!(session = %short, %peer, ip = %tunnel_ip, "tcp client registered");

    let egress = tokio::spawn(crate::egress::run(
        outbound_rx,
        sender,
        LinkWriter::Tcp(write_half),
        session_cancel.clone(),
    ));

    let exit = ingress(read_half, receiver, shared.tun.clone(), &entry, &session_cancel).await;

    session_cancel.cancel();
    let _ = egress.await;
    shared.registry.release_entry(&entry);
    info!(session = %short, %peer, ip = %tunnel_ip, "tcp client gone: {exit}");
}

async fn server_handshake(
    stream: &mut TcpStream,
    shared: &Arc<Shared>,
) -> Result<(SessionSecrets, Reservation), HandshakeError> {
    let hello = handshake::read_client_hello(stream).await?;
    let mut hs = ServerHandshake::new(shared.identity.clone(), shared.allow.clone());
    let reply = hs.receive_client_hello(&hello)?;

    // Claim the address before committing to a reply; a loser of this
    // race never gets a ServerHello.
    let reservation = shared
        .registry
        .reserve(hello.tunnel_ip)
        .map_err(|_| HandshakeError::IpCollision(hello.tunnel_ip))?;

    handshake::write_message(stream, &reply.to_bytes()).await?;
    let signature = handshake::read_client_signature(stream).await?;
    let secrets = hs.receive_client_signature(&signature)?;
    Ok((secrets, reservation))
}

async fn ingress(
    read_half: OwnedReadHalf,
    mut receiver: SessionReceiver,
    tun: Arc<dyn TunDevice>,
    entry: &Arc<ClientEntry>,
    cancel: &CancellationToken,
) -> WorkerError {
    let mut reader = LinkReader::Tcp(read_half);
    loop {
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
            Inbound::Packet { ciphertext, .. } => {
                // The stream is ordered; anything that fails to open is a
                // protocol violation and the connection dies with it.
                match receiver.open_next(&ciphertext) {
                    Ok(plaintext) => {
                        entry.touch();
                        if let Err(e) = tun.send(&plaintext).await {
                            break WorkerError::TunWrite(e);
                        }
                    }
                    Err(e) => break WorkerError::Crypto(e),
                }
            }
        }
    }
}
