//! A unified view over the two transports a session can ride.
//!
//! The stream transport carries length-prefixed frames and no explicit
//! nonces; ordering is the stream's. The datagram transport carries one
//! message per datagram as `nonce(12) || ciphertext`, and reserves the
//! single byte `0x01` as an out-of-band session-reset signal. The
//! encryptor can never produce a one-byte message, its output is at least
//! a full tag.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::framing::{self, FrameError, LEN_PREFIX, MAX_IP_PACKET};
use crate::nonce::{Nonce, NONCE_LEN};
use crate::session::TAG_LEN;

pub const SESSION_RESET: u8 = 0x01;
/// Outbound writes are bounded so a wedged peer cannot hold a worker
/// hostage past cancellation.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_DATAGRAM: usize = NONCE_LEN + MAX_IP_PACKET + TAG_LEN;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("transport write timed out")]
    WriteTimeout,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

/// One established transport, either kind.
pub enum Link {
    Tcp(TcpStream),
    Udp(Arc<UdpSocket>),
}

impl Link {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Link::Tcp(stream) => stream.peer_addr(),
            Link::Udp(socket) => socket.peer_addr(),
        }
    }

    /// Split into halves each worker can own exclusively.
    pub fn split(self) -> (LinkReader, LinkWriter) {
        match self {
            Link::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (LinkReader::Tcp(read), LinkWriter::Tcp(write))
            }
            Link::Udp(socket) => (
                LinkReader::Udp(socket.clone()),
                LinkWriter::Udp(socket),
            ),
        }
    }
}

/// What the read side of a link produces.
#[derive(Debug)]
pub enum Inbound {
    Packet {
        /// Present on datagram transports, absent on the ordered stream.
        nonce: Option<Nonce>,
        ciphertext: Vec<u8>,
    },
    /// The peer asked for a session teardown.
    Reset,
    /// The transport closed cleanly.
    Closed,
}

pub enum LinkReader {
    Tcp(OwnedReadHalf),
    Udp(Arc<UdpSocket>),
}

impl LinkReader {
    pub async fn recv(&mut self) -> Result<Inbound, LinkError> {
        match self {
            LinkReader::Tcp(read) => match framing::read_frame(read).await? {
                Some(ciphertext) => Ok(Inbound::Packet {
                    nonce: None,
                    ciphertext,
                }),
                None => Ok(Inbound::Closed),
            },
            LinkReader::Udp(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    let n = socket.recv(&mut buf).await?;
                    if n == 1 && buf[0] == SESSION_RESET {
                        return Ok(Inbound::Reset);
                    }
                    if n < NONCE_LEN + TAG_LEN {
                        debug!(len = n, "dropping runt datagram");
                        continue;
                    }
                    let nonce_bytes: [u8; NONCE_LEN] = buf[..NONCE_LEN].try_into().unwrap();
                    return Ok(Inbound::Packet {
                        nonce: Some(Nonce::from_bytes(&nonce_bytes)),
                        ciphertext: buf[NONCE_LEN..n].to_vec(),
                    });
                }
            }
        }
    }
}

pub enum LinkWriter {
    Tcp(OwnedWriteHalf),
    /// Connected socket (client side).
    Udp(Arc<UdpSocket>),
    /// Shared listener socket plus the peer to address (server side).
    UdpTo(Arc<UdpSocket>, SocketAddr),
}

impl LinkWriter {
    /// Ship one sealed message. The nonce only reaches the wire on
    /// datagram transports.
    pub async fn send(&mut self, nonce: Nonce, ciphertext: &[u8]) -> Result<(), LinkError> {
        match self {
            LinkWriter::Tcp(write) => {
                let mut frame = Vec::with_capacity(LEN_PREFIX + ciphertext.len());
                frame.extend_from_slice(&[0u8; LEN_PREFIX]);
                frame.extend_from_slice(ciphertext);
                framing::encode_length(&mut frame)?;
                bounded(write.write_all(&frame)).await??;
                Ok(())
            }
            LinkWriter::Udp(socket) => {
                let datagram = datagram(nonce, ciphertext);
                bounded(socket.send(&datagram)).await??;
                Ok(())
            }
            LinkWriter::UdpTo(socket, peer) => {
                let datagram = datagram(nonce, ciphertext);
                bounded(socket.send_to(&datagram, *peer)).await??;
                Ok(())
            }
        }
    }

    /// Tell the peer to tear the session down: a reset byte on datagram
    /// transports, a shutdown on the stream.
    pub async fn send_reset(&mut self) -> Result<(), LinkError> {
        match self {
            LinkWriter::Tcp(write) => {
                bounded(write.shutdown()).await??;
                Ok(())
            }
            LinkWriter::Udp(socket) => {
                bounded(socket.send(&[SESSION_RESET])).await??;
                Ok(())
            }
            LinkWriter::UdpTo(socket, peer) => {
                bounded(socket.send_to(&[SESSION_RESET], *peer)).await??;
                Ok(())
            }
        }
    }
}

fn datagram(nonce: Nonce, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce.to_bytes());
    out.extend_from_slice(ciphertext);
    out
}

async fn bounded<F, T>(fut: F) -> Result<T, LinkError>
where
    F: std::future::Future<Output = T>,
{
    timeout(WRITE_TIMEOUT, fut)
        .await
        .map_err(|_| LinkError::WriteTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn udp_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test]
    async fn udp_datagrams_carry_their_nonce() {
        let (a, b) = udp_pair().await;
        let (_, mut writer) = Link::Udp(a).split();
        let (mut reader, _) = Link::Udp(b).split();

        let nonce = Nonce::ZERO;
        writer.send(nonce, &[0xaa; 32]).await.unwrap();
        match reader.recv().await.unwrap() {
            Inbound::Packet {
                nonce: Some(n),
                ciphertext,
            } => {
                assert_eq!(n, nonce);
                assert_eq!(ciphertext, vec![0xaa; 32]);
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn udp_reset_byte_surfaces_as_reset() {
        let (a, b) = udp_pair().await;
        a.send(&[SESSION_RESET]).await.unwrap();
        let (mut reader, _) = Link::Udp(b).split();
        assert!(matches!(reader.recv().await.unwrap(), Inbound::Reset));
    }

    #[tokio::test]
    async fn udp_runts_are_skipped() {
        let (a, b) = udp_pair().await;
        a.send(&[0xff; 8]).await.unwrap(); // below nonce+tag, not a reset
        let (_, mut writer) = Link::Udp(a).split();
        writer.send(Nonce::ZERO, &[0xbb; 16]).await.unwrap();

        let (mut reader, _) = Link::Udp(b).split();
        match reader.recv().await.unwrap() {
            Inbound::Packet { ciphertext, .. } => assert_eq!(ciphertext, vec![0xbb; 16]),
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tcp_frames_roundtrip_and_close_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (_, mut writer) = Link::Tcp(client).split();
        let (mut reader, _) = Link::Tcp(server).split();

        writer.send(Nonce::ZERO, &[0xcc; 48]).await.unwrap();
        match reader.recv().await.unwrap() {
            Inbound::Packet { nonce: None, ciphertext } => {
                assert_eq!(ciphertext, vec![0xcc; 48])
            }
            other => panic!("unexpected inbound: {other:?}"),
        }

        writer.send_reset().await.unwrap();
        assert!(matches!(reader.recv().await.unwrap(), Inbound::Closed));
    }
}
