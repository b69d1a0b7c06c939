//! Client-side session establishment: dial the transport, drive the
//! handshake under a deadline, hand back a link and a keyed session.
//!
//! Every failure path releases the socket; there is no half-established
//! state for a caller to leak.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::config::{ConfigError, ConnectionSettings, Transport};
use crate::handshake::{
    self, ClientHandshake, HandshakeError, ServerHello, SERVER_HELLO_LEN,
};
use crate::keys::{Identity, TrustAnchor};
use crate::link::Link;
use crate::session::AeadSession;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("dialing {endpoint}: {source}")]
    Dial {
        endpoint: String,
        source: io::Error,
    },
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    Handshake(HandshakeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<HandshakeError> for ConnectError {
    fn from(e: HandshakeError) -> Self {
        ConnectError::Handshake(e)
    }
}

/// A dialled transport with its session keys agreed.
pub struct Established {
    pub link: Link,
    pub session: AeadSession,
}

pub async fn connect(
    transport: Transport,
    settings: &ConnectionSettings,
    anchor: TrustAnchor,
    identity: Option<Identity>,
) -> Result<Established, ConnectError> {
    let tunnel_ip = settings.tunnel_ip()?;
    let endpoint = settings.endpoint();
    let deadline = settings.handshake_deadline();
    let mut hs = ClientHandshake::new(tunnel_ip, anchor, identity);

    match transport {
        Transport::Tcp => {
            let mut stream = timeout(settings.dial_timeout(), TcpStream::connect(&endpoint))
                .await
                .map_err(|_| ConnectError::Dial {
                    endpoint: endpoint.clone(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
                })?
                .map_err(|source| ConnectError::Dial {
                    endpoint: endpoint.clone(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);

            let secrets = match timeout(deadline, tcp_handshake(&mut stream, &mut hs)).await {
                Err(_) => return Err(ConnectError::HandshakeTimeout(deadline)),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(secrets)) => secrets,
            };
            let session = secrets.into_session(false, settings.replay_window);
            debug!(session = %session.short_id(), %endpoint, "tcp session established");
            Ok(Established {
                link: Link::Tcp(stream),
                session,
            })
        }
        Transport::Udp => {
            let bind_addr = if endpoint.starts_with('[') {
                "[::]:0"
            } else {
                "0.0.0.0:0"
            };
            let socket = UdpSocket::bind(bind_addr)
                .await
                .map_err(|source| ConnectError::Dial {
                    endpoint: endpoint.clone(),
                    source,
                })?;
            // Connecting filters inbound traffic to the server address, so
            // strays from other sources never reach the receiver.
            socket
                .connect(&endpoint)
                .await
                .map_err(|source| ConnectError::Dial {
                    endpoint: endpoint.clone(),
                    source,
                })?;

            let secrets = match timeout(deadline, udp_handshake(&socket, &mut hs)).await {
                Err(_) => return Err(ConnectError::HandshakeTimeout(deadline)),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(secrets)) => secrets,
            };
            let session = secrets.into_session(false, settings.replay_window);
            debug!(session = %session.short_id(), %endpoint, "udp session established");
            Ok(Established {
                link: Link::Udp(Arc::new(socket)),
                session,
            })
        }
    }
}

async fn tcp_handshake(
    stream: &mut TcpStream,
    hs: &mut ClientHandshake,
) -> Result<handshake::SessionSecrets, HandshakeError> {
    let hello = hs.hello()?;
    handshake::write_message(stream, &hello.to_bytes()).await?;
    let server_hello = handshake::read_server_hello(stream).await?;
    let (signature, secrets) = hs.receive_server_hello(&server_hello)?;
    handshake::write_message(stream, &signature.to_bytes()).await?;
    Ok(secrets)
}

async fn udp_handshake(
    socket: &UdpSocket,
    hs: &mut ClientHandshake,
) -> Result<handshake::SessionSecrets, HandshakeError> {
    let hello = hs.hello()?;
    socket.send(&hello.to_bytes()).await?;

    let mut buf = [0u8; 2048];
    let server_hello = loop {
        let n = socket.recv(&mut buf).await?;
        if n != SERVER_HELLO_LEN {
            debug!(len = n, "ignoring non-hello datagram during handshake");
            continue;
        }
        break ServerHello::parse(&buf[..n])?;
    };

    let (signature, secrets) = hs.receive_server_hello(&server_hello)?;
    socket.send(&signature.to_bytes()).await?;
    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::settings;
    use crate::handshake::ServerHandshake;
    use crate::keys::AllowList;
    use tokio::net::TcpListener;

    // Runs against the five-second deadline floor in real time; slow by
    // design, matching what a user would see against a mute server.
    #[tokio::test]
    async fn mute_server_times_the_handshake_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold the connection without ever speaking.
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(stream);
        });

        let s = settings(port);
        let anchor = TrustAnchor::from_key(Identity::generate().verifying_key());
        match connect(Transport::Tcp, &s, anchor, None).await {
            Err(ConnectError::HandshakeTimeout(d)) => {
                assert_eq!(d, s.handshake_deadline());
            }
            other => panic!("expected HandshakeTimeout, got {:?}", other.err()),
        }
        hold.abort();
    }

    #[tokio::test]
    async fn tcp_connect_establishes_interoperable_sessions() {
        let identity = Arc::new(Identity::generate());
        let anchor = TrustAnchor::from_key(identity.verifying_key());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hs = ServerHandshake::new(identity, Arc::new(AllowList::default()));
            let hello = handshake::read_client_hello(&mut stream).await.unwrap();
            let reply = hs.receive_client_hello(&hello).unwrap();
            handshake::write_message(&mut stream, &reply.to_bytes())
                .await
                .unwrap();
            let sig = handshake::read_client_signature(&mut stream).await.unwrap();
            hs.receive_client_signature(&sig).unwrap()
        });

        let s = settings(port);
        let established = connect(Transport::Tcp, &s, anchor, None).await.unwrap();
        let server_secrets = server.await.unwrap();

        let mut client_session = established.session;
        let mut server_session = server_secrets.into_session(true, s.replay_window);
        let (n, ct) = client_session.encrypt(b"first packet").unwrap();
        assert_eq!(server_session.decrypt(n, &ct).unwrap(), b"first packet");
    }

    #[tokio::test]
    async fn refused_dial_reports_the_endpoint() {
        let mut s = settings(1); // nothing listens on port 1
        s.dial_timeout_ms = 1000;
        let anchor = TrustAnchor::from_key(Identity::generate().verifying_key());
        match connect(Transport::Tcp, &s, anchor, None).await {
            Err(ConnectError::Dial { endpoint, .. }) => {
                assert_eq!(endpoint, "127.0.0.1:1");
            }
            other => panic!("expected Dial error, got {:?}", other.err()),
        }
    }
}
