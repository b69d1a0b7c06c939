//! Session establishment.
//!
//! Three fixed-layout messages, exchanged before any data flows:
//!
//! 1. `ClientHello`: tunnel-IP claim (textual), X25519 ephemeral public
//!    key, 32-byte nonce.
//! 2. `ServerHello`: server ephemeral public key, server nonce, Ed25519
//!    signature over `clientEph || serverEph || clientNonce || serverNonce`.
//! 3. `ClientSignature`: the client's Ed25519 signature over the same
//!    transcript; all zeroes when mutual authentication is off.
//!
//! The state machines here are transport-free: callers feed them parsed
//! messages and ship the replies. Async codec helpers for the stream
//! transport live alongside, since message sizes are fixed by the state
//! rather than length-prefixed.
//!
//! Key schedule: with `s` the X25519 shared secret, `cn`/`sn` the nonces,
//! `session_id = SHA-256(s || cn || sn || "tungo/session-id")` and the two
//! directional keys are `SHA-256(s || cn || sn || tag)` for `tag` in
//! `{"c2s", "s2c"}`.

use std::mem;
use std::net::IpAddr;
use std::sync::Arc;

use ed25519_dalek::Signature;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};

use crate::keys::{AllowList, Identity, TrustAnchor};
use crate::session::{AeadSession, SessionId, SessionKeys};

pub const EPHEMERAL_LEN: usize = 32;
pub const HELLO_NONCE_LEN: usize = 32;
pub const SIG_LEN: usize = 64;
/// Longest textual IP form (IPv4-mapped IPv6).
pub const MAX_IP_TEXT: usize = 45;
pub const SERVER_HELLO_LEN: usize = EPHEMERAL_LEN + HELLO_NONCE_LEN + SIG_LEN;

const SESSION_ID_INFO: &[u8] = b"tungo/session-id";
const C2S_INFO: &[u8] = b"c2s";
const S2C_INFO: &[u8] = b"s2c";

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("i/o during handshake: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake deadline expired")]
    Timeout,
    #[error("malformed {0} message")]
    Protocol(&'static str),
    #[error("handshake message out of order")]
    OutOfOrder,
    #[error("peer signature did not verify")]
    SignatureInvalid,
    #[error("tunnel ip {0} is already claimed")]
    IpCollision(IpAddr),
    #[error("peer key is not on the allow list")]
    PeerNotAllowed,
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientHello {
    pub tunnel_ip: IpAddr,
    pub ephemeral: [u8; EPHEMERAL_LEN],
    pub nonce: [u8; HELLO_NONCE_LEN],
}

impl ClientHello {
    pub fn to_bytes(&self) -> Vec<u8> {
        let ip_text = self.tunnel_ip.to_string();
        let mut out = Vec::with_capacity(2 + ip_text.len() + EPHEMERAL_LEN + HELLO_NONCE_LEN);
        out.push(if self.tunnel_ip.is_ipv4() { 4 } else { 6 });
        out.push(ip_text.len() as u8);
        out.extend_from_slice(ip_text.as_bytes());
        out.extend_from_slice(&self.ephemeral);
        out.extend_from_slice(&self.nonce);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<ClientHello, HandshakeError> {
        if bytes.len() < 2 {
            return Err(HandshakeError::Protocol("client hello"));
        }
        let version = bytes[0];
        let ip_len = bytes[1] as usize;
        if !matches!(version, 4 | 6) || ip_len == 0 || ip_len > MAX_IP_TEXT {
            return Err(HandshakeError::Protocol("client hello"));
        }
        if bytes.len() != 2 + ip_len + EPHEMERAL_LEN + HELLO_NONCE_LEN {
            return Err(HandshakeError::Protocol("client hello"));
        }
        let ip_text = std::str::from_utf8(&bytes[2..2 + ip_len])
            .map_err(|_| HandshakeError::Protocol("client hello"))?;
        let tunnel_ip: IpAddr = ip_text
            .parse()
            .map_err(|_| HandshakeError::Protocol("client hello"))?;
        let claimed_v4 = version == 4;
        if tunnel_ip.is_ipv4() != claimed_v4 {
            return Err(HandshakeError::Protocol("client hello"));
        }
        let mut ephemeral = [0u8; EPHEMERAL_LEN];
        ephemeral.copy_from_slice(&bytes[2 + ip_len..2 + ip_len + EPHEMERAL_LEN]);
        let mut nonce = [0u8; HELLO_NONCE_LEN];
        nonce.copy_from_slice(&bytes[2 + ip_len + EPHEMERAL_LEN..]);
        Ok(ClientHello {
            tunnel_ip,
            ephemeral,
            nonce,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub ephemeral: [u8; EPHEMERAL_LEN],
    pub nonce: [u8; HELLO_NONCE_LEN],
    pub signature: [u8; SIG_LEN],
}

impl ServerHello {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SERVER_HELLO_LEN);
        out.extend_from_slice(&self.ephemeral);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<ServerHello, HandshakeError> {
        if bytes.len() != SERVER_HELLO_LEN {
            return Err(HandshakeError::Protocol("server hello"));
        }
        let mut ephemeral = [0u8; EPHEMERAL_LEN];
        ephemeral.copy_from_slice(&bytes[..EPHEMERAL_LEN]);
        let mut nonce = [0u8; HELLO_NONCE_LEN];
        nonce.copy_from_slice(&bytes[EPHEMERAL_LEN..EPHEMERAL_LEN + HELLO_NONCE_LEN]);
        let mut signature = [0u8; SIG_LEN];
        signature.copy_from_slice(&bytes[EPHEMERAL_LEN + HELLO_NONCE_LEN..]);
        Ok(ServerHello {
            ephemeral,
            nonce,
            signature,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientSignature {
    pub signature: [u8; SIG_LEN],
}

impl ClientSignature {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.signature.to_vec()
    }

    pub fn parse(bytes: &[u8]) -> Result<ClientSignature, HandshakeError> {
        let signature: [u8; SIG_LEN] = bytes
            .try_into()
            .map_err(|_| HandshakeError::Protocol("client signature"))?;
        Ok(ClientSignature { signature })
    }
}

fn transcript(
    client_eph: &[u8; EPHEMERAL_LEN],
    server_eph: &[u8; EPHEMERAL_LEN],
    client_nonce: &[u8; HELLO_NONCE_LEN],
    server_nonce: &[u8; HELLO_NONCE_LEN],
) -> [u8; 128] {
    let mut t = [0u8; 128];
    t[..32].copy_from_slice(client_eph);
    t[32..64].copy_from_slice(server_eph);
    t[64..96].copy_from_slice(client_nonce);
    t[96..].copy_from_slice(server_nonce);
    t
}

// ---------------------------------------------------------------------------
// Key schedule
// ---------------------------------------------------------------------------

/// What a completed handshake leaves behind.
pub struct SessionSecrets {
    pub id: SessionId,
    pub keys: SessionKeys,
}

impl std::fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecrets")
            .field("id", &self.id)
            .field("keys", &"<redacted>")
            .finish()
    }
}

impl SessionSecrets {
    pub fn into_session(self, is_server: bool, window_capacity: usize) -> AeadSession {
        AeadSession::new(self.id, self.keys, is_server, window_capacity)
    }
}

fn kdf(
    shared: &SharedSecret,
    client_nonce: &[u8; HELLO_NONCE_LEN],
    server_nonce: &[u8; HELLO_NONCE_LEN],
    info: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared.as_bytes());
    hasher.update(client_nonce);
    hasher.update(server_nonce);
    hasher.update(info);
    hasher.finalize().into()
}

fn derive_secrets(
    shared: &SharedSecret,
    client_nonce: &[u8; HELLO_NONCE_LEN],
    server_nonce: &[u8; HELLO_NONCE_LEN],
    is_server: bool,
) -> SessionSecrets {
    let id = kdf(shared, client_nonce, server_nonce, SESSION_ID_INFO);
    let c2s = kdf(shared, client_nonce, server_nonce, C2S_INFO);
    let s2c = kdf(shared, client_nonce, server_nonce, S2C_INFO);
    let keys = if is_server {
        SessionKeys { send: s2c, recv: c2s }
    } else {
        SessionKeys { send: c2s, recv: s2c }
    };
    SessionSecrets { id, keys }
}

// ---------------------------------------------------------------------------
// Client state machine
// ---------------------------------------------------------------------------

enum ClientState {
    Init { secret: EphemeralSecret },
    SentHello { secret: EphemeralSecret },
    Established,
    Failed,
}

/// Initiator side. `hello` then `receive_server_hello`; any misuse or
/// malformed input parks the machine in a terminal failed state.
pub struct ClientHandshake {
    tunnel_ip: IpAddr,
    public: X25519Public,
    nonce: [u8; HELLO_NONCE_LEN],
    anchor: TrustAnchor,
    identity: Option<Identity>,
    state: ClientState,
}

impl ClientHandshake {
    /// `identity` carries the client's long-term key when the server
    /// enforces mutual authentication; without one the signature slot is
    /// sent zeroed.
    pub fn new(tunnel_ip: IpAddr, anchor: TrustAnchor, identity: Option<Identity>) -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let mut nonce = [0u8; HELLO_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        ClientHandshake {
            tunnel_ip,
            public,
            nonce,
            anchor,
            identity,
            state: ClientState::Init { secret },
        }
    }

    /// The opening message. Valid exactly once.
    pub fn hello(&mut self) -> Result<ClientHello, HandshakeError> {
        let state = mem::replace(&mut self.state, ClientState::Failed);
        match state {
            ClientState::Init { secret } => {
                self.state = ClientState::SentHello { secret };
                Ok(ClientHello {
                    tunnel_ip: self.tunnel_ip,
                    ephemeral: *self.public.as_bytes(),
                    nonce: self.nonce,
                })
            }
            _ => Err(HandshakeError::OutOfOrder),
        }
    }

    /// Verify the server's identity signature, run the key agreement, and
    /// produce the closing message.
    pub fn receive_server_hello(
        &mut self,
        hello: &ServerHello,
    ) -> Result<(ClientSignature, SessionSecrets), HandshakeError> {
        let state = mem::replace(&mut self.state, ClientState::Failed);
        let secret = match state {
            ClientState::SentHello { secret } => secret,
            _ => return Err(HandshakeError::OutOfOrder),
        };

        let transcript = transcript(
            self.public.as_bytes(),
            &hello.ephemeral,
            &self.nonce,
            &hello.nonce,
        );
        let signature = Signature::from_bytes(&hello.signature);
        if !self.anchor.verify(&transcript, &signature) {
            return Err(HandshakeError::SignatureInvalid);
        }

        let shared = secret.diffie_hellman(&X25519Public::from(hello.ephemeral));
        let secrets = derive_secrets(&shared, &self.nonce, &hello.nonce, false);

        let client_signature = match &self.identity {
            Some(identity) => ClientSignature {
                signature: identity.sign(&transcript).to_bytes(),
            },
            None => ClientSignature {
                signature: [0u8; SIG_LEN],
            },
        };

        self.state = ClientState::Established;
        Ok((client_signature, secrets))
    }
}

// ---------------------------------------------------------------------------
// Server state machine
// ---------------------------------------------------------------------------

enum ServerState {
    Init,
    AwaitingSignature {
        secret: EphemeralSecret,
        client_eph: [u8; EPHEMERAL_LEN],
        client_nonce: [u8; HELLO_NONCE_LEN],
        server_nonce: [u8; HELLO_NONCE_LEN],
    },
    Established,
    Failed,
}

/// Responder side. The tunnel-IP claim is surfaced after the hello so the
/// caller can reserve the slot (and fail the handshake on a collision)
/// before any reply leaves.
pub struct ServerHandshake {
    identity: Arc<Identity>,
    allow: Arc<AllowList>,
    claimed_ip: Option<IpAddr>,
    state: ServerState,
}

impl ServerHandshake {
    pub fn new(identity: Arc<Identity>, allow: Arc<AllowList>) -> Self {
        ServerHandshake {
            identity,
            allow,
            claimed_ip: None,
            state: ServerState::Init,
        }
    }

    pub fn claimed_ip(&self) -> Option<IpAddr> {
        self.claimed_ip
    }

    pub fn receive_client_hello(
        &mut self,
        hello: &ClientHello,
    ) -> Result<ServerHello, HandshakeError> {
        match self.state {
            ServerState::Init => {}
            _ => {
                self.state = ServerState::Failed;
                return Err(HandshakeError::OutOfOrder);
            }
        }

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let mut server_nonce = [0u8; HELLO_NONCE_LEN];
        OsRng.fill_bytes(&mut server_nonce);

        let transcript = transcript(
            &hello.ephemeral,
            public.as_bytes(),
            &hello.nonce,
            &server_nonce,
        );
        let signature = self.identity.sign(&transcript).to_bytes();

        self.claimed_ip = Some(hello.tunnel_ip);
        self.state = ServerState::AwaitingSignature {
            secret,
            client_eph: hello.ephemeral,
            client_nonce: hello.nonce,
            server_nonce,
        };

        Ok(ServerHello {
            ephemeral: *public.as_bytes(),
            nonce: server_nonce,
            signature,
        })
    }

    pub fn receive_client_signature(
        &mut self,
        message: &ClientSignature,
    ) -> Result<SessionSecrets, HandshakeError> {
        let state = mem::replace(&mut self.state, ServerState::Failed);
        let (secret, client_eph, client_nonce, server_nonce) = match state {
            ServerState::AwaitingSignature {
                secret,
                client_eph,
                client_nonce,
                server_nonce,
            } => (secret, client_eph, client_nonce, server_nonce),
            _ => return Err(HandshakeError::OutOfOrder),
        };

        if !self.allow.is_empty() {
            let server_eph = X25519Public::from(&secret);
            let transcript = transcript(
                &client_eph,
                server_eph.as_bytes(),
                &client_nonce,
                &server_nonce,
            );
            let signature = Signature::from_bytes(&message.signature);
            if !self.allow.verifies(&transcript, &signature) {
                return Err(HandshakeError::PeerNotAllowed);
            }
        }

        let shared = secret.diffie_hellman(&X25519Public::from(client_eph));
        let secrets = derive_secrets(&shared, &client_nonce, &server_nonce, true);
        self.state = ServerState::Established;
        Ok(secrets)
    }
}

// ---------------------------------------------------------------------------
// Stream codecs
// ---------------------------------------------------------------------------
//
// Handshake messages on the byte stream are not length-prefixed; their
// sizes follow from the state machine, with the hello's variable IP field
// self-describing.

pub async fn read_client_hello<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ClientHello, HandshakeError> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    let ip_len = head[1] as usize;
    if !matches!(head[0], 4 | 6) || ip_len == 0 || ip_len > MAX_IP_TEXT {
        return Err(HandshakeError::Protocol("client hello"));
    }
    let mut rest = vec![0u8; ip_len + EPHEMERAL_LEN + HELLO_NONCE_LEN];
    reader.read_exact(&mut rest).await?;
    let mut full = Vec::with_capacity(2 + rest.len());
    full.extend_from_slice(&head);
    full.extend_from_slice(&rest);
    ClientHello::parse(&full)
}

pub async fn read_server_hello<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ServerHello, HandshakeError> {
    let mut buf = [0u8; SERVER_HELLO_LEN];
    reader.read_exact(&mut buf).await?;
    ServerHello::parse(&buf)
}

pub async fn read_client_signature<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ClientSignature, HandshakeError> {
    let mut buf = [0u8; SIG_LEN];
    reader.read_exact(&mut buf).await?;
    ClientSignature::parse(&buf)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), HandshakeError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
