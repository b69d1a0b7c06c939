//! Per-session authenticated encryption.
//!
//! A session is two independent ChaCha20-Poly1305 halves keyed with
//! disjoint 256-bit keys. Each half is owned by exactly one forwarding
//! worker after `split`, so the hot path needs no locking: the sender owns
//! its counter, the receiver owns its counter and replay window.
//!
//! Every message binds `session_id || direction_tag || message_number` as
//! associated data, so ciphertext cannot be reflected back to its sender or
//! replayed into another session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce as ChaChaNonce};
use thiserror::Error;
use zeroize::Zeroize;

use crate::nonce::Nonce;
use crate::replay::ReplayWindow;

pub const SESSION_ID_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

pub type SessionId = [u8; SESSION_ID_LEN];

/// First 8 hex chars of a session id, for log correlation.
pub fn short_id(id: &SessionId) -> String {
    hex::encode(&id[..4])
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("send nonce space exhausted")]
    NonceExhausted,
    #[error("ciphertext failed authentication")]
    AeadOpenFailed,
    #[error("message counter outside the replay window or already seen")]
    ReplayRejected,
    #[error("plaintext could not be sealed")]
    AeadSealFailed,
}

/// Which way a message travels. The tag is bound into the associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn tag(self) -> &'static [u8] {
        match self {
            Direction::ClientToServer => b"client-to-server",
            Direction::ServerToClient => b"server-to-client",
        }
    }

    pub fn invert(self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// The two 256-bit session keys a handshake derives. Zeroed on drop.
pub struct SessionKeys {
    pub send: [u8; KEY_LEN],
    pub recv: [u8; KEY_LEN],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.send.zeroize();
        self.recv.zeroize();
    }
}

fn associated_data(id: &SessionId, dir: Direction, message_number: u64) -> Vec<u8> {
    let tag = dir.tag();
    let mut ad = Vec::with_capacity(SESSION_ID_LEN + tag.len() + 8);
    ad.extend_from_slice(id);
    ad.extend_from_slice(tag);
    ad.extend_from_slice(&message_number.to_be_bytes());
    ad
}

/// Outbound half. Single writer; counter strictly increases.
pub struct SessionSender {
    cipher: ChaCha20Poly1305,
    nonce: Nonce,
    dir: Direction,
    id: SessionId,
}

impl SessionSender {
    /// Seal one packet, returning the counter it was sealed under and the
    /// ciphertext (tag appended).
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>), CryptoError> {
        if self.nonce == Nonce::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = self.nonce;
        let ad = associated_data(&self.id, self.dir, nonce.message_number());
        let ciphertext = self
            .cipher
            .encrypt(
                ChaChaNonce::from_slice(&nonce.to_bytes()),
                Payload {
                    msg: plaintext,
                    aad: &ad,
                },
            )
            .map_err(|_| CryptoError::AeadSealFailed)?;
        self.nonce = nonce.next();
        Ok((nonce, ciphertext))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    #[cfg(test)]
    pub(crate) fn set_nonce(&mut self, nonce: Nonce) {
        self.nonce = nonce;
    }
}

/// Inbound half. Single reader.
///
/// Two open paths exist because the two transports disagree about ordering:
/// datagrams carry their counter explicitly and go through the replay
/// window; the ordered byte stream carries no counter and must match the
/// local one exactly.
pub struct SessionReceiver {
    cipher: ChaCha20Poly1305,
    nonce: Nonce,
    dir: Direction,
    id: SessionId,
    window: ReplayWindow,
    reset: Arc<AtomicBool>,
    replay_rejections: u64,
}

impl SessionReceiver {
    /// Open a datagram sealed under an explicit counter. The window is
    /// consulted before the AEAD runs and committed only after it passes,
    /// so forged counters cannot poison the window.
    pub fn open(&mut self, nonce: Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.window.check(nonce.counter()) {
            self.replay_rejections += 1;
            return Err(CryptoError::ReplayRejected);
        }
        let ad = associated_data(&self.id, self.dir, nonce.message_number());
        let plaintext = self
            .cipher
            .decrypt(
                ChaChaNonce::from_slice(&nonce.to_bytes()),
                Payload {
                    msg: ciphertext,
                    aad: &ad,
                },
            )
            .map_err(|_| {
                self.reset.store(true, Ordering::SeqCst);
                CryptoError::AeadOpenFailed
            })?;
        self.window.commit(nonce.counter());
        Ok(plaintext)
    }

    /// Open the next message of an ordered stream, deriving the counter
    /// locally.
    pub fn open_next(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.nonce == Nonce::MAX {
            self.reset.store(true, Ordering::SeqCst);
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = self.nonce;
        let ad = associated_data(&self.id, self.dir, nonce.message_number());
        let plaintext = self
            .cipher
            .decrypt(
                ChaChaNonce::from_slice(&nonce.to_bytes()),
                Payload {
                    msg: ciphertext,
                    aad: &ad,
                },
            )
            .map_err(|_| {
                self.reset.store(true, Ordering::SeqCst);
                CryptoError::AeadOpenFailed
            })?;
        self.nonce = nonce.next();
        Ok(plaintext)
    }

    /// Set when this half hit a condition the peer should tear down over.
    pub fn reset_requested(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    pub fn replay_rejections(&self) -> u64 {
        self.replay_rejections
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }
}

/// Both halves of a freshly established session, still joined.
pub struct AeadSession {
    sender: SessionSender,
    receiver: SessionReceiver,
    id: SessionId,
    reset: Arc<AtomicBool>,
}

impl AeadSession {
    pub fn new(
        id: SessionId,
        keys: SessionKeys,
        is_server: bool,
        window_capacity: usize,
    ) -> AeadSession {
        let send_dir = if is_server {
            Direction::ServerToClient
        } else {
            Direction::ClientToServer
        };
        let reset = Arc::new(AtomicBool::new(false));
        let sender = SessionSender {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.send)),
            nonce: Nonce::ZERO,
            dir: send_dir,
            id,
        };
        let receiver = SessionReceiver {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.recv)),
            nonce: Nonce::ZERO,
            dir: send_dir.invert(),
            id,
            window: ReplayWindow::new(window_capacity),
            reset: reset.clone(),
            replay_rejections: 0,
        };
        AeadSession {
            sender,
            receiver,
            id,
            reset,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn short_id(&self) -> String {
        short_id(&self.id)
    }

    pub fn reset_requested(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    /// Hand each half to its worker. No lock guards the counters afterward;
    /// exclusive ownership is the synchronization.
    pub fn split(self) -> (SessionSender, SessionReceiver) {
        (self.sender, self.receiver)
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>), CryptoError> {
        self.sender.seal(plaintext)
    }

    pub fn decrypt(&mut self, nonce: Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.receiver.open(nonce, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::DEFAULT_WINDOW;

    fn session_pair() -> (AeadSession, AeadSession) {
        let id: SessionId = [7u8; 32];
        let c2s = [1u8; 32];
        let s2c = [2u8; 32];
        let client = AeadSession::new(
            id,
            SessionKeys { send: c2s, recv: s2c },
            false,
            DEFAULT_WINDOW,
        );
        let server = AeadSession::new(
            id,
            SessionKeys { send: s2c, recv: c2s },
            true,
            DEFAULT_WINDOW,
        );
        (client, server)
    }

    #[test]
    fn roundtrip_both_directions() {
        let (mut client, mut server) = session_pair();

        let (n, ct) = client.encrypt(b"up the tunnel").unwrap();
        assert_eq!(server.decrypt(n, &ct).unwrap(), b"up the tunnel");

        let (n, ct) = server.encrypt(b"down the tunnel").unwrap();
        assert_eq!(client.decrypt(n, &ct).unwrap(), b"down the tunnel");
    }

    #[test]
    fn counters_strictly_increase() {
        let (mut client, _) = session_pair();
        let mut last = None;
        for _ in 0..32 {
            let (n, _) = client.encrypt(b"x").unwrap();
            if let Some(prev) = last {
                assert!(n > prev);
            }
            last = Some(n);
        }
    }

    #[test]
    fn single_bit_flip_fails_authentication() {
        let (mut client, mut server) = session_pair();
        let (n, ct) = client.encrypt(b"integrity matters").unwrap();
        for bit in [0usize, 7, ct.len() * 8 - 1] {
            let mut tampered = ct.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(
                server.decrypt(n, &tampered).unwrap_err(),
                CryptoError::AeadOpenFailed
            );
        }
        // The untouched ciphertext still opens: failures did not poison
        // the window.
        assert!(server.decrypt(n, &ct).is_ok());
    }

    #[test]
    fn replayed_datagram_is_rejected_once_and_counted() {
        let (mut client, mut server) = session_pair();
        let (n, ct) = client.encrypt(b"once only").unwrap();
        assert!(server.decrypt(n, &ct).is_ok());
        assert_eq!(
            server.decrypt(n, &ct).unwrap_err(),
            CryptoError::ReplayRejected
        );
        let (_, receiver) = server.split();
        assert_eq!(receiver.replay_rejections(), 1);
    }

    #[test]
    fn reordered_datagrams_within_window_open() {
        let (mut client, mut server) = session_pair();
        let sealed: Vec<_> = (0..10)
            .map(|i| {
                let payload = format!("packet {i}");
                let (n, ct) = client.encrypt(payload.as_bytes()).unwrap();
                (n, ct, payload)
            })
            .collect();

        // Deliver 7 before 5, everything else in order.
        let mut order: Vec<usize> = (0..10).collect();
        order.swap(5, 7);
        for i in order {
            let (n, ct, expected) = &sealed[i];
            assert_eq!(server.decrypt(*n, ct).unwrap(), expected.as_bytes());
        }
    }

    #[test]
    fn direction_tag_prevents_reflection() {
        let (mut client, _) = session_pair();
        let (n, ct) = client.encrypt(b"do not reflect").unwrap();
        // A second client-side session with mirrored keys plays the
        // attacker bouncing traffic straight back.
        let id: SessionId = [7u8; 32];
        let mut mirrored = AeadSession::new(
            id,
            SessionKeys {
                send: [2u8; 32],
                recv: [1u8; 32],
            },
            false,
            DEFAULT_WINDOW,
        );
        assert_eq!(
            mirrored.decrypt(n, &ct).unwrap_err(),
            CryptoError::AeadOpenFailed
        );
    }

    #[test]
    fn ordered_stream_open_tracks_the_counter() {
        let (mut client, server) = session_pair();
        let (_, mut receiver) = server.split();
        for i in 0..5 {
            let payload = format!("segment {i}");
            let (_, ct) = client.encrypt(payload.as_bytes()).unwrap();
            assert_eq!(receiver.open_next(&ct).unwrap(), payload.as_bytes());
        }
        assert!(!receiver.reset_requested());
    }

    #[test]
    fn ordered_stream_flags_reset_on_bad_open() {
        let (mut client, server) = session_pair();
        let (_, mut receiver) = server.split();
        let (_, mut ct) = client.encrypt(b"segment").unwrap();
        ct[0] ^= 0xff;
        assert_eq!(
            receiver.open_next(&ct).unwrap_err(),
            CryptoError::AeadOpenFailed
        );
        assert!(receiver.reset_requested());
    }

    #[test]
    fn exhausted_counter_is_fatal() {
        let (client, _) = session_pair();
        let (mut sender, _) = client.split();
        sender.set_nonce(Nonce::MAX);
        assert_eq!(
            sender.seal(b"one too many").unwrap_err(),
            CryptoError::NonceExhausted
        );
    }
}
