//! TunGo core: the data plane of a point-to-point VPN and the security
//! envelope around it.
//!
//! IP packets read from a TUN device are sealed with ChaCha20-Poly1305
//! under per-session keys agreed through an Ed25519-authenticated X25519
//! handshake, then carried over TCP (length-prefixed frames) or UDP (one
//! datagram per packet, explicit nonce prefix). Sessions are disposable:
//! any fatal transport or crypto error tears one down and the supervisor
//! builds a fresh one.

pub mod config;
pub mod factory;
pub mod framing;
pub mod handshake;
pub mod ip;
pub mod keys;
pub mod link;
pub mod nonce;
pub mod replay;
pub mod session;
pub mod worker;

// Re-export the types most callers touch.
pub use config::{ClientConfig, ConnectionSettings, ServerConfig, Transport};
pub use factory::{connect, ConnectError, Established};
pub use keys::{AllowList, Identity, TrustAnchor};
pub use link::{Link, LinkReader, LinkWriter};
pub use session::{AeadSession, CryptoError, SessionId};
pub use worker::{run_session, WorkerError};
