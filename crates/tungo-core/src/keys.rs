//! Long-term Ed25519 identity material.
//!
//! Servers persist a keypair and hold an allow-list of peer public keys;
//! clients pin the server's public key as their only trust anchor. All
//! on-disk and in-config encodings are base64.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;

/// Ed25519 keypair identifying one end of the tunnel.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Generate a new keypair and persist the secret to `path`, base64.
    pub fn generate_and_store(path: &Path) -> Result<Self> {
        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, identity.private_base64()).context("writing identity file")?;
        tracing::info!("generated new identity at {:?}", path);
        Ok(identity)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).context("reading identity file")?;
        let identity = Self::from_base64(data.trim())
            .with_context(|| format!("identity file {:?}", path))?;
        tracing::info!("loaded identity from {:?}", path);
        Ok(identity)
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate_and_store(path)
        }
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .context("identity key is not valid base64")?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity key must decode to 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    pub fn private_base64(&self) -> String {
        BASE64_STANDARD.encode(self.signing_key.to_bytes())
    }

    pub fn public_base64(&self) -> String {
        BASE64_STANDARD.encode(self.public_key_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Short fingerprint for logs (first 8 hex chars of the public key).
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_key_bytes()[..4])
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

/// A pinned remote public key. No CA, no TOFU: provisioning writes it once
/// and every handshake verifies against exactly this key.
#[derive(Clone)]
pub struct TrustAnchor {
    key: VerifyingKey,
}

impl TrustAnchor {
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .context("trust anchor is not valid base64")?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("trust anchor must decode to 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&key_bytes).context("invalid Ed25519 public key")?;
        Ok(Self { key })
    }

    pub fn from_key(key: VerifyingKey) -> Self {
        Self { key }
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        self.key.verify(msg, sig).is_ok()
    }

    pub fn fingerprint(&self) -> String {
        hex::encode(&self.key.to_bytes()[..4])
    }
}

/// Peer public keys a server will accept. An empty list disables mutual
/// authentication entirely.
#[derive(Clone, Default)]
pub struct AllowList {
    keys: Vec<VerifyingKey>,
}

impl AllowList {
    pub fn from_base64_list(encoded: &[String]) -> Result<Self> {
        let mut keys = Vec::with_capacity(encoded.len());
        for entry in encoded {
            let bytes = BASE64_STANDARD
                .decode(entry.trim())
                .with_context(|| format!("allow-list entry {:?} is not valid base64", entry))?;
            let key_bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("allow-list entry must decode to 32 bytes"))?;
            keys.push(VerifyingKey::from_bytes(&key_bytes).context("invalid peer public key")?);
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// True if any listed key produced `sig` over `msg`.
    pub fn verifies(&self, msg: &[u8], sig: &Signature) -> bool {
        self.keys.iter().any(|key| key.verify(msg, sig).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_identity_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let original = Identity::generate_and_store(&path).unwrap();
        let loaded = Identity::load(&path).unwrap();
        assert_eq!(original.public_key_bytes(), loaded.public_key_bytes());
    }

    #[test]
    fn load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[test]
    fn anchor_verifies_only_its_own_key() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let anchor = TrustAnchor::from_base64(&identity.public_base64()).unwrap();

        let sig = identity.sign(b"transcript");
        assert!(anchor.verify(b"transcript", &sig));
        assert!(!anchor.verify(b"transcript", &other.sign(b"transcript")));
        assert!(!anchor.verify(b"other message", &sig));
    }

    #[test]
    fn allow_list_matches_listed_peers() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mallory = Identity::generate();
        let allow = AllowList::from_base64_list(&[
            alice.public_base64(),
            bob.public_base64(),
        ])
        .unwrap();

        let msg = b"transcript";
        assert!(allow.verifies(msg, &bob.sign(msg)));
        assert!(!allow.verifies(msg, &mallory.sign(msg)));
        assert!(!AllowList::default().verifies(msg, &alice.sign(msg)));
    }

    #[test]
    fn malformed_encodings_are_rejected() {
        assert!(TrustAnchor::from_base64("not base64!!!").is_err());
        assert!(TrustAnchor::from_base64(&BASE64_STANDARD.encode([0u8; 16])).is_err());
        assert!(Identity::from_base64("@@@").is_err());
    }
}
