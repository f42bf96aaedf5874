//! Dialback key derivation.
//!
//! `key = hex(HMAC-SHA256(secret, "{stream_id} {receiving} {originating}"))`
//!
//! Keys are never stored: the originating server recomputes the value when
//! a `db:verify` comes back for it. Rotation keeps the previous secret
//! accepted so keys handed out just before a rotation still verify.

use std::sync::RwLock;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

/// Source of the dialback secret.
pub trait SecretProvider: Send + Sync {
    /// Secret used to mint new keys.
    fn current(&self) -> Vec<u8>;

    /// All secrets a presented key may have been minted with, newest first.
    fn accepted(&self) -> Vec<Vec<u8>> {
        vec![self.current()]
    }
}

/// Compute the key for a stream `stream_id` opened from `originating` to `receiving`.
pub fn compute(secret: &[u8], stream_id: &str, receiving: &str, originating: &str) -> String {
    hex::encode(digest(secret, stream_id, receiving, originating))
}

/// Check a presented key against every accepted secret, in constant time per secret.
pub fn verify(
    secrets: &dyn SecretProvider,
    stream_id: &str,
    receiving: &str,
    originating: &str,
    key: &str,
) -> bool {
    let Ok(presented) = hex::decode(key.trim()) else {
        return false;
    };
    secrets.accepted().iter().any(|secret| {
        mac(secret, stream_id, receiving, originating)
            .verify_slice(&presented)
            .is_ok()
    })
}

fn mac(secret: &[u8], stream_id: &str, receiving: &str, originating: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(stream_id.as_bytes());
    mac.update(b" ");
    mac.update(receiving.to_lowercase().as_bytes());
    mac.update(b" ");
    mac.update(originating.to_lowercase().as_bytes());
    mac
}

fn digest(secret: &[u8], stream_id: &str, receiving: &str, originating: &str) -> Vec<u8> {
    mac(secret, stream_id, receiving, originating).finalize().into_bytes().to_vec()
}

// ─── Rotating secret ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct Secrets {
    current: Vec<u8>,
    previous: Option<Vec<u8>>,
}

/// In-memory secret that can be rotated while the server runs.
#[derive(Debug)]
pub struct RotatingSecret {
    inner: RwLock<Secrets>,
}

impl RotatingSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { inner: RwLock::new(Secrets { current: secret.into(), previous: None }) }
    }

    /// Fresh random 256-bit secret.
    pub fn generate() -> Self {
        Self::new(rand::random::<[u8; 32]>().to_vec())
    }

    /// Secret derived from an operator-configured passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(passphrase.as_bytes().to_vec())
    }

    /// Replace the current secret with a random one; the old one stays accepted
    /// until the next rotation.
    pub fn rotate(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let fresh = rand::random::<[u8; 32]>().to_vec();
        let old = std::mem::replace(&mut guard.current, fresh);
        guard.previous = Some(old);
        info!("S2S: dialback secret rotated");
    }
}

impl SecretProvider for RotatingSecret {
    fn current(&self) -> Vec<u8> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).current.clone()
    }

    fn accepted(&self) -> Vec<Vec<u8>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        std::iter::once(guard.current.clone()).chain(guard.previous.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn keys_are_deterministic_and_input_bound() {
        let k1 = compute(b"s3cret", "id1", "b.example", "a.example");
        assert_eq!(k1, compute(b"s3cret", "id1", "b.example", "a.example"));
        assert_eq!(k1.len(), 64);
        assert_ne!(k1, compute(b"s3cret", "id2", "b.example", "a.example"));
        assert_ne!(k1, compute(b"s3cret", "id1", "a.example", "b.example"));
        assert_ne!(k1, compute(b"other", "id1", "b.example", "a.example"));
    }

    #[test]
    fn verify_accepts_only_matching_key() {
        let secret = RotatingSecret::from_passphrase("s3cret");
        let key = compute(b"s3cret", "id1", "b.example", "a.example");
        assert!(verify(&secret, "id1", "b.example", "a.example", &key));
        assert!(!verify(&secret, "id1", "b.example", "c.example", &key));
        assert!(!verify(&secret, "id1", "b.example", "a.example", "not-hex"));
        assert!(!verify(&secret, "id1", "b.example", "a.example", ""));
    }

    #[test]
    fn garbled_keys_never_verify() {
        let secret = RotatingSecret::generate();
        let good = compute(&secret.current(), "stream", "b.example", "a.example");
        let mut rng = rand::rng();
        for _ in 0..500 {
            let len = rng.random_range(0..80);
            let garbage: String = (0..len)
                .map(|_| char::from(b"0123456789abcdefXYZ "[rng.random_range(0..20)]))
                .collect();
            if garbage.trim() == good {
                continue;
            }
            assert!(!verify(&secret, "stream", "b.example", "a.example", &garbage));
        }
        // Single-bit flips of the real key.
        let bytes = hex::decode(&good).unwrap();
        for i in 0..bytes.len() {
            let mut flipped = bytes.clone();
            flipped[i] ^= 1 << rng.random_range(0..8);
            assert!(!verify(&secret, "stream", "b.example", "a.example", &hex::encode(flipped)));
        }
    }

    #[test]
    fn rotation_keeps_previous_secret_for_one_generation() {
        let secret = RotatingSecret::generate();
        let old_key = compute(&secret.current(), "id", "b.example", "a.example");
        secret.rotate();
        assert!(verify(&secret, "id", "b.example", "a.example", &old_key));
        secret.rotate();
        assert!(!verify(&secret, "id", "b.example", "a.example", &old_key));
    }
}
