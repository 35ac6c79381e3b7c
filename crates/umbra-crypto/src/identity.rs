//! Long-term X25519 peer identity.
//!
//! A peer is identified by its static X25519 public key. The same keypair
//! serves as the recipient key for [`hybrid`](crate::hybrid) encryption of
//! handshake material, so identity and handshake secrecy share one key as the
//! community protocol requires.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::kdf;
use crate::{CryptoError, Result};

/// Length of a serialized peer public key.
pub const PEER_KEY_LEN: usize = 32;

/// A long-term tunnel keypair identifying this peer.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct TunnelKeypair {
    secret: StaticSecret,
}

/// A peer's long-term public key, as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey {
    bytes: [u8; PEER_KEY_LEN],
}

/// An X25519 shared secret; zeroized on drop.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl TunnelKeypair {
    /// Generate a fresh random keypair.
    pub fn random() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore a keypair from raw secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Raw secret bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> PeerKey {
        PeerKey {
            bytes: PublicKey::from(&self.secret).to_bytes(),
        }
    }

    /// Diffie-Hellman against a peer public key.
    pub fn diffie_hellman(&self, their_public: &PeerKey) -> SharedSecret {
        let pk = PublicKey::from(their_public.bytes);
        SharedSecret {
            bytes: *self.secret.diffie_hellman(&pk).as_bytes(),
        }
    }
}

impl PeerKey {
    /// Create from exactly 32 raw bytes.
    pub fn from_bytes(bytes: [u8; PEER_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Parse a public key from wire bytes, validating the length.
    pub fn from_public_bin(data: &[u8]) -> Result<Self> {
        if data.len() != PEER_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: PEER_KEY_LEN,
                actual: data.len(),
            });
        }
        let mut bytes = [0u8; PEER_KEY_LEN];
        bytes.copy_from_slice(data);
        Ok(Self { bytes })
    }

    /// Whether wire bytes describe a key this peer can run the handshake with.
    ///
    /// Candidates advertising keys of another algorithm (any other length)
    /// are filtered out before circuit extension.
    pub fn is_compatible(data: &[u8]) -> bool {
        data.len() == PEER_KEY_LEN
    }

    /// Raw bytes.
    pub fn to_bytes(self) -> [u8; PEER_KEY_LEN] {
        self.bytes
    }

    /// Raw bytes as a slice reference.
    pub fn as_bytes(&self) -> &[u8; PEER_KEY_LEN] {
        &self.bytes
    }

    /// Hex BLAKE3 fingerprint of this key, for logs and peer bookkeeping.
    pub fn to_hash(&self) -> String {
        hex::encode(kdf::hash(&self.bytes))
    }
}

impl SharedSecret {
    /// Raw bytes of the shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_roundtrip() {
        let kp = TunnelKeypair::random();
        let restored = TunnelKeypair::from_bytes(kp.to_bytes());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_diffie_hellman_agreement() {
        let a = TunnelKeypair::random();
        let b = TunnelKeypair::random();
        let ab = a.diffie_hellman(&b.public_key());
        let ba = b.diffie_hellman(&a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_from_public_bin_rejects_wrong_length() {
        assert!(PeerKey::from_public_bin(&[0u8; 20]).is_err());
        assert!(PeerKey::from_public_bin(&[0u8; 33]).is_err());
        assert!(PeerKey::from_public_bin(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_is_compatible() {
        assert!(PeerKey::is_compatible(&[0u8; 32]));
        assert!(!PeerKey::is_compatible(&[0u8; 31]));
        assert!(!PeerKey::is_compatible(&[]));
    }

    #[test]
    fn test_to_hash_is_hex_fingerprint() {
        let kp = TunnelKeypair::random();
        let h = kp.public_key().to_hash();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
