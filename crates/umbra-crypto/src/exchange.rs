//! Diffie-Hellman ephemerals and direction-keyed session keys.
//!
//! Each hop of a circuit runs one X25519 exchange with the originator. From
//! the shared secret two independent 32-byte sub-keys are derived, one per
//! traffic direction, so that the two directions of a circuit never share a
//! cipher state.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::kdf::{self, contexts};

/// Which of the two session sub-keys a cryptographic step uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Traffic flowing away from the circuit originator.
    Originator,
    /// Traffic flowing back toward the circuit originator.
    Endpoint,
}

/// An ephemeral Diffie-Hellman secret, held only while a hop is unverified.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct DiffieSecret {
    bytes: [u8; 32],
}

/// The two direction-separated symmetric keys of one circuit hop.
#[derive(Clone)]
pub struct SessionKeys {
    originator: [u8; 32],
    endpoint: [u8; 32],
}

/// Generate a fresh DH ephemeral.
///
/// Returns the secret and the public share serialized for the wire.
pub fn generate_diffie_secret() -> (DiffieSecret, [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    (
        DiffieSecret {
            bytes: secret.to_bytes(),
        },
        public,
    )
}

/// Derive the direction-separated session keys from a completed exchange.
pub fn generate_session_keys(secret: &DiffieSecret, remote_share: &[u8; 32]) -> SessionKeys {
    let sk = StaticSecret::from(secret.bytes);
    let shared = sk.diffie_hellman(&PublicKey::from(*remote_share));
    SessionKeys {
        originator: kdf::derive_key(contexts::SESSION_ORIGINATOR_KEY, shared.as_bytes()),
        endpoint: kdf::derive_key(contexts::SESSION_ENDPOINT_KEY, shared.as_bytes()),
    }
}

impl SessionKeys {
    /// The sub-key for the given direction.
    pub fn key(&self, direction: Direction) -> &[u8; 32] {
        match direction {
            Direction::Originator => &self.originator,
            Direction::Endpoint => &self.endpoint,
        }
    }
}
