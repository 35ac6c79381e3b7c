//! ECIES-X25519-ChaCha20-BLAKE3 one-shot encryption.
//!
//! Used exclusively to deliver the originator's DH public share to a hop's
//! long-term key inside `create` and `extend`. Every subsequent cell layer
//! uses the symmetric [`stream`](crate::stream) cipher instead.
//!
//! ## Algorithm
//!
//! ```text
//! Encrypt(recipient_pk, plaintext):
//!   1. eph_sk, eph_pk = fresh X25519 keypair
//!   2. ss = X25519(eph_sk, recipient_pk)
//!   3. key = BLAKE3::derive_key("Umbra v1 ecies-encryption-key",
//!            ss || eph_pk || recipient_pk)
//!   4. nonce = BLAKE3::derive_key("Umbra v1 ecies-nonce", ss || eph_pk)[:12]
//!   5. return eph_pk || ChaCha20-Poly1305(key, nonce, plaintext, aad=eph_pk)
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::identity::{PeerKey, TunnelKeypair};
use crate::kdf::{self, contexts};
use crate::{CryptoError, Result};

/// Poly1305 tag length appended to the ciphertext.
const TAG_LEN: usize = 16;

/// Byte overhead of a hybrid blob over its plaintext.
pub const HYBRID_OVERHEAD: usize = 32 + TAG_LEN;

/// Encrypt a small plaintext to a peer's long-term public key.
pub fn hybrid_encrypt(recipient: &PeerKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let eph_secret = StaticSecret::random_from_rng(OsRng);
    let eph_pk = PublicKey::from(&eph_secret).to_bytes();
    let shared = eph_secret.diffie_hellman(&PublicKey::from(*recipient.as_bytes()));

    let (key, nonce) = derive_key_nonce(shared.as_bytes(), &eph_pk, recipient.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &eph_pk,
            },
        )
        .map_err(|_| CryptoError::Ecies("encryption failed".into()))?;

    let mut out = Vec::with_capacity(32 + ct.len());
    out.extend_from_slice(&eph_pk);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt a hybrid blob with this peer's long-term keypair.
pub fn hybrid_decrypt(keypair: &TunnelKeypair, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < HYBRID_OVERHEAD {
        return Err(CryptoError::Ecies(format!(
            "blob too short: {} bytes, need at least {HYBRID_OVERHEAD}",
            blob.len()
        )));
    }
    let mut eph_pk = [0u8; 32];
    eph_pk.copy_from_slice(&blob[..32]);

    let eph_key = PeerKey::from_bytes(eph_pk);
    let shared = keypair.diffie_hellman(&eph_key);
    let recipient_pk = keypair.public_key();

    let (key, nonce) = derive_key_nonce(shared.as_bytes(), &eph_pk, recipient_pk.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &blob[32..],
                aad: &eph_pk,
            },
        )
        .map_err(|_| CryptoError::AeadDecryption)
}

fn derive_key_nonce(
    shared: &[u8; 32],
    eph_pk: &[u8; 32],
    recipient_pk: &[u8; 32],
) -> ([u8; 32], [u8; 12]) {
    let mut key_material = Vec::with_capacity(32 + 32 + 32);
    key_material.extend_from_slice(shared);
    key_material.extend_from_slice(eph_pk);
    key_material.extend_from_slice(recipient_pk);
    let key = kdf::derive_key(contexts::ECIES_ENCRYPTION_KEY, &key_material);

    let mut nonce_material = Vec::with_capacity(32 + 32);
    nonce_material.extend_from_slice(shared);
    nonce_material.extend_from_slice(eph_pk);
    let nonce_full = kdf::derive_key(contexts::ECIES_NONCE, &nonce_material);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&nonce_full[..12]);

    (key, nonce)
}
