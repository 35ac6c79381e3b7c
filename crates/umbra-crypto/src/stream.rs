//! Nonce-prefixed ChaCha20-Poly1305 cell-layer cipher.
//!
//! One onion layer is one call to [`encrypt_str`] or [`decrypt_str`]. Each
//! layer draws a fresh random 12-byte nonce and prepends it to the
//! ciphertext, giving a predictable [`LAYER_OVERHEAD`]-byte growth per wrap
//! so the originator can size payloads for the full circuit depth.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use crate::{CryptoError, Result};

/// Nonce length prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Byte growth of one encryption layer.
pub const LAYER_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Encrypt one layer: `nonce || ciphertext || tag`.
pub fn encrypt_str(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::AeadDecryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt one layer produced by [`encrypt_str`].
pub fn decrypt_str(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < LAYER_OVERHEAD {
        return Err(CryptoError::InvalidInput(format!(
            "ciphertext too short: {} bytes, need at least {LAYER_OVERHEAD}",
            data.len()
        )));
    }
    let (nonce, ct) = data.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| CryptoError::AeadDecryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = [0x42u8; 32];
        let ct = encrypt_str(&key, b"cell payload").expect("encrypt");
        let pt = decrypt_str(&key, &ct).expect("decrypt");
        assert_eq!(pt, b"cell payload");
    }

    #[test]
    fn test_layer_overhead() {
        let key = [0x42u8; 32];
        let ct = encrypt_str(&key, &[0u8; 100]).expect("encrypt");
        assert_eq!(ct.len(), 100 + LAYER_OVERHEAD);
    }

    #[test]
    fn test_layers_compose() {
        // Onion wrap twice, peel twice.
        let k1 = [0x01u8; 32];
        let k2 = [0x02u8; 32];
        let inner = encrypt_str(&k2, b"payload").expect("wrap inner");
        let outer = encrypt_str(&k1, &inner).expect("wrap outer");

        let peeled = decrypt_str(&k1, &outer).expect("peel outer");
        let plain = decrypt_str(&k2, &peeled).expect("peel inner");
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let ct = encrypt_str(&[0x01u8; 32], b"data").expect("encrypt");
        assert!(decrypt_str(&[0x02u8; 32], &ct).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0x01u8; 32];
        let mut ct = encrypt_str(&key, b"data").expect("encrypt");
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(decrypt_str(&key, &ct).is_err());
    }

    #[test]
    fn test_short_input_rejected() {
        assert!(decrypt_str(&[0u8; 32], &[0u8; 5]).is_err());
    }
}
