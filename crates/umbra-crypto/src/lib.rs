//! # umbra-crypto
//!
//! Cryptographic primitives for the umbra tunnel protocol.
//!
//! The cipher suite is fixed — no algorithm negotiation. Long-term peer
//! identities and handshake ephemerals are X25519 keys; cell layers are
//! ChaCha20-Poly1305; all key derivation is domain-separated BLAKE3.
//!
//! ## Modules
//!
//! - [`kdf`] — Domain-separated BLAKE3 key derivation (registered contexts)
//! - [`identity`] — Long-term X25519 peer identity and key parsing
//! - [`exchange`] — Diffie-Hellman ephemerals and direction-keyed session keys
//! - [`hybrid`] — ECIES-X25519-ChaCha20-BLAKE3 one-shot encryption
//! - [`stream`] — Nonce-prefixed ChaCha20-Poly1305 cell-layer cipher

pub mod exchange;
pub mod hybrid;
pub mod identity;
pub mod kdf;
pub mod stream;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// ECIES encryption/decryption failed.
    #[error("ECIES error: {0}")]
    Ecies(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No key material is known for the requested circuit.
    #[error("no key material for circuit {0}")]
    UnknownCircuit(u32),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CryptoError::InvalidKeyLength {
            expected: 32,
            actual: 20,
        };
        assert!(err.to_string().contains("expected 32"));
        assert!(err.to_string().contains("got 20"));
    }
}
