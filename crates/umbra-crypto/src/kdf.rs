//! Domain-separated BLAKE3 key derivation for the umbra protocol.
//!
//! Every derived key binds a registered context string so that keys from
//! different protocol roles can never collide. Using an unregistered context
//! string is a protocol violation.

/// All registered BLAKE3 context strings of the umbra tunnel protocol.
pub mod contexts {
    /// Session sub-key applied to cells travelling originator → endpoint.
    pub const SESSION_ORIGINATOR_KEY: &str = "Umbra v1 session-originator-key";
    /// Session sub-key applied to cells travelling endpoint → originator.
    pub const SESSION_ENDPOINT_KEY: &str = "Umbra v1 session-endpoint-key";
    /// ECIES content-encryption key.
    pub const ECIES_ENCRYPTION_KEY: &str = "Umbra v1 ecies-encryption-key";
    /// ECIES nonce (first 12 bytes of the derived key).
    pub const ECIES_NONCE: &str = "Umbra v1 ecies-nonce";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        SESSION_ORIGINATOR_KEY,
        SESSION_ENDPOINT_KEY,
        ECIES_ENCRYPTION_KEY,
        ECIES_NONCE,
    ];
}

/// Compute the BLAKE3 hash of the input data.
///
/// Used for peer-key fingerprints and general-purpose hashing.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a 32-byte key using BLAKE3's built-in key-derivation mode.
///
/// The context must be one of the registered strings in [`contexts`].
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

/// Verify that a context string is registered in the umbra protocol.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_have_protocol_prefix() {
        for ctx in contexts::ALL_CONTEXTS {
            assert!(
                ctx.starts_with("Umbra v1 "),
                "context string '{ctx}' has wrong prefix"
            );
        }
    }

    #[test]
    fn test_derive_key_deterministic() {
        let k1 = derive_key(contexts::SESSION_ORIGINATOR_KEY, &[0x42u8; 32]);
        let k2 = derive_key(contexts::SESSION_ORIGINATOR_KEY, &[0x42u8; 32]);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_derive_key_different_contexts() {
        let k1 = derive_key(contexts::SESSION_ORIGINATOR_KEY, &[0x42u8; 32]);
        let k2 = derive_key(contexts::SESSION_ENDPOINT_KEY, &[0x42u8; 32]);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_hash_different_inputs() {
        assert_ne!(hash(b"input1"), hash(b"input2"));
    }

    #[test]
    fn test_is_registered_context() {
        assert!(is_registered_context("Umbra v1 ecies-nonce"));
        assert!(!is_registered_context("Umbra v1 made-up-context"));
    }
}
