//! # umbra-wire
//!
//! Bit-exact wire codec for umbra tunnel cells.
//!
//! Every packet on a circuit is a *cell*: a small plaintext header carrying
//! the circuit id and kind discriminator, followed by an encrypted tail. The
//! header stays readable at every hop so relays can route in constant work
//! per packet; the tail gains or loses one onion layer per hop.
//!
//! - [`cell`] — control-plane framing, split/swap/peek operations
//! - [`data`] — data-plane framing with destination/origin addressing
//! - [`messages`] — typed payloads for the control-plane kinds

pub mod cell;
pub mod data;
pub mod messages;

/// Error types for wire encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Packet shorter than its fixed header.
    #[error("truncated packet: {got} bytes, need {needed}")]
    Truncated { needed: usize, got: usize },

    /// Control-plane magic bytes missing.
    #[error("bad cell magic")]
    BadMagic,

    /// Data-plane prefix missing.
    #[error("bad data prefix")]
    BadPrefix,

    /// Unknown message kind discriminator.
    #[error("unknown cell kind {0}")]
    UnknownKind(u8),

    /// Circuit id in the packet does not match the expected id.
    #[error("circuit id mismatch: expected {expected}, found {found}")]
    CircuitIdMismatch { expected: u32, found: u32 },

    /// Malformed message body.
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload {
        kind: &'static str,
        reason: &'static str,
    },

    /// Data cells address IPv4 endpoints only.
    #[error("unsupported address family")]
    UnsupportedAddress,
}

pub type Result<T> = std::result::Result<T, WireError>;
