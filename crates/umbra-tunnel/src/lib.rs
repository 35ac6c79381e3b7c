//! # umbra-tunnel
//!
//! Onion-routing overlay core: builds fixed-length anonymizing circuits over
//! UDP between gossip-discovered peers and relays µTP-framed datagrams from a
//! local front-end through those circuits to arbitrary destinations.
//!
//! Every peer plays three roles at once, decided per circuit id:
//! *originator* (built the circuit, proxies its own traffic), *relay*
//! (re-encrypts and forwards cells in both directions), and *exit* (emits
//! plaintext UDP and funnels return traffic back).
//!
//! - [`community`] - the single-owner state machine tying everything together
//! - [`routing`] - per-circuit state and in-memory routing tables
//! - [`cache`] - pending-operation records with deadline-driven timeouts
//! - [`exit`] - per-circuit exit sockets with abuse counters
//! - [`selection`] - round-robin circuit selection for user traffic
//! - [`settings`] - the configuration surface
//! - [`external`] - collaborator traits (discovery, packet I/O, front-end)
//! - [`driver`] - the tokio reactor owning the community
//!
//! All core state lives on one reactor task; the community itself is
//! synchronous and lock-free, which is what keeps the table invariants
//! trivial between suspension points.

pub mod cache;
pub mod community;
pub mod driver;
pub mod exit;
pub mod external;
pub mod routing;
pub mod selection;
pub mod settings;

pub use community::TunnelCommunity;
pub use external::{Candidate, Discovery, PacketSink, TunnelEvent, TunnelObserver};
pub use settings::TunnelSettings;

/// Error types for tunnel operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// A cryptographic operation failed.
    #[error(transparent)]
    Crypto(#[from] umbra_crypto::CryptoError),

    /// A wire codec operation failed.
    #[error(transparent)]
    Wire(#[from] umbra_wire::WireError),

    /// The referenced circuit is not in any table.
    #[error("unknown circuit {0}")]
    UnknownCircuit(u32),

    /// No verified candidate was usable for the requested operation.
    #[error("no usable candidate: {0}")]
    NoCandidate(&'static str),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
