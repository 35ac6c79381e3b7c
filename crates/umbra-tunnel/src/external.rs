//! Collaborator interfaces.
//!
//! The core never talks to the outside world directly: candidate discovery,
//! raw packet emission, exit-socket binding, and front-end callbacks all go
//! through these traits. The reactor driver supplies real implementations;
//! tests supply in-memory ones.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use umbra_crypto::identity::PeerKey;

/// A verified peer offered by the gossip substrate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub sock_addr: SocketAddr,
    pub public_key: PeerKey,
}

/// Walker behavior the community requests from its discovery substrate at
/// registration time.
#[derive(Clone, Copy, Debug)]
pub struct WalkerCaps {
    /// Walk candidates aggressively so fresh verified peers arrive quickly.
    pub fast_walker: bool,
    /// Bulk bloom-filter synchronization; the tunnel community has no use
    /// for historic messages.
    pub bloom_sync: bool,
}

/// The gossip/peer-discovery substrate.
pub trait Discovery: Send {
    /// Currently known verified candidates, in walker order.
    fn verified_candidates(&self) -> Vec<Candidate>;

    /// Called once at community construction.
    fn configure(&mut self, _caps: WalkerCaps) {}
}

/// Outbound packet emission toward peers.
pub trait PacketSink: Send {
    fn send_to(&mut self, addr: SocketAddr, packet: &[u8]);
}

/// Lifecycle notifications surfaced to the embedding application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The first hop of an own circuit confirmed.
    CircuitCreated { circuit_id: u32 },
    /// A later hop of an own circuit confirmed.
    CircuitExtended { circuit_id: u32, hops: usize },
    /// An own circuit reached its goal length.
    CircuitReady { circuit_id: u32 },
    /// This peer answered a `create` and joined a foreign circuit.
    JoinedCircuit { circuit_id: u32, inbound: SocketAddr },
    /// Enough circuits are ready for an anonymous session; fired once.
    SessionReady,
}

/// Callbacks into the SOCKS5 front-end (or any other traffic source).
pub trait TunnelObserver: Send {
    /// Return traffic arriving from the tunnel for this peer's own circuit.
    fn on_incoming_from_tunnel(&mut self, _circuit_id: u32, _origin: SocketAddrV4, _data: &[u8]) {}

    /// A circuit the front-end may have been using is gone.
    fn circuit_dead(&mut self, _circuit_id: u32) {}

    /// Lifecycle notification.
    fn on_event(&mut self, _event: TunnelEvent) {}
}

/// An observer that ignores everything.
pub struct NullObserver;

impl TunnelObserver for NullObserver {}

/// One bound exit-side UDP socket.
pub trait DatagramSocket: Send {
    /// Emit a plaintext datagram to the destination.
    fn send_to(&mut self, data: &[u8], dest: SocketAddrV4) -> io::Result<usize>;

    /// The ephemeral local port this socket listens on.
    fn local_port(&self) -> u16;
}

/// Binds exit sockets on demand.
///
/// The driver's implementation binds a real ephemeral UDP socket and pumps
/// received datagrams back into the reactor; received traffic reaches the
/// community through `on_exit_datagram`, never through this trait.
pub trait UdpBinder: Send {
    fn bind_ephemeral(&mut self, circuit_id: u32) -> io::Result<Box<dyn DatagramSocket>>;
}
