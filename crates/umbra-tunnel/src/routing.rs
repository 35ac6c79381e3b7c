//! Per-circuit state and the entities the routing tables index.

use std::net::SocketAddr;
use std::time::Instant;

use umbra_crypto::exchange::{DiffieSecret, SessionKeys};
use umbra_crypto::identity::PeerKey;

/// Originator-side circuit lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Still telescoping toward its goal length.
    Extending,
    /// Fully built; eligible for user traffic and pings.
    Ready,
    /// Torn down; the entry leaves the table immediately after.
    Broken,
}

/// A confirmed hop: the peer's long-term key and the session keys derived
/// from its DH exchange.
pub struct Hop {
    pub public_key: PeerKey,
    pub session_keys: SessionKeys,
}

/// A hop whose DH exchange is still in flight. The ephemeral secret lives
/// only here and is zeroized when the hop is promoted or the circuit dies.
pub struct UnverifiedHop {
    pub public_key: PeerKey,
    pub dh_secret: DiffieSecret,
}

/// An own circuit, keyed by its first-link circuit id.
pub struct Circuit {
    pub circuit_id: u32,
    pub goal_hops: usize,
    /// Socket address of the adjacent peer; all cells for this circuit go
    /// there regardless of eventual length.
    pub first_hop: SocketAddr,
    pub hops: Vec<Hop>,
    pub unverified_hop: Option<UnverifiedHop>,
    pub state: CircuitState,
    pub creation_time: Instant,
    pub last_incoming: Instant,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl Circuit {
    pub fn new(circuit_id: u32, goal_hops: usize, first_hop: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            circuit_id,
            goal_hops,
            first_hop,
            hops: Vec::with_capacity(goal_hops),
            unverified_hop: None,
            state: CircuitState::Extending,
            creation_time: now,
            last_incoming: now,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// Promote a confirmed hop; flips to [`CircuitState::Ready`] when the
    /// goal length is reached.
    pub fn add_hop(&mut self, hop: Hop) {
        self.hops.push(hop);
        if self.hops.len() == self.goal_hops {
            self.state = CircuitState::Ready;
        }
    }

    /// Refresh the liveness timestamp on any incoming cell.
    pub fn beat_heart(&mut self) {
        self.last_incoming = Instant::now();
    }
}

/// One direction of a relayed circuit at a middle hop.
///
/// Every relayed circuit appears as two mirrored entries, each naming the
/// *other* link's circuit id and socket address. The pair shares one set of
/// session keys but each side keeps its own liveness clock, so one side can
/// be evicted alone and the other will follow on its own timer.
pub struct RelayRoute {
    /// Circuit id on the partner link.
    pub circuit_id: u32,
    /// Where to forward: the partner link's peer.
    pub sock_addr: SocketAddr,
    pub bytes_relayed: u64,
    pub creation_time: Instant,
    pub last_incoming: Instant,
}

impl RelayRoute {
    pub fn new(circuit_id: u32, sock_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            circuit_id,
            sock_addr,
            bytes_relayed: 0,
            creation_time: now,
            last_incoming: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_crypto::exchange::{generate_diffie_secret, generate_session_keys};

    fn test_addr() -> SocketAddr {
        "10.0.0.1:4000".parse().expect("addr")
    }

    fn test_hop() -> Hop {
        let (secret, _) = generate_diffie_secret();
        let (_, share) = generate_diffie_secret();
        Hop {
            public_key: PeerKey::from_bytes([1; 32]),
            session_keys: generate_session_keys(&secret, &share),
        }
    }

    #[test]
    fn test_new_circuit_is_extending() {
        let c = Circuit::new(7, 3, test_addr());
        assert_eq!(c.state, CircuitState::Extending);
        assert!(c.hops.is_empty());
        assert!(c.unverified_hop.is_none());
    }

    #[test]
    fn test_circuit_ready_at_goal_hops() {
        let mut c = Circuit::new(7, 2, test_addr());
        c.add_hop(test_hop());
        assert_eq!(c.state, CircuitState::Extending);
        c.add_hop(test_hop());
        assert_eq!(c.state, CircuitState::Ready);
    }

    #[test]
    fn test_beat_heart_advances() {
        let mut c = Circuit::new(7, 1, test_addr());
        let before = c.last_incoming;
        std::thread::sleep(std::time::Duration::from_millis(5));
        c.beat_heart();
        assert!(c.last_incoming > before);
    }

    #[test]
    fn test_relay_route_points_at_partner() {
        let r = RelayRoute::new(99, test_addr());
        assert_eq!(r.circuit_id, 99);
        assert_eq!(r.bytes_relayed, 0);
    }
}
