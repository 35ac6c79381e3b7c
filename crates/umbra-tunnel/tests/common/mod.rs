//! In-memory multi-peer test network.
//!
//! Wires several `TunnelCommunity` instances together through shared packet
//! queues so whole handshakes run synchronously, without sockets or a
//! runtime.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use umbra_crypto::identity::{PeerKey, TunnelKeypair};
use umbra_tunnel::community::TunnelCommunity;
use umbra_tunnel::external::{
    Candidate, DatagramSocket, Discovery, PacketSink, TunnelEvent, TunnelObserver, UdpBinder,
};
use umbra_tunnel::routing::CircuitState;
use umbra_tunnel::settings::TunnelSettings;

type Queues = Arc<Mutex<HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>>>;

/// A datagram emitted by a peer's exit socket: (circuit id, destination, body).
pub type EmittedDatagram = (u32, SocketAddrV4, Vec<u8>);

pub struct TestNet {
    queues: Queues,
    pub peers: HashMap<SocketAddr, TestPeer>,
}

pub struct TestPeer {
    pub addr: SocketAddr,
    pub public_key: PeerKey,
    pub community: TunnelCommunity,
    pub discovery: Arc<Mutex<Vec<Candidate>>>,
    pub events: Arc<Mutex<Vec<TunnelEvent>>>,
    pub incoming: Arc<Mutex<Vec<(u32, SocketAddrV4, Vec<u8>)>>>,
    pub dead: Arc<Mutex<Vec<u32>>>,
    pub exit_emitted: Arc<Mutex<Vec<EmittedDatagram>>>,
}

struct NetSink {
    queues: Queues,
    local: SocketAddr,
}

impl PacketSink for NetSink {
    fn send_to(&mut self, addr: SocketAddr, packet: &[u8]) {
        self.queues
            .lock().expect("lock")
            .entry(addr)
            .or_default()
            .push_back((self.local, packet.to_vec()));
    }
}

struct SharedDiscovery {
    candidates: Arc<Mutex<Vec<Candidate>>>,
}

impl Discovery for SharedDiscovery {
    fn verified_candidates(&self) -> Vec<Candidate> {
        self.candidates.lock().expect("lock").clone()
    }
}

struct RecordingObserver {
    events: Arc<Mutex<Vec<TunnelEvent>>>,
    incoming: Arc<Mutex<Vec<(u32, SocketAddrV4, Vec<u8>)>>>,
    dead: Arc<Mutex<Vec<u32>>>,
}

impl TunnelObserver for RecordingObserver {
    fn on_incoming_from_tunnel(&mut self, circuit_id: u32, origin: SocketAddrV4, data: &[u8]) {
        self.incoming
            .lock().expect("lock")
            .push((circuit_id, origin, data.to_vec()));
    }

    fn circuit_dead(&mut self, circuit_id: u32) {
        self.dead.lock().expect("lock").push(circuit_id);
    }

    fn on_event(&mut self, event: TunnelEvent) {
        self.events.lock().expect("lock").push(event);
    }
}

struct MemBinder {
    emitted: Arc<Mutex<Vec<EmittedDatagram>>>,
}

struct MemSocket {
    circuit_id: u32,
    emitted: Arc<Mutex<Vec<EmittedDatagram>>>,
}

impl DatagramSocket for MemSocket {
    fn send_to(&mut self, data: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.emitted
            .lock().expect("lock")
            .push((self.circuit_id, dest, data.to_vec()));
        Ok(data.len())
    }

    fn local_port(&self) -> u16 {
        50000
    }
}

impl UdpBinder for MemBinder {
    fn bind_ephemeral(&mut self, circuit_id: u32) -> io::Result<Box<dyn DatagramSocket>> {
        Ok(Box::new(MemSocket {
            circuit_id,
            emitted: self.emitted.clone(),
        }))
    }
}

impl TestNet {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            peers: HashMap::new(),
        }
    }

    /// Add a peer at `10.0.0.<octet>:4000` with the given settings.
    pub fn add_peer(&mut self, octet: u8, settings: TunnelSettings) -> SocketAddr {
        let addr: SocketAddr = format!("10.0.0.{octet}:4000").parse().expect("addr");
        let keypair = TunnelKeypair::random();
        let public_key = keypair.public_key();

        let discovery = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let incoming = Arc::new(Mutex::new(Vec::new()));
        let dead = Arc::new(Mutex::new(Vec::new()));
        let exit_emitted = Arc::new(Mutex::new(Vec::new()));

        let community = TunnelCommunity::new(
            settings,
            keypair,
            Box::new(SharedDiscovery {
                candidates: discovery.clone(),
            }),
            Box::new(NetSink {
                queues: self.queues.clone(),
                local: addr,
            }),
            Box::new(RecordingObserver {
                events: events.clone(),
                incoming: incoming.clone(),
                dead: dead.clone(),
            }),
            Box::new(MemBinder {
                emitted: exit_emitted.clone(),
            }),
        );

        self.peers.insert(
            addr,
            TestPeer {
                addr,
                public_key,
                community,
                discovery,
                events,
                incoming,
                dead,
                exit_emitted,
            },
        );
        addr
    }

    pub fn peer(&self, addr: SocketAddr) -> &TestPeer {
        &self.peers[&addr]
    }

    pub fn peer_mut(&mut self, addr: SocketAddr) -> &mut TestPeer {
        self.peers.get_mut(&addr).expect("peer")
    }

    /// The candidate descriptor other peers use to reach `addr`.
    pub fn candidate(&self, addr: SocketAddr) -> Candidate {
        let peer = self.peer(addr);
        Candidate {
            sock_addr: peer.addr,
            public_key: peer.public_key,
        }
    }

    /// Point `who`'s discovery at the given peers, in order.
    pub fn set_discovery(&mut self, who: SocketAddr, offered: &[SocketAddr]) {
        let candidates: Vec<Candidate> = offered.iter().map(|a| self.candidate(*a)).collect();
        *self.peer(who).discovery.lock().expect("lock") = candidates;
    }

    /// Deliver queued packets until the network is quiet.
    pub fn deliver_all(&mut self) {
        loop {
            let next = {
                let mut queues = self.queues.lock().expect("lock");
                let addr = queues
                    .iter()
                    .find(|(_, q)| !q.is_empty())
                    .map(|(addr, _)| *addr);
                addr.and_then(|a| queues.get_mut(&a)?.pop_front().map(|p| (a, p)))
            };
            let Some((to, (from, packet))) = next else {
                break;
            };
            if let Some(peer) = self.peers.get_mut(&to) {
                peer.community.handle_packet(from, &packet);
            }
        }
    }

    /// Silently discard everything currently queued.
    pub fn drop_queued(&mut self) {
        self.queues.lock().expect("lock").clear();
    }
}

/// Table invariants that must hold at every quiescent point.
pub fn assert_invariants(peer: &TestPeer) {
    let community = &peer.community;
    for cid in community.circuits().keys() {
        assert!(
            !community.relay_routes().contains_key(cid),
            "own circuit {cid} also appears as relayed"
        );
    }
    for cid in community.waiting_for() {
        assert!(
            community.circuits().contains_key(cid) || community.relay_routes().contains_key(cid),
            "waiting_for {cid} has no backing entry"
        );
    }
    for (cid, slot) in community.exit_sockets() {
        if slot.is_some() {
            assert!(
                community.has_session_keys(*cid),
                "exit socket {cid} without session keys"
            );
            assert!(
                !community.relay_routes().contains_key(cid),
                "exit socket {cid} also relayed"
            );
        }
    }
    for cid in community.active_circuits() {
        let circuit = &community.circuits()[&cid];
        assert_eq!(circuit.state, CircuitState::Ready);
        assert_eq!(circuit.hops.len(), circuit.goal_hops);
    }
}

/// A payload the exit's µTP sniff accepts.
pub fn utp_payload(filler: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; 20];
    payload[0] = 0x01; // ST_DATA, version 1
    payload.extend_from_slice(filler);
    payload
}
