//! The tunnel community: one synchronous state machine owning every routing
//! table, driven from a single reactor task.
//!
//! Incoming packets flow through one classifier: a circuit id is either
//! *relayed* (forward after a single crypto layer), *ours* (peel all layers
//! and dispatch), or *exit-bound* (final decryption, plaintext UDP out).
//! The classification is deterministic at every point in time — a circuit id
//! is never both relayed and ours at the same peer.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use umbra_crypto::exchange::{
    generate_diffie_secret, generate_session_keys, Direction, SessionKeys,
};
use umbra_crypto::identity::{PeerKey, TunnelKeypair};
use umbra_crypto::{hybrid, stream, CryptoError};
use umbra_wire::cell;
use umbra_wire::data::{self, ZERO_ADDR};
use umbra_wire::messages::{
    self, CreatePayload, CreatedPayload, ExtendPayload, ExtendedPayload, PingPayload,
    TunnelMessage,
};

use crate::cache::{CacheEntry, CacheKind, RequestCache};
use crate::exit::{ExitSocket, ExitVerdict};
use crate::external::{
    Candidate, Discovery, PacketSink, TunnelEvent, TunnelObserver, UdpBinder, WalkerCaps,
};
use crate::routing::{Circuit, CircuitState, Hop, RelayRoute, UnverifiedHop};
use crate::selection::RoundRobin;
use crate::settings::TunnelSettings;
use crate::Result;

/// How long an outbound circuit build may sit without progress.
const CIRCUIT_BUILD_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an answered `create` waits for its `extend`. Expiry is a no-op;
/// the relay is swept by inactivity anyway.
const CREATED_CACHE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-kind message counters, queryable by the embedding application.
#[derive(Default)]
pub struct TunnelStats {
    outgoing: HashMap<&'static str, u64>,
    incoming: HashMap<&'static str, u64>,
}

impl TunnelStats {
    fn count_out(&mut self, kind: &'static str) {
        *self.outgoing.entry(kind).or_insert(0) += 1;
    }

    fn count_in(&mut self, kind: &'static str) {
        *self.incoming.entry(kind).or_insert(0) += 1;
    }

    pub fn outgoing(&self, kind: &str) -> u64 {
        self.outgoing.get(kind).copied().unwrap_or(0)
    }

    pub fn incoming(&self, kind: &str) -> u64 {
        self.incoming.get(kind).copied().unwrap_or(0)
    }
}

/// Which framing a packet uses; relays handle both identically apart from
/// the header layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Plane {
    Cell,
    Data,
}

impl Plane {
    fn split(self, packet: &[u8]) -> umbra_wire::Result<(&[u8], &[u8])> {
        match self {
            Self::Cell => cell::split_encrypted_packet(packet),
            Self::Data => data::split_encrypted_packet(packet),
        }
    }

    fn swap(self, packet: &mut [u8], from: u32, to: u32) -> umbra_wire::Result<()> {
        match self {
            Self::Cell => cell::swap_circuit_id(packet, from, to),
            Self::Data => data::swap_circuit_id(packet, from, to),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Cell => "cell",
            Self::Data => "data",
        }
    }
}

pub struct TunnelCommunity {
    settings: TunnelSettings,
    keypair: TunnelKeypair,

    circuits: HashMap<u32, Circuit>,
    directions: HashMap<u32, Direction>,
    relay_from_to: HashMap<u32, RelayRoute>,
    relay_session_keys: HashMap<u32, SessionKeys>,
    waiting_for: HashSet<u32>,
    exit_sockets: HashMap<u32, Option<ExitSocket>>,
    request_cache: RequestCache,

    selection: RoundRobin,
    stats: TunnelStats,
    made_anon_session: bool,

    discovery: Box<dyn Discovery>,
    sink: Box<dyn PacketSink>,
    observer: Box<dyn TunnelObserver>,
    binder: Box<dyn UdpBinder>,
}

impl TunnelCommunity {
    pub fn new(
        settings: TunnelSettings,
        keypair: TunnelKeypair,
        mut discovery: Box<dyn Discovery>,
        sink: Box<dyn PacketSink>,
        observer: Box<dyn TunnelObserver>,
        binder: Box<dyn UdpBinder>,
    ) -> Self {
        discovery.configure(WalkerCaps {
            fast_walker: true,
            bloom_sync: false,
        });
        Self {
            settings,
            keypair,
            circuits: HashMap::new(),
            directions: HashMap::new(),
            relay_from_to: HashMap::new(),
            relay_session_keys: HashMap::new(),
            waiting_for: HashSet::new(),
            exit_sockets: HashMap::new(),
            request_cache: RequestCache::new(),
            selection: RoundRobin::new(),
            stats: TunnelStats::default(),
            made_anon_session: false,
            discovery,
            sink,
            observer,
            binder,
        }
    }

    pub fn public_key(&self) -> PeerKey {
        self.keypair.public_key()
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    pub fn circuits(&self) -> &HashMap<u32, Circuit> {
        &self.circuits
    }

    pub fn circuit_mut(&mut self, circuit_id: u32) -> Option<&mut Circuit> {
        self.circuits.get_mut(&circuit_id)
    }

    pub fn relay_routes(&self) -> &HashMap<u32, RelayRoute> {
        &self.relay_from_to
    }

    pub fn relay_route_mut(&mut self, circuit_id: u32) -> Option<&mut RelayRoute> {
        self.relay_from_to.get_mut(&circuit_id)
    }

    pub fn exit_sockets(&self) -> &HashMap<u32, Option<ExitSocket>> {
        &self.exit_sockets
    }

    pub fn exit_socket_mut(&mut self, circuit_id: u32) -> Option<&mut Option<ExitSocket>> {
        self.exit_sockets.get_mut(&circuit_id)
    }

    pub fn waiting_for(&self) -> &HashSet<u32> {
        &self.waiting_for
    }

    pub fn directions(&self) -> &HashMap<u32, Direction> {
        &self.directions
    }

    /// Whether this peer holds relay session keys for the circuit id, i.e.
    /// participated in the `create` on that link.
    pub fn has_session_keys(&self, circuit_id: u32) -> bool {
        self.relay_session_keys.contains_key(&circuit_id)
    }

    pub fn request_cache(&self) -> &RequestCache {
        &self.request_cache
    }

    /// Ready circuit ids, sorted. Only these carry user traffic or pings.
    pub fn active_circuits(&self) -> Vec<u32> {
        let mut ready: Vec<u32> = self
            .circuits
            .iter()
            .filter(|(_, c)| c.state == CircuitState::Ready)
            .map(|(cid, _)| *cid)
            .collect();
        ready.sort_unstable();
        ready
    }

    /// Round-robin pick for the next outgoing user datagram.
    pub fn select_circuit(&mut self) -> Option<u32> {
        let ready = self.active_circuits();
        self.selection.select(&ready)
    }

    /// Deterministic relay classification: the id is relayed here, and not a
    /// link we are ourselves waiting on a `created` for.
    pub fn is_relay(&self, circuit_id: u32) -> bool {
        circuit_id != 0
            && self.relay_from_to.contains_key(&circuit_id)
            && !self.waiting_for.contains(&circuit_id)
    }

    // ------------------------------------------------------------------
    // Packet entry points
    // ------------------------------------------------------------------

    /// Entry point for every raw datagram received from a peer.
    pub fn handle_packet(&mut self, from: SocketAddr, packet: &[u8]) {
        if data::is_data_packet(packet) {
            self.on_data(from, packet);
        } else {
            self.on_cell(from, packet);
        }
    }

    fn on_cell(&mut self, from: SocketAddr, packet: &[u8]) {
        let circuit_id = match cell::get_circuit_id(packet) {
            Ok(cid) => cid,
            Err(e) => {
                debug!("dropping malformed cell from {from}: {e}");
                return;
            }
        };
        if self.relay_packet(Plane::Cell, circuit_id, packet) {
            return;
        }

        let kind = match cell::get_kind(packet) {
            Ok(kind) => kind,
            Err(e) => {
                debug!("dropping cell with unknown kind from {from}: {e}");
                return;
            }
        };
        debug!("got {} ({circuit_id}) from {from}", kind.name());

        let message = if kind.is_handshake() {
            match messages::convert_from_cell(packet) {
                Ok(m) => m,
                Err(e) => {
                    warn!("dropping malformed {} cell: {e}", kind.name());
                    return;
                }
            }
        } else {
            let (plaintext, encrypted) = match Plane::Cell.split(packet) {
                Ok(parts) => parts,
                Err(e) => {
                    debug!("dropping unsplittable cell: {e}");
                    return;
                }
            };
            let decrypted = match self.crypto_in(circuit_id, encrypted) {
                Ok(d) => d,
                Err(e) => {
                    error!("cell crypto failed for circuit {circuit_id}: {e}");
                    return;
                }
            };
            let mut full = Vec::with_capacity(plaintext.len() + decrypted.len());
            full.extend_from_slice(plaintext);
            full.extend_from_slice(&decrypted);
            match messages::convert_from_cell(&full) {
                Ok(m) => m,
                Err(e) => {
                    warn!("dropping malformed {} cell: {e}", kind.name());
                    return;
                }
            }
        };
        self.stats.count_in(kind.name());

        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            circuit.beat_heart();
            circuit.bytes_down += packet.len() as u64;
        }

        match message {
            TunnelMessage::Create(p) => self.on_create(from, p),
            TunnelMessage::Created(p) => self.on_created(from, p),
            TunnelMessage::Extend(p) => self.on_extend(from, p),
            TunnelMessage::Extended(p) => self.on_extended(from, p),
            TunnelMessage::Ping(p) => self.on_ping(from, p),
            TunnelMessage::Pong(p) => self.on_pong(from, p),
        }
    }

    fn on_data(&mut self, from: SocketAddr, packet: &[u8]) {
        let circuit_id = match data::get_circuit_id(packet) {
            Ok(cid) => cid,
            Err(e) => {
                debug!("dropping malformed data packet from {from}: {e}");
                return;
            }
        };
        debug!("got data ({circuit_id}) from {from}");

        if self.relay_packet(Plane::Data, circuit_id, packet) {
            return;
        }

        let (plaintext, encrypted) = match Plane::Data.split(packet) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("dropping unsplittable data packet: {e}");
                return;
            }
        };
        let decrypted = match self.crypto_in(circuit_id, encrypted) {
            Ok(d) => d,
            Err(e) => {
                error!("data crypto failed for circuit {circuit_id}: {e}");
                return;
            }
        };
        let mut full = Vec::with_capacity(plaintext.len() + decrypted.len());
        full.extend_from_slice(plaintext);
        full.extend_from_slice(&decrypted);

        let (destination, origin, payload) = match data::decode_data(&full) {
            Ok(dp) => (dp.destination, dp.origin, dp.payload.to_vec()),
            Err(e) => {
                warn!("dropping undecodable data packet: {e}");
                return;
            }
        };
        self.stats.count_in("data");

        let ours = self
            .circuits
            .get(&circuit_id)
            .is_some_and(|c| origin != ZERO_ADDR && from == c.first_hop);
        if ours {
            if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
                circuit.beat_heart();
                circuit.bytes_down += full.len() as u64;
            }
            self.observer
                .on_incoming_from_tunnel(circuit_id, origin, &payload);
        } else if destination != ZERO_ADDR {
            debug!("data for circuit {circuit_id} exiting tunnel ({destination})");
            self.exit_data(circuit_id, from, destination, &payload);
        } else {
            error!("cannot exit data, destination is 0.0.0.0:0");
        }
    }

    // ------------------------------------------------------------------
    // Relay path
    // ------------------------------------------------------------------

    /// Forward a packet classified as relay traffic: one crypto layer, rewrite
    /// the circuit id, pass it to the partner link. Returns `false` when the
    /// id is not relayed here and the own-circuit path should run.
    fn relay_packet(&mut self, plane: Plane, circuit_id: u32, packet: &[u8]) -> bool {
        if !self.is_relay(circuit_id) {
            return false;
        }
        let Some(next) = self.relay_from_to.get(&circuit_id) else {
            return false;
        };
        let next_circuit_id = next.circuit_id;
        let next_addr = next.sock_addr;

        if let Some(this_relay) = self.relay_from_to.get_mut(&next_circuit_id) {
            this_relay.last_incoming = Instant::now();
        }

        let (plaintext, encrypted) = match plane.split(packet) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("dropping unsplittable relay packet on {circuit_id}: {e}");
                return true;
            }
        };
        let relayed = match self.crypto_relay(circuit_id, encrypted) {
            Ok(r) => r,
            Err(e) => {
                error!("relay crypto failed on circuit {circuit_id}: {e}");
                return true;
            }
        };

        let mut out = Vec::with_capacity(plaintext.len() + relayed.len());
        out.extend_from_slice(plaintext);
        out.extend_from_slice(&relayed);
        if let Err(e) = plane.swap(&mut out, circuit_id, next_circuit_id) {
            debug!("dropping relay packet on {circuit_id}: {e}");
            return true;
        }

        let sent = self.send_packet(next_addr, plane.name(), &out);
        if let Some(this_relay) = self.relay_from_to.get_mut(&next_circuit_id) {
            this_relay.bytes_relayed += sent as u64;
        }
        true
    }

    // ------------------------------------------------------------------
    // Handshake handlers
    // ------------------------------------------------------------------

    fn on_create(&mut self, from: SocketAddr, payload: CreatePayload) {
        let circuit_id = payload.circuit_id;
        let joined = self.relay_from_to.len() + self.exit_sockets.len();
        if joined >= self.settings.max_relays_or_exits {
            error!(
                "ignoring create for circuit {circuit_id} from {from} \
                 (too many relays {joined}/{})",
                self.settings.max_relays_or_exits
            );
            return;
        }

        // Never instantiate state for a create we cannot decrypt.
        let dh_bytes = match hybrid::hybrid_decrypt(&self.keypair, &payload.dh_blob) {
            Ok(b) => b,
            Err(e) => {
                debug!("dropping create for circuit {circuit_id}: {e}");
                return;
            }
        };
        let remote_share: [u8; 32] = match dh_bytes.as_slice().try_into() {
            Ok(share) => share,
            Err(_) => {
                debug!(
                    "dropping create for circuit {circuit_id}: bad DH share length {}",
                    dh_bytes.len()
                );
                return;
            }
        };

        info!("joined circuit {circuit_id} with neighbour {from}");
        self.directions.insert(circuit_id, Direction::Endpoint);

        let (dh_secret, dh_share) = generate_diffie_secret();
        let session_keys = generate_session_keys(&dh_secret, &remote_share);

        // Offer up to four verified neighbours as extension targets,
        // preserving walker order on the wire.
        let mut candidates: HashMap<PeerKey, Candidate> = HashMap::new();
        let mut offered: Vec<PeerKey> = Vec::new();
        for candidate in self.discovery.verified_candidates() {
            if offered.len() >= messages::MAX_CANDIDATES {
                break;
            }
            if candidates
                .insert(candidate.public_key, candidate.clone())
                .is_none()
            {
                offered.push(candidate.public_key);
            }
        }

        let list: Vec<Vec<u8>> = offered.iter().map(|k| k.as_bytes().to_vec()).collect();
        let list_plain = messages::encode_candidate_list(&list);
        let candidate_list_enc =
            match stream::encrypt_str(session_keys.key(Direction::Endpoint), &list_plain) {
                Ok(enc) => enc,
                Err(e) => {
                    error!("could not encrypt candidate list for circuit {circuit_id}: {e}");
                    self.directions.remove(&circuit_id);
                    return;
                }
            };

        self.relay_session_keys.insert(circuit_id, session_keys);
        self.request_cache.add(
            CacheKind::Created,
            circuit_id,
            CacheEntry::Created {
                circuit_id,
                inbound: from,
                candidates,
            },
            CREATED_CACHE_TIMEOUT,
        );
        // Until an extend arrives this peer is the terminus.
        self.exit_sockets.insert(circuit_id, None);
        self.observer.on_event(TunnelEvent::JoinedCircuit {
            circuit_id,
            inbound: from,
        });

        self.send_cell(
            from,
            TunnelMessage::Created(CreatedPayload {
                circuit_id,
                dh_share,
                candidate_list_enc,
            }),
        );
    }

    fn on_created(&mut self, from: SocketAddr, payload: CreatedPayload) {
        let circuit_id = payload.circuit_id;
        if !self.waiting_for.remove(&circuit_id) {
            error!("got an unexpected created for circuit {circuit_id} from {from}");
            return;
        }
        self.directions.insert(circuit_id, Direction::Originator);

        if let Some(forwarding) = self.relay_from_to.get(&circuit_id) {
            // We are the extending relay: rewrite the created as an extended
            // back down the inbound link.
            let inbound_circuit_id = forwarding.circuit_id;
            let inbound_addr = forwarding.sock_addr;
            debug!("got created, forwarding as extended to origin");
            self.send_cell(
                inbound_addr,
                TunnelMessage::Extended(ExtendedPayload {
                    circuit_id: inbound_circuit_id,
                    dh_share: payload.dh_share,
                    candidate_list_enc: payload.candidate_list_enc.clone(),
                }),
            );
        }

        if self.circuits.contains_key(&circuit_id) {
            self.ours_on_created_extended(circuit_id, payload.dh_share, payload.candidate_list_enc);
        }
    }

    fn on_extended(&mut self, _from: SocketAddr, payload: ExtendedPayload) {
        let circuit_id = payload.circuit_id;
        if !self.circuits.contains_key(&circuit_id) {
            debug!("dropping extended for unknown circuit {circuit_id}");
            return;
        }
        self.ours_on_created_extended(circuit_id, payload.dh_share, payload.candidate_list_enc);
    }

    /// Shared tail of `created` and `extended` handling on an own circuit:
    /// verify the pending hop, then either telescope further or admit.
    fn ours_on_created_extended(
        &mut self,
        circuit_id: u32,
        dh_share: [u8; 32],
        candidate_list_enc: Vec<u8>,
    ) {
        let (endpoint_key, hops_len, state) = {
            let Some(circuit) = self.circuits.get_mut(&circuit_id) else {
                return;
            };
            let Some(unverified) = circuit.unverified_hop.take() else {
                warn!("created/extended for circuit {circuit_id} without pending hop");
                return;
            };
            let session_keys = generate_session_keys(&unverified.dh_secret, &dh_share);
            let endpoint_key = *session_keys.key(Direction::Endpoint);
            circuit.add_hop(Hop {
                public_key: unverified.public_key,
                session_keys,
            });
            (endpoint_key, circuit.hops.len(), circuit.state)
        };

        match state {
            CircuitState::Extending => {
                let list_plain = match stream::decrypt_str(&endpoint_key, &candidate_list_enc) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("could not decrypt candidate list on circuit {circuit_id}: {e}");
                        return;
                    }
                };
                let candidate_list = match messages::decode_candidate_list(&list_plain) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("malformed candidate list on circuit {circuit_id}: {e}");
                        return;
                    }
                };
                self.extend_circuit(circuit_id, candidate_list);
            }
            CircuitState::Ready => {
                self.request_cache.pop(CacheKind::Circuit, circuit_id);
                info!("circuit {circuit_id} is ready");
            }
            CircuitState::Broken => return,
        }

        if self.circuits.contains_key(&circuit_id) {
            let event = if hops_len == 1 {
                TunnelEvent::CircuitCreated { circuit_id }
            } else {
                TunnelEvent::CircuitExtended {
                    circuit_id,
                    hops: hops_len,
                }
            };
            self.observer.on_event(event);
            if state == CircuitState::Ready {
                self.observer
                    .on_event(TunnelEvent::CircuitReady { circuit_id });
                self.maybe_session_ready();
            }
        }
    }

    /// Pick the next hop from the freshly offered candidate list and send the
    /// extend request through the established prefix of the circuit.
    fn extend_circuit(&mut self, circuit_id: u32, candidate_list: Vec<Vec<u8>>) {
        let own_key = self.keypair.public_key();
        let used: HashSet<[u8; 32]> = self
            .circuits
            .get(&circuit_id)
            .map(|c| c.hops.iter().map(|h| h.public_key.to_bytes()).collect())
            .unwrap_or_default();

        let chosen = candidate_list.into_iter().find(|bytes| {
            PeerKey::is_compatible(bytes)
                && bytes.as_slice() != own_key.as_bytes()
                && !used.contains(<&[u8; 32]>::try_from(bytes.as_slice()).unwrap_or(&[0; 32]))
        });

        let Some(chosen_bytes) = chosen else {
            self.remove_circuit(circuit_id, "no candidates to extend, bailing out");
            return;
        };
        let extend_key = match PeerKey::from_public_bin(&chosen_bytes) {
            Ok(k) => k,
            Err(e) => {
                error!("unusable extension candidate on circuit {circuit_id}: {e}");
                self.remove_circuit(circuit_id, "no candidates to extend, bailing out");
                return;
            }
        };

        let (dh_secret, dh_share) = generate_diffie_secret();
        let dh_blob = match hybrid::hybrid_encrypt(&extend_key, &dh_share) {
            Ok(blob) => blob,
            Err(e) => {
                error!("could not encrypt DH share for circuit {circuit_id}: {e}");
                return;
            }
        };

        let first_hop = {
            let Some(circuit) = self.circuits.get_mut(&circuit_id) else {
                return;
            };
            circuit.unverified_hop = Some(UnverifiedHop {
                public_key: extend_key,
                dh_secret,
            });
            circuit.first_hop
        };

        info!(
            "extending circuit {circuit_id} with {}",
            extend_key.to_hash()
        );
        let sent = self.send_cell(
            first_hop,
            TunnelMessage::Extend(ExtendPayload {
                circuit_id,
                extend_with: extend_key.to_bytes(),
                dh_blob,
            }),
        );
        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            circuit.bytes_up += sent as u64;
        }
    }

    fn on_extend(&mut self, from: SocketAddr, payload: ExtendPayload) {
        let circuit_id = payload.circuit_id;
        let Some(CacheEntry::Created { candidates, .. }) =
            self.request_cache.pop(CacheKind::Created, circuit_id)
        else {
            warn!("dropping extend with invalid request circuit id {circuit_id}");
            return;
        };

        let extend_key = PeerKey::from_bytes(payload.extend_with);
        let Some(extend_candidate) = candidates.get(&extend_key).cloned() else {
            error!("cancelling extend for circuit {circuit_id}, candidate was not offered");
            return;
        };

        // A retry purges the stale mirrored pair before the new one lands.
        if let Some(stale) = self.relay_from_to.remove(&circuit_id) {
            self.relay_from_to.remove(&stale.circuit_id);
            self.relay_session_keys.remove(&stale.circuit_id);
            self.directions.remove(&stale.circuit_id);
            self.waiting_for.remove(&stale.circuit_id);
        }

        let new_circuit_id = self.generate_circuit_id();
        self.waiting_for.insert(new_circuit_id);
        self.relay_from_to
            .insert(new_circuit_id, RelayRoute::new(circuit_id, from));
        self.relay_from_to.insert(
            circuit_id,
            RelayRoute::new(new_circuit_id, extend_candidate.sock_addr),
        );
        if let Some(keys) = self.relay_session_keys.get(&circuit_id).cloned() {
            self.relay_session_keys.insert(new_circuit_id, keys);
        }
        self.directions.insert(new_circuit_id, Direction::Originator);
        self.directions.insert(circuit_id, Direction::Endpoint);

        // No longer the terminus of this circuit.
        self.exit_sockets.remove(&circuit_id);

        info!(
            "extending circuit ({from}, {circuit_id}) to {}",
            extend_candidate.sock_addr
        );
        self.send_cell(
            extend_candidate.sock_addr,
            TunnelMessage::Create(CreatePayload {
                circuit_id: new_circuit_id,
                dh_blob: payload.dh_blob,
            }),
        );
    }

    // ------------------------------------------------------------------
    // Keep-alive
    // ------------------------------------------------------------------

    fn on_ping(&mut self, from: SocketAddr, payload: PingPayload) {
        if self.exit_sockets.contains_key(&payload.circuit_id) {
            debug!("got ping from {from}");
            self.send_cell(from, TunnelMessage::Pong(payload));
        } else {
            debug!("got ping from {from} (not responding)");
        }
    }

    fn on_pong(&mut self, from: SocketAddr, payload: PingPayload) {
        if self
            .request_cache
            .pop(CacheKind::Ping, u32::from(payload.identifier))
            .is_none()
        {
            warn!("dropping pong with invalid ping identifier from {from}");
            return;
        }
        debug!("got pong from {from}");
    }

    /// Ping every ready circuit; sent only to the first hop, which relays it
    /// onward until the exit answers.
    pub fn do_ping(&mut self) {
        let targets: Vec<(u32, SocketAddr)> = self
            .circuits
            .values()
            .filter(|c| c.state == CircuitState::Ready && c.goal_hops > 0)
            .map(|c| (c.circuit_id, c.first_hop))
            .collect();

        for (circuit_id, first_hop) in targets {
            let identifier = self.generate_ping_identifier();
            self.request_cache.add(
                CacheKind::Ping,
                u32::from(identifier),
                CacheEntry::Ping { circuit_id },
                self.settings.ping_timeout(),
            );
            let sent = self.send_cell(
                first_hop,
                TunnelMessage::Ping(PingPayload {
                    circuit_id,
                    identifier,
                }),
            );
            if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
                circuit.bytes_up += sent as u64;
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Top up own circuits, then sweep everything against the triple bounds.
    pub fn do_circuits(&mut self) {
        let needed = self
            .settings
            .max_circuits
            .saturating_sub(self.circuits.len());
        debug!("want {needed} more circuits");

        for _ in 0..needed {
            let used: HashSet<SocketAddr> =
                self.circuits.values().map(|c| c.first_hop).collect();
            let candidate = self
                .discovery
                .verified_candidates()
                .into_iter()
                .find(|c| {
                    !used.contains(&c.sock_addr)
                        && PeerKey::is_compatible(c.public_key.as_bytes())
                });
            let Some(candidate) = candidate else {
                break;
            };
            if let Err(e) = self.create_circuit(&candidate, self.settings.circuit_length) {
                warn!("error creating circuit: {e}");
            }
        }

        self.maybe_session_ready();
        self.do_break();
    }

    /// Evict circuits, relays, and exit sockets that are inactive, too old,
    /// or over their byte quota.
    fn do_break(&mut self) {
        let now = Instant::now();
        let max_inactive = self.settings.max_time_inactive();
        let max_time = self.settings.max_time();
        let max_traffic = self.settings.max_traffic;

        let mut broken: Vec<(u32, &'static str)> = Vec::new();
        for (cid, circuit) in &self.circuits {
            if now.duration_since(circuit.last_incoming) > max_inactive {
                broken.push((*cid, "no activity"));
            } else if now.duration_since(circuit.creation_time) > max_time {
                broken.push((*cid, "too old"));
            } else if circuit.bytes_up + circuit.bytes_down > max_traffic {
                broken.push((*cid, "traffic limit exceeded"));
            }
        }
        for (cid, reason) in broken {
            self.remove_circuit(cid, reason);
        }

        let mut broken: Vec<(u32, &'static str)> = Vec::new();
        for (cid, relay) in &self.relay_from_to {
            if now.duration_since(relay.last_incoming) > max_inactive {
                broken.push((*cid, "no activity"));
            } else if now.duration_since(relay.creation_time) > max_time {
                broken.push((*cid, "too old"));
            } else if relay.bytes_relayed > max_traffic {
                broken.push((*cid, "traffic limit exceeded"));
            }
        }
        for (cid, reason) in broken {
            self.remove_relay(cid, reason);
        }

        let mut broken: Vec<(u32, &'static str)> = Vec::new();
        for (cid, slot) in &self.exit_sockets {
            let Some(exit) = slot else {
                // Terminus placeholder; becomes a socket on first traffic.
                continue;
            };
            if now.duration_since(exit.last_incoming) > max_inactive {
                broken.push((*cid, "no activity"));
            } else if now.duration_since(exit.creation_time) > max_time {
                broken.push((*cid, "too old"));
            } else if exit.bytes_up + exit.bytes_down > max_traffic {
                broken.push((*cid, "traffic limit exceeded"));
            }
        }
        for (cid, reason) in broken {
            self.remove_exit_socket(cid, reason);
        }
    }

    /// Originate a new circuit toward `first_hop`.
    pub fn create_circuit(&mut self, first_hop: &Candidate, goal_hops: usize) -> Result<u32> {
        let circuit_id = self.generate_circuit_id();
        let mut circuit = Circuit::new(circuit_id, goal_hops, first_hop.sock_addr);

        let (dh_secret, dh_share) = generate_diffie_secret();
        circuit.unverified_hop = Some(UnverifiedHop {
            public_key: first_hop.public_key,
            dh_secret,
        });

        info!(
            "creating circuit {circuit_id} of {goal_hops} hops, first hop: {}",
            first_hop.sock_addr
        );

        let dh_blob = hybrid::hybrid_encrypt(&first_hop.public_key, &dh_share)?;
        self.request_cache.add(
            CacheKind::Circuit,
            circuit_id,
            CacheEntry::Circuit { circuit_id },
            CIRCUIT_BUILD_TIMEOUT,
        );
        self.circuits.insert(circuit_id, circuit);
        self.waiting_for.insert(circuit_id);

        let sent = self.send_cell(
            first_hop.sock_addr,
            TunnelMessage::Create(CreatePayload {
                circuit_id,
                dh_blob,
            }),
        );
        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            circuit.bytes_up += sent as u64;
        }
        Ok(circuit_id)
    }

    /// Tear down an own circuit and notify the front-end.
    pub fn remove_circuit(&mut self, circuit_id: u32, reason: &str) -> bool {
        let Some(mut circuit) = self.circuits.remove(&circuit_id) else {
            return false;
        };
        error!("breaking circuit {circuit_id}: {reason}");
        circuit.state = CircuitState::Broken;
        self.waiting_for.remove(&circuit_id);
        self.directions.remove(&circuit_id);
        self.request_cache.pop(CacheKind::Circuit, circuit_id);
        self.observer.circuit_dead(circuit_id);
        true
    }

    /// Tear down one side of a relayed pair.
    ///
    /// Only the addressed side is removed; the mirror keeps its own liveness
    /// clock and follows on the next inactivity sweep. Symmetric removal
    /// could race with a cell already in flight on the other link.
    pub fn remove_relay(&mut self, circuit_id: u32, reason: &str) {
        if self.relay_from_to.remove(&circuit_id).is_none() {
            debug!("could not break relay {circuit_id}: {reason}");
            return;
        }
        error!("breaking relay {circuit_id}: {reason}");
        self.relay_session_keys.remove(&circuit_id);
        self.directions.remove(&circuit_id);
        self.waiting_for.remove(&circuit_id);
    }

    /// Destroy an exit socket (or its terminus placeholder).
    pub fn remove_exit_socket(&mut self, circuit_id: u32, reason: &str) {
        let Some(slot) = self.exit_sockets.remove(&circuit_id) else {
            debug!("could not remove exit socket {circuit_id}: {reason}");
            return;
        };
        if slot.is_some() {
            error!("removed exit socket {circuit_id}: {reason}");
        }
        // The terminus bookkeeping dies with the socket unless the id lives
        // on as a relay link.
        if !self.relay_from_to.contains_key(&circuit_id) {
            self.relay_session_keys.remove(&circuit_id);
            self.directions.remove(&circuit_id);
        }
    }

    /// The earliest pending request-cache deadline, for the reactor's sleep.
    pub fn next_timeout(&mut self) -> Option<Instant> {
        self.request_cache.next_deadline()
    }

    /// Fire every request-cache timeout that is due.
    pub fn fire_timeouts(&mut self, now: Instant) {
        for (kind, number, entry) in self.request_cache.take_expired(now) {
            self.on_timeout(kind, number, entry, now);
        }
    }

    fn on_timeout(&mut self, kind: CacheKind, number: u32, entry: CacheEntry, now: Instant) {
        match (kind, entry) {
            (CacheKind::Circuit, CacheEntry::Circuit { circuit_id }) => {
                let pending = self
                    .circuits
                    .get(&circuit_id)
                    .is_some_and(|c| c.state != CircuitState::Ready);
                if pending {
                    self.remove_circuit(circuit_id, "timeout on circuit request");
                }
            }
            (CacheKind::Created, _) => {
                // The relay half-state is swept by inactivity; nothing to do.
                debug!("created cache entry {number} expired");
            }
            (CacheKind::Ping, CacheEntry::Ping { circuit_id }) => {
                let silent = self
                    .circuits
                    .get(&circuit_id)
                    .is_some_and(|c| {
                        now.duration_since(c.last_incoming) >= self.settings.ping_timeout()
                    });
                if silent {
                    debug!("no response on ping, circuit {circuit_id} timed out");
                    self.remove_circuit(circuit_id, "ping timeout");
                }
            }
            _ => {}
        }
    }

    fn maybe_session_ready(&mut self) {
        if self.made_anon_session {
            return;
        }
        if self.active_circuits().len() >= self.settings.min_circuits_for_session {
            info!("anonymous session ready");
            self.made_anon_session = true;
            self.observer.on_event(TunnelEvent::SessionReady);
        }
    }

    /// Close every exit socket and drop all state. The reactor calls this
    /// when its command channel closes.
    pub fn shutdown(&mut self) {
        debug!("shutting down tunnel community");
        self.exit_sockets.clear();
        self.circuits.clear();
        self.relay_from_to.clear();
        self.relay_session_keys.clear();
        self.directions.clear();
        self.waiting_for.clear();
    }

    // ------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------

    /// Send a user datagram toward its ultimate destination through the
    /// chosen circuit. Called by the front-end with a circuit it selected.
    pub fn tunnel_data_to_end(
        &mut self,
        destination: SocketAddrV4,
        payload: &[u8],
        circuit_id: u32,
    ) {
        let Some(circuit) = self.circuits.get(&circuit_id) else {
            warn!("dropping user data for unknown circuit {circuit_id}");
            return;
        };
        let first_hop = circuit.first_hop;
        let packet = data::encode_data(circuit_id, destination, ZERO_ADDR, payload);
        let sent = self.send_data(first_hop, &packet);
        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            circuit.bytes_up += sent as u64;
        }
    }

    /// Funnel a datagram received at the exit back toward the originator.
    fn tunnel_data_to_origin(
        &mut self,
        circuit_id: u32,
        sock_addr: SocketAddr,
        source: SocketAddrV4,
        payload: &[u8],
    ) {
        let packet = data::encode_data(circuit_id, ZERO_ADDR, source, payload);
        self.send_data(sock_addr, &packet);
    }

    /// Emit a decrypted datagram to the real Internet destination, creating
    /// the exit socket lazily on first use.
    fn exit_data(
        &mut self,
        circuit_id: u32,
        inbound: SocketAddr,
        destination: SocketAddrV4,
        payload: &[u8],
    ) {
        if !self.exit_sockets.contains_key(&circuit_id) {
            error!("dropping data packets with unknown circuit {circuit_id}");
            return;
        }
        if self
            .exit_sockets
            .get(&circuit_id)
            .is_some_and(Option::is_none)
        {
            match self.binder.bind_ephemeral(circuit_id) {
                Ok(socket) => {
                    debug!(
                        "bound exit socket for circuit {circuit_id} on port {}",
                        socket.local_port()
                    );
                    self.exit_sockets.insert(
                        circuit_id,
                        Some(ExitSocket::new(circuit_id, inbound, socket)),
                    );
                }
                Err(e) => {
                    error!("could not bind exit socket for circuit {circuit_id}: {e}");
                    return;
                }
            }
        }

        let max_packets = self.settings.max_packets_without_reply;
        let verdict = {
            let Some(Some(exit)) = self.exit_sockets.get_mut(&circuit_id) else {
                return;
            };
            exit.last_incoming = Instant::now();
            exit.check_num_packets(destination, false, max_packets)
        };
        if verdict == ExitVerdict::Exceeded {
            error!(
                "too many packets to a destination without a reply, \
                 removing exit socket with circuit {circuit_id}"
            );
            self.remove_exit_socket(circuit_id, "too many packets without reply");
            return;
        }

        if !data::could_be_utp(payload) {
            error!("dropping non-utp packets from exit socket with circuit {circuit_id}");
            return;
        }

        if let Some(Some(exit)) = self.exit_sockets.get_mut(&circuit_id) {
            if let Err(e) = exit.send_to(payload, destination) {
                error!("dropping data packets while exiting: {e}");
            }
        }
    }

    /// A datagram arrived on an exit socket from the outside world; the
    /// reactor marshals it here.
    pub fn on_exit_datagram(&mut self, circuit_id: u32, source: SocketAddrV4, payload: &[u8]) {
        let max_packets = self.settings.max_packets_without_reply;
        let (verdict, inbound) = {
            let Some(Some(exit)) = self.exit_sockets.get_mut(&circuit_id) else {
                debug!("dropping datagram for unknown exit socket {circuit_id}");
                return;
            };
            (
                exit.check_num_packets(source, true, max_packets),
                exit.inbound,
            )
        };
        if verdict == ExitVerdict::Exceeded {
            error!(
                "too many packets to a destination without a reply, \
                 removing exit socket with circuit {circuit_id}"
            );
            self.remove_exit_socket(circuit_id, "too many packets without reply");
            return;
        }

        if let Some(Some(exit)) = self.exit_sockets.get_mut(&circuit_id) {
            exit.record_incoming(payload.len());
        }
        if !data::could_be_utp(payload) {
            error!("dropping non-utp packets to exit socket with circuit {circuit_id}");
            return;
        }
        self.tunnel_data_to_origin(circuit_id, inbound, source, payload);
    }

    // ------------------------------------------------------------------
    // Crypto pipeline
    // ------------------------------------------------------------------

    /// Onion-encrypt outbound content: one layer per hop of an own circuit,
    /// innermost first, or a single layer when this peer sits on the circuit
    /// as a relay or exit.
    fn crypto_out(&self, circuit_id: u32, content: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
        if let Some(circuit) = self.circuits.get(&circuit_id) {
            let mut content = content.to_vec();
            for hop in circuit.hops.iter().rev() {
                content = stream::encrypt_str(hop.session_keys.key(Direction::Endpoint), &content)?;
            }
            return Ok(content);
        }
        if let Some(keys) = self.relay_session_keys.get(&circuit_id) {
            return stream::encrypt_str(keys.key(Direction::Originator), content);
        }
        Err(CryptoError::UnknownCircuit(circuit_id))
    }

    /// Peel inbound content: every hop's layer on an own circuit, outermost
    /// first, or the single local layer when this peer joined the circuit.
    fn crypto_in(&self, circuit_id: u32, content: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
        if let Some(circuit) = self.circuits.get(&circuit_id) {
            if !circuit.hops.is_empty() {
                let mut content = content.to_vec();
                for hop in &circuit.hops {
                    content =
                        stream::decrypt_str(hop.session_keys.key(Direction::Originator), &content)?;
                }
                return Ok(content);
            }
        }
        if let Some(keys) = self.relay_session_keys.get(&circuit_id) {
            return stream::decrypt_str(keys.key(Direction::Endpoint), content);
        }
        Err(CryptoError::UnknownCircuit(circuit_id))
    }

    /// The single-layer relay step, direction-aware: outbound cells gain a
    /// layer on the way back and lose one on the way out, so the originator's
    /// onion stays balanced.
    fn crypto_relay(&self, circuit_id: u32, content: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
        let direction = self
            .directions
            .get(&circuit_id)
            .ok_or(CryptoError::UnknownCircuit(circuit_id))?;
        let keys = self
            .relay_session_keys
            .get(&circuit_id)
            .ok_or(CryptoError::UnknownCircuit(circuit_id))?;
        match direction {
            Direction::Originator => stream::encrypt_str(keys.key(Direction::Originator), content),
            Direction::Endpoint => stream::decrypt_str(keys.key(Direction::Endpoint), content),
        }
    }

    // ------------------------------------------------------------------
    // Send helpers
    // ------------------------------------------------------------------

    /// Frame, onion-encrypt (handshake kinds excepted), and emit a cell.
    /// Returns bytes sent, zero on crypto failure.
    fn send_cell(&mut self, addr: SocketAddr, message: TunnelMessage) -> usize {
        let kind = message.kind();
        let circuit_id = message.circuit_id();
        let packet = messages::convert_to_cell(&message);

        let packet = if kind.is_handshake() {
            packet
        } else {
            let Ok((plaintext, encrypted)) = Plane::Cell.split(&packet) else {
                return 0;
            };
            match self.crypto_out(circuit_id, encrypted) {
                Ok(enc) => {
                    let mut out = Vec::with_capacity(plaintext.len() + enc.len());
                    out.extend_from_slice(plaintext);
                    out.extend_from_slice(&enc);
                    out
                }
                Err(e) => {
                    error!("cell crypto failed for circuit {circuit_id}: {e}");
                    return 0;
                }
            }
        };
        self.send_packet(addr, kind.name(), &packet)
    }

    /// Onion-encrypt and emit a framed data packet. Returns bytes sent,
    /// zero on crypto failure.
    fn send_data(&mut self, addr: SocketAddr, packet: &[u8]) -> usize {
        let Ok(circuit_id) = data::get_circuit_id(packet) else {
            return 0;
        };
        let Ok((plaintext, encrypted)) = Plane::Data.split(packet) else {
            return 0;
        };
        match self.crypto_out(circuit_id, encrypted) {
            Ok(enc) => {
                let mut out = Vec::with_capacity(plaintext.len() + enc.len());
                out.extend_from_slice(plaintext);
                out.extend_from_slice(&enc);
                self.send_packet(addr, "data", &out)
            }
            Err(e) => {
                error!("data crypto failed for circuit {circuit_id}: {e}");
                0
            }
        }
    }

    fn send_packet(&mut self, addr: SocketAddr, kind: &'static str, packet: &[u8]) -> usize {
        self.sink.send_to(addr, packet);
        self.stats.count_out(kind);
        debug!("sent {kind} ({} bytes) to {addr}", packet.len());
        packet.len()
    }

    // ------------------------------------------------------------------
    // Id generation
    // ------------------------------------------------------------------

    /// Draw a non-zero circuit id unique across everything this peer indexes
    /// by circuit id; collisions are resolved by redraw.
    fn generate_circuit_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let circuit_id: u32 = rng.gen();
            if circuit_id != 0
                && !self.circuits.contains_key(&circuit_id)
                && !self.relay_from_to.contains_key(&circuit_id)
            {
                return circuit_id;
            }
        }
    }

    fn generate_ping_identifier(&self) -> u16 {
        let mut rng = rand::thread_rng();
        loop {
            let identifier: u16 = rng.gen();
            if !self
                .request_cache
                .has(CacheKind::Ping, u32::from(identifier))
            {
                return identifier;
            }
        }
    }
}
