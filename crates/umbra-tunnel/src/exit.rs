//! Exit-side UDP sockets with per-destination abuse counters.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;

use crate::external::DatagramSocket;

/// Outcome of the per-destination packet-count check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitVerdict {
    Allowed,
    /// Threshold crossed; the socket must be destroyed.
    Exceeded,
}

/// A per-circuit UDP socket bound at the exit peer.
///
/// Created lazily on the first exit datagram for a circuit; remembers the
/// inbound peer so return traffic can be funnelled back down the circuit.
pub struct ExitSocket {
    pub circuit_id: u32,
    /// Where return traffic re-enters the circuit.
    pub inbound: SocketAddr,
    socket: Box<dyn DatagramSocket>,
    /// Outstanding unanswered packet count per remote endpoint. Incremented
    /// on every outgoing packet, cleared outright by any matching incoming
    /// packet (generous by observed protocol behavior, not a debit).
    ips: HashMap<SocketAddrV4, u32>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub creation_time: Instant,
    pub last_incoming: Instant,
}

impl std::fmt::Debug for ExitSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitSocket")
            .field("circuit_id", &self.circuit_id)
            .field("inbound", &self.inbound)
            .field("bytes_up", &self.bytes_up)
            .field("bytes_down", &self.bytes_down)
            .finish()
    }
}

impl PartialEq for ExitSocket {
    fn eq(&self, other: &Self) -> bool {
        self.circuit_id == other.circuit_id && self.inbound == other.inbound
    }
}

impl ExitSocket {
    pub fn new(circuit_id: u32, inbound: SocketAddr, socket: Box<dyn DatagramSocket>) -> Self {
        let now = Instant::now();
        Self {
            circuit_id,
            inbound,
            socket,
            ips: HashMap::new(),
            bytes_up: 0,
            bytes_down: 0,
            creation_time: now,
            last_incoming: now,
        }
    }

    /// The ephemeral port the socket listens on.
    pub fn local_port(&self) -> u16 {
        self.socket.local_port()
    }

    /// Enforce the per-endpoint reply policy.
    ///
    /// Outgoing packets trip at `max_packets_without_reply`; incoming at one
    /// higher, tolerating the race where a reply and the tripping packet
    /// cross. An allowed incoming packet clears the endpoint's counter; an
    /// allowed outgoing one increments it.
    pub fn check_num_packets(
        &mut self,
        endpoint: SocketAddrV4,
        incoming: bool,
        max_packets_without_reply: u32,
    ) -> ExitVerdict {
        let limit = if incoming {
            max_packets_without_reply + 1
        } else {
            max_packets_without_reply
        };
        let counter = self.ips.entry(endpoint).or_insert(0);
        if *counter >= limit {
            return ExitVerdict::Exceeded;
        }
        if incoming {
            self.ips.remove(&endpoint);
        } else {
            *counter += 1;
        }
        ExitVerdict::Allowed
    }

    /// Emit a plaintext datagram and account for it.
    pub fn send_to(&mut self, data: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        let sent = self.socket.send_to(data, dest)?;
        self.bytes_up += data.len() as u64;
        Ok(sent)
    }

    /// Account for a received datagram.
    pub fn record_incoming(&mut self, len: usize) {
        self.bytes_down += len as u64;
        self.last_incoming = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeSocket {
        sent: Arc<Mutex<Vec<(SocketAddrV4, Vec<u8>)>>>,
    }

    impl DatagramSocket for FakeSocket {
        fn send_to(&mut self, data: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
            self.sent.lock().expect("lock").push((dest, data.to_vec()));
            Ok(data.len())
        }

        fn local_port(&self) -> u16 {
            40000
        }
    }

    fn make_exit() -> (ExitSocket, Arc<Mutex<Vec<(SocketAddrV4, Vec<u8>)>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let socket = FakeSocket { sent: sent.clone() };
        let inbound: SocketAddr = "10.0.0.9:4000".parse().expect("addr");
        (ExitSocket::new(5, inbound, Box::new(socket)), sent)
    }

    fn dest() -> SocketAddrV4 {
        "1.2.3.4:5678".parse().expect("addr")
    }

    #[test]
    fn test_outgoing_trips_at_max() {
        let (mut exit, _) = make_exit();
        for _ in 0..50 {
            assert_eq!(
                exit.check_num_packets(dest(), false, 50),
                ExitVerdict::Allowed
            );
        }
        assert_eq!(
            exit.check_num_packets(dest(), false, 50),
            ExitVerdict::Exceeded
        );
    }

    #[test]
    fn test_incoming_tolerates_one_more() {
        let (mut exit, _) = make_exit();
        for _ in 0..50 {
            exit.check_num_packets(dest(), false, 50);
        }
        // Outgoing is saturated, but a reply still gets through.
        assert_eq!(
            exit.check_num_packets(dest(), true, 50),
            ExitVerdict::Allowed
        );
    }

    #[test]
    fn test_incoming_clears_counter_entirely() {
        let (mut exit, _) = make_exit();
        for _ in 0..49 {
            exit.check_num_packets(dest(), false, 50);
        }
        // One reply wipes the whole counter, not just one unit.
        assert_eq!(
            exit.check_num_packets(dest(), true, 50),
            ExitVerdict::Allowed
        );
        for _ in 0..50 {
            assert_eq!(
                exit.check_num_packets(dest(), false, 50),
                ExitVerdict::Allowed
            );
        }
    }

    #[test]
    fn test_counters_are_per_endpoint() {
        let (mut exit, _) = make_exit();
        let other: SocketAddrV4 = "5.6.7.8:9000".parse().expect("addr");
        for _ in 0..50 {
            exit.check_num_packets(dest(), false, 50);
        }
        assert_eq!(
            exit.check_num_packets(dest(), false, 50),
            ExitVerdict::Exceeded
        );
        assert_eq!(
            exit.check_num_packets(other, false, 50),
            ExitVerdict::Allowed
        );
    }

    #[test]
    fn test_send_accounts_bytes() {
        let (mut exit, sent) = make_exit();
        exit.send_to(b"hello", dest()).expect("send");
        assert_eq!(exit.bytes_up, 5);
        assert_eq!(sent.lock().expect("lock").len(), 1);
        assert_eq!(sent.lock().expect("lock")[0].0, dest());
    }
}
