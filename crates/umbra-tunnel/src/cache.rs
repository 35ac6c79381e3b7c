//! Pending-operation records with deadline-driven timeouts.
//!
//! Three kinds of short-lived records: an outbound circuit build awaiting
//! `created`/`extended`, an answered `create` awaiting `extend`, and an
//! outstanding ping. Records are keyed by `(kind, number)`; deadlines sit in
//! a priority queue the reactor drains, so every timeout funnels through one
//! `on_timeout` path in the community.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use umbra_crypto::identity::PeerKey;

use crate::external::Candidate;

/// Record families, in the wire protocol's naming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    /// `anon-circuit`: own circuit build in flight, keyed by circuit id.
    Circuit,
    /// `anon-created`: answered `create` awaiting `extend`, keyed by the
    /// joined circuit id.
    Created,
    /// `ping`: outstanding keep-alive, keyed by its random identifier.
    Ping,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Circuit => "anon-circuit",
            Self::Created => "anon-created",
            Self::Ping => "ping",
        }
    }
}

/// Payload of a pending record.
pub enum CacheEntry {
    Circuit {
        circuit_id: u32,
    },
    Created {
        circuit_id: u32,
        inbound: SocketAddr,
        /// The verified neighbours offered as extension targets, keyed by
        /// their public key as serialized into the candidate list.
        candidates: HashMap<PeerKey, Candidate>,
    },
    Ping {
        circuit_id: u32,
    },
}

struct Slot {
    entry: CacheEntry,
    seq: u64,
}

/// The cache proper: records plus a deadline heap.
///
/// Stale heap items (for records already popped or re-added) are skipped
/// lazily by comparing sequence numbers.
#[derive(Default)]
pub struct RequestCache {
    slots: HashMap<(CacheKind, u32), Slot>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, CacheKind, u32)>>,
    next_seq: u64,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a record with the given timeout.
    pub fn add(&mut self, kind: CacheKind, number: u32, entry: CacheEntry, timeout: Duration) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = Instant::now() + timeout;
        self.slots.insert((kind, number), Slot { entry, seq });
        self.deadlines.push(Reverse((deadline, seq, kind, number)));
    }

    pub fn has(&self, kind: CacheKind, number: u32) -> bool {
        self.slots.contains_key(&(kind, number))
    }

    pub fn get(&self, kind: CacheKind, number: u32) -> Option<&CacheEntry> {
        self.slots.get(&(kind, number)).map(|s| &s.entry)
    }

    /// Remove and return a record, cancelling its timeout.
    pub fn pop(&mut self, kind: CacheKind, number: u32) -> Option<CacheEntry> {
        self.slots.remove(&(kind, number)).map(|s| s.entry)
    }

    /// The earliest live deadline, if any. Prunes stale heap entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq, kind, number))) = self.deadlines.peek().copied() {
            match self.slots.get(&(kind, number)) {
                Some(slot) if slot.seq == seq => return Some(deadline),
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }

    /// Remove and return every record whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(CacheKind, u32, CacheEntry)> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, seq, kind, number))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            let live = self
                .slots
                .get(&(kind, number))
                .is_some_and(|slot| slot.seq == seq);
            if live {
                if let Some(slot) = self.slots.remove(&(kind, number)) {
                    expired.push((kind, number, slot.entry));
                }
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circuit_entry(circuit_id: u32) -> CacheEntry {
        CacheEntry::Circuit { circuit_id }
    }

    #[test]
    fn test_add_get_pop() {
        let mut cache = RequestCache::new();
        cache.add(
            CacheKind::Circuit,
            7,
            circuit_entry(7),
            Duration::from_secs(10),
        );
        assert!(cache.has(CacheKind::Circuit, 7));
        assert!(!cache.has(CacheKind::Ping, 7));

        let entry = cache.pop(CacheKind::Circuit, 7);
        assert!(matches!(entry, Some(CacheEntry::Circuit { circuit_id: 7 })));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_surface_once() {
        let mut cache = RequestCache::new();
        cache.add(CacheKind::Ping, 1, circuit_entry(5), Duration::ZERO);
        cache.add(
            CacheKind::Circuit,
            2,
            circuit_entry(2),
            Duration::from_secs(60),
        );

        let now = Instant::now() + Duration::from_millis(1);
        let expired = cache.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, CacheKind::Ping);
        assert!(cache.take_expired(now).is_empty());
        assert!(cache.has(CacheKind::Circuit, 2));
    }

    #[test]
    fn test_pop_cancels_timeout() {
        let mut cache = RequestCache::new();
        cache.add(CacheKind::Ping, 1, circuit_entry(5), Duration::ZERO);
        cache.pop(CacheKind::Ping, 1);
        let expired = cache.take_expired(Instant::now() + Duration::from_millis(1));
        assert!(expired.is_empty());
    }

    #[test]
    fn test_readd_supersedes_old_deadline() {
        let mut cache = RequestCache::new();
        cache.add(CacheKind::Ping, 1, circuit_entry(5), Duration::ZERO);
        cache.add(CacheKind::Ping, 1, circuit_entry(5), Duration::from_secs(60));

        // The stale zero deadline must not expire the re-added record.
        let expired = cache.take_expired(Instant::now() + Duration::from_millis(1));
        assert!(expired.is_empty());
        assert!(cache.has(CacheKind::Ping, 1));
    }

    #[test]
    fn test_next_deadline_orders_and_prunes() {
        let mut cache = RequestCache::new();
        assert!(cache.next_deadline().is_none());

        cache.add(
            CacheKind::Circuit,
            1,
            circuit_entry(1),
            Duration::from_secs(60),
        );
        cache.add(CacheKind::Ping, 2, circuit_entry(2), Duration::from_secs(1));
        let first = cache.next_deadline().expect("deadline");
        assert!(first <= Instant::now() + Duration::from_secs(1));

        cache.pop(CacheKind::Ping, 2);
        let second = cache.next_deadline().expect("deadline");
        assert!(second > first);
    }
}
