//! Tunnel configuration surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// All tunable knobs of the tunnel core.
///
/// Durations are stored as whole seconds so the struct maps one-to-one onto
/// its TOML form; accessor methods hand out [`Duration`]s.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Target number of hops per circuit.
    #[serde(default = "default_circuit_length")]
    pub circuit_length: usize,
    /// Port the SOCKS5 front-end listens on (consumed by the front-end, not
    /// by the core).
    #[serde(default = "default_socks_listen_port")]
    pub socks_listen_port: u16,
    /// Ready circuits required before the session is announced usable.
    #[serde(default = "default_min_circuits_for_session")]
    pub min_circuits_for_session: usize,
    /// Own circuits to keep topped up.
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,
    /// Joined circuits (relays plus exits) accepted from other peers.
    #[serde(default = "default_max_relays_or_exits")]
    pub max_relays_or_exits: usize,
    /// Maximum wall age of any circuit, relay, or exit socket, in seconds.
    #[serde(default = "default_max_time_secs")]
    pub max_time_secs: u64,
    /// Maximum idle gap before eviction, in seconds.
    #[serde(default = "default_max_time_inactive_secs")]
    pub max_time_inactive_secs: u64,
    /// Byte quota per circuit, relay, or exit socket.
    #[serde(default = "default_max_traffic")]
    pub max_traffic: u64,
    /// Outgoing packets tolerated per destination without a reply.
    #[serde(default = "default_max_packets_without_reply")]
    pub max_packets_without_reply: u32,
    /// Keep-alive probe interval, in seconds.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_circuit_length() -> usize {
    3
}

fn default_socks_listen_port() -> u16 {
    1080
}

fn default_min_circuits_for_session() -> usize {
    4
}

fn default_max_circuits() -> usize {
    8
}

fn default_max_relays_or_exits() -> usize {
    100
}

fn default_max_time_secs() -> u64 {
    10 * 60
}

fn default_max_time_inactive_secs() -> u64 {
    20
}

fn default_max_traffic() -> u64 {
    10 * 1024 * 1024
}

fn default_max_packets_without_reply() -> u32 {
    50
}

fn default_ping_interval_secs() -> u64 {
    10
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            circuit_length: default_circuit_length(),
            socks_listen_port: default_socks_listen_port(),
            min_circuits_for_session: default_min_circuits_for_session(),
            max_circuits: default_max_circuits(),
            max_relays_or_exits: default_max_relays_or_exits(),
            max_time_secs: default_max_time_secs(),
            max_time_inactive_secs: default_max_time_inactive_secs(),
            max_traffic: default_max_traffic(),
            max_packets_without_reply: default_max_packets_without_reply(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl TunnelSettings {
    /// Maximum wall age of any circuit, relay, or exit socket.
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_time_secs)
    }

    /// Maximum idle gap before eviction.
    pub fn max_time_inactive(&self) -> Duration {
        Duration::from_secs(self.max_time_inactive_secs)
    }

    /// Keep-alive probe interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Grace period after which an unanswered ping kills its circuit.
    pub fn ping_timeout(&self) -> Duration {
        self.ping_interval() + Duration::from_secs(5)
    }
}
