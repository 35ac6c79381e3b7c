//! umbra-node: standalone tunnel daemon.
//!
//! Runs the tunnel reactor with a static bootstrap peer list standing in for
//! the gossip substrate. Mainly useful for operating relay/exit peers and
//! for soak-testing circuits; a full client embeds the community behind its
//! own front-end instead.

mod config;

use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use tracing::{info, warn};

use umbra_crypto::identity::{PeerKey, TunnelKeypair};
use umbra_tunnel::driver::TunnelDriver;
use umbra_tunnel::external::{Candidate, Discovery, TunnelEvent, TunnelObserver};

use crate::config::NodeConfig;

/// Discovery backed by the configured bootstrap list.
struct StaticDiscovery {
    candidates: Vec<Candidate>,
}

impl Discovery for StaticDiscovery {
    fn verified_candidates(&self) -> Vec<Candidate> {
        self.candidates.clone()
    }
}

/// Observer that narrates tunnel life into the log; a real client hooks its
/// SOCKS front-end in here instead.
struct LoggingObserver;

impl TunnelObserver for LoggingObserver {
    fn on_incoming_from_tunnel(&mut self, circuit_id: u32, origin: SocketAddrV4, data: &[u8]) {
        info!(
            "circuit {circuit_id}: {} bytes of return traffic from {origin}",
            data.len()
        );
    }

    fn circuit_dead(&mut self, circuit_id: u32) {
        info!("circuit {circuit_id} is dead");
    }

    fn on_event(&mut self, event: TunnelEvent) {
        info!("tunnel event: {event:?}");
    }
}

fn load_candidates(config: &NodeConfig) -> Vec<Candidate> {
    let mut candidates = Vec::with_capacity(config.bootstrap.len());
    for peer in &config.bootstrap {
        let addr: SocketAddr = match peer.addr.parse() {
            Ok(a) => a,
            Err(e) => {
                warn!("skipping bootstrap peer with bad address {}: {e}", peer.addr);
                continue;
            }
        };
        let key_bytes = match hex::decode(&peer.public_key) {
            Ok(b) => b,
            Err(e) => {
                warn!("skipping bootstrap peer {} with bad key hex: {e}", peer.addr);
                continue;
            }
        };
        match PeerKey::from_public_bin(&key_bytes) {
            Ok(public_key) => candidates.push(Candidate {
                sock_addr: addr,
                public_key,
            }),
            Err(e) => warn!("skipping bootstrap peer {}: {e}", peer.addr),
        }
    }
    candidates
}

fn load_keypair(config: &NodeConfig) -> anyhow::Result<TunnelKeypair> {
    if config.identity_key.is_empty() {
        return Ok(TunnelKeypair::random());
    }
    let bytes = hex::decode(&config.identity_key)?;
    let secret: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("identity_key must be 32 hex-encoded bytes"))?;
    Ok(TunnelKeypair::from_bytes(secret))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = NodeConfig::load(config_path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("umbra={}", config.log_level).parse()?),
        )
        .init();

    info!("umbra node starting");

    let keypair = load_keypair(&config)?;
    info!("peer identity {}", keypair.public_key().to_hash());

    let candidates = load_candidates(&config);
    info!("{} bootstrap peers configured", candidates.len());

    let listen_addr: SocketAddr = config.listen_addr.parse()?;
    let (driver, handle) = TunnelDriver::new(
        config.tunnel.clone(),
        keypair,
        Box::new(StaticDiscovery { candidates }),
        Box::new(LoggingObserver),
        listen_addr,
    )?;

    let reactor = tokio::spawn(driver.run());

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");
    handle.shutdown();
    let _ = reactor.await;

    info!("umbra node stopped");
    Ok(())
}
