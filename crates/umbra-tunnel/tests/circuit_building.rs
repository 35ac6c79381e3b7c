//! Multi-peer circuit construction scenarios.

mod common;

use common::{assert_invariants, TestNet};
use umbra_tunnel::cache::CacheKind;
use umbra_tunnel::external::TunnelEvent;
use umbra_tunnel::routing::CircuitState;
use umbra_tunnel::settings::TunnelSettings;

#[test]
fn three_hop_build_happy_path() {
    let mut net = TestNet::new();
    let p0 = net.add_peer(1, TunnelSettings::default());
    let p1 = net.add_peer(2, TunnelSettings::default());
    let p2 = net.add_peer(3, TunnelSettings::default());
    let p3 = net.add_peer(4, TunnelSettings::default());

    net.set_discovery(p0, &[p1]);
    net.set_discovery(p1, &[p2]);
    net.set_discovery(p2, &[p3]);

    let first = net.candidate(p1);
    let cid = net
        .peer_mut(p0)
        .community
        .create_circuit(&first, 3)
        .expect("create circuit");
    net.deliver_all();

    let circuit = &net.peer(p0).community.circuits()[&cid];
    assert_eq!(circuit.state, CircuitState::Ready);
    assert_eq!(circuit.hops.len(), 3);

    let hop_keys: Vec<_> = circuit.hops.iter().map(|h| h.public_key).collect();
    assert_eq!(
        hop_keys,
        vec![
            net.peer(p1).public_key,
            net.peer(p2).public_key,
            net.peer(p3).public_key
        ]
    );

    // The build is complete, so the anon-circuit entry is gone.
    assert!(!net
        .peer(p0)
        .community
        .request_cache()
        .has(CacheKind::Circuit, cid));

    // Middle hops hold mirrored relay pairs pointing at each other.
    for relay in [p1, p2] {
        let routes = net.peer(relay).community.relay_routes();
        assert_eq!(routes.len(), 2);
        for (side, route) in routes {
            assert_eq!(routes[&route.circuit_id].circuit_id, *side);
        }
    }

    // Only the terminus holds an exit placeholder.
    assert!(net.peer(p1).community.exit_sockets().is_empty());
    assert!(net.peer(p2).community.exit_sockets().is_empty());
    let p3_exits = net.peer(p3).community.exit_sockets();
    assert_eq!(p3_exits.len(), 1);
    assert!(p3_exits.values().all(|slot| slot.is_none()));

    let events = net.peer(p0).events.lock().expect("lock").clone();
    assert!(events.contains(&TunnelEvent::CircuitCreated { circuit_id: cid }));
    assert!(events.contains(&TunnelEvent::CircuitExtended {
        circuit_id: cid,
        hops: 2
    }));
    assert!(events.contains(&TunnelEvent::CircuitReady { circuit_id: cid }));

    for addr in [p0, p1, p2, p3] {
        assert_invariants(net.peer(addr));
    }
}

#[test]
fn extension_exhaustion_tears_down() {
    let mut net = TestNet::new();
    let p0 = net.add_peer(1, TunnelSettings::default());
    let p1 = net.add_peer(2, TunnelSettings::default());

    net.set_discovery(p0, &[p1]);
    // The only extension targets offered are the originator itself and the
    // already-used first hop.
    net.set_discovery(p1, &[p0, p1]);

    let first = net.candidate(p1);
    let cid = net
        .peer_mut(p0)
        .community
        .create_circuit(&first, 3)
        .expect("create circuit");
    net.deliver_all();

    let p0_peer = net.peer(p0);
    assert!(!p0_peer.community.circuits().contains_key(&cid));
    assert!(!p0_peer.community.request_cache().has(CacheKind::Circuit, cid));
    assert!(p0_peer.dead.lock().expect("lock").contains(&cid));
}

#[test]
fn two_hop_build() {
    let mut net = TestNet::new();
    let p0 = net.add_peer(1, TunnelSettings::default());
    let p1 = net.add_peer(2, TunnelSettings::default());
    let p2 = net.add_peer(3, TunnelSettings::default());

    net.set_discovery(p0, &[p1]);
    net.set_discovery(p1, &[p2]);

    let first = net.candidate(p1);
    let cid = net
        .peer_mut(p0)
        .community
        .create_circuit(&first, 2)
        .expect("create circuit");
    net.deliver_all();

    let circuit = &net.peer(p0).community.circuits()[&cid];
    assert_eq!(circuit.state, CircuitState::Ready);
    assert_eq!(circuit.hops.len(), 2);
    // The first hop relays, the second is the terminus.
    assert_eq!(net.peer(p1).community.relay_routes().len(), 2);
    assert_eq!(net.peer(p2).community.exit_sockets().len(), 1);
}

#[test]
fn session_ready_fires_exactly_once() {
    let mut settings = TunnelSettings::default();
    settings.min_circuits_for_session = 1;

    let mut net = TestNet::new();
    let p0 = net.add_peer(1, settings.clone());
    let p1 = net.add_peer(2, settings.clone());
    let p2 = net.add_peer(3, settings);

    net.set_discovery(p0, &[p1, p2]);

    let first = net.candidate(p1);
    net.peer_mut(p0)
        .community
        .create_circuit(&first, 1)
        .expect("create circuit");
    net.deliver_all();

    let ready_events = |net: &TestNet| {
        net.peer(p0)
            .events
            .lock().expect("lock")
            .iter()
            .filter(|e| matches!(e, TunnelEvent::SessionReady))
            .count()
    };
    assert_eq!(ready_events(&net), 1);

    // A second circuit reaching READY must not re-announce the session.
    let second = net.candidate(p2);
    net.peer_mut(p0)
        .community
        .create_circuit(&second, 1)
        .expect("create circuit");
    net.deliver_all();
    assert_eq!(ready_events(&net), 1);
}

#[test]
fn relay_budget_rejects_creates_without_side_effect() {
    let mut relay_settings = TunnelSettings::default();
    relay_settings.max_relays_or_exits = 1;

    let mut net = TestNet::new();
    let p0 = net.add_peer(1, TunnelSettings::default());
    let p0b = net.add_peer(2, TunnelSettings::default());
    let p1 = net.add_peer(3, relay_settings);

    let first = net.candidate(p1);
    net.peer_mut(p0)
        .community
        .create_circuit(&first, 1)
        .expect("create circuit");
    net.deliver_all();
    assert_eq!(net.peer(p1).community.exit_sockets().len(), 1);

    // The budget is used up; a second originator is ignored entirely.
    let first = net.candidate(p1);
    let cid_b = net
        .peer_mut(p0b)
        .community
        .create_circuit(&first, 1)
        .expect("create circuit");
    net.deliver_all();

    assert_eq!(net.peer(p1).community.exit_sockets().len(), 1);
    assert!(!net.peer(p1).community.has_session_keys(cid_b));
    // The ignored originator never got a created.
    let circuit = &net.peer(p0b).community.circuits()[&cid_b];
    assert_eq!(circuit.state, CircuitState::Extending);
}
