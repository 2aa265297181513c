//! End-to-end reliable delivery over the real flooding router.

use meshnode_core::clock::{Clock, ManualClock};
use meshnode_core::config::MeshConfig;
use meshnode_core::mesh::packet_id::PacketIdGenerator;
use meshnode_core::mesh::routing_control::ack_nak_packet;
use meshnode_core::mesh::simulation::{SimConfig, SimNetwork, Topology};
use meshnode_core::mesh::{
    FloodRouter, GlobalPacketId, MeshPacket, MeshResult, NodeNum, RadioInterface, ReliableRouter,
    Router, RoutingError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ME: NodeNum = NodeNum::new(0x0a0b0c0d);
const RETRY_MS: u64 = 2_000;

/// Radio that shares its transmit log with the test
#[derive(Clone, Default)]
struct TapRadio {
    log: Arc<Mutex<Vec<MeshPacket>>>,
}

impl TapRadio {
    fn sent(&self) -> Vec<MeshPacket> {
        self.log.lock().unwrap().clone()
    }
}

impl RadioInterface for TapRadio {
    fn send(&mut self, packet: MeshPacket) -> MeshResult<()> {
        self.log.lock().unwrap().push(packet);
        Ok(())
    }

    fn retransmission_delay(&self, _packet: &MeshPacket) -> Duration {
        Duration::from_millis(RETRY_MS)
    }
}

fn stack() -> (ReliableRouter<FloodRouter<TapRadio>>, TapRadio, ManualClock) {
    let clock = ManualClock::new();
    let radio = TapRadio::default();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let flood = FloodRouter::new(ME, radio.clone(), shared.clone(), &MeshConfig::default())
        .with_id_generator(PacketIdGenerator::starting_at(100));
    (ReliableRouter::new(flood, shared, 3), radio, clock)
}

fn reliable_text(to: NodeNum, id: u32) -> MeshPacket {
    let mut packet = MeshPacket::text(NodeNum::LOCAL, to, id, "payload");
    packet.want_ack = true;
    packet
}

#[test]
fn test_no_ack_means_two_resends_and_one_nak() {
    let (mut router, radio, clock) = stack();
    router.send(reliable_text(NodeNum::new(0x99), 7)).unwrap();

    let mut naks = Vec::new();
    for _ in 0..10 {
        clock.advance_millis(RETRY_MS);
        router.run_retransmission_tick();
        while let Some(p) = router.pop_loopback() {
            naks.push(p);
        }
    }

    let on_air: Vec<_> = radio.sent().into_iter().filter(|p| p.id == 7).collect();
    assert_eq!(on_air.len(), 3, "initial send plus two resends");
    assert!(on_air.iter().all(|p| p.from == ME));

    assert_eq!(naks.len(), 1);
    assert_eq!(naks[0].request_id(), 7);
    assert_eq!(naks[0].to, ME);
    assert_eq!(naks[0].routing().unwrap().error_reason, RoutingError::MaxRetransmit);
    assert_eq!(router.pending_count(), 0);
    assert_eq!(router.run_retransmission_tick(), None);
}

#[test]
fn test_overheard_rebroadcast_is_implicit_ack_once() {
    let (mut router, radio, clock) = stack();
    router.send(reliable_text(NodeNum::BROADCAST, 8)).unwrap();

    let mut relay = radio.sent()[0].clone();
    relay.hop_limit -= 1;

    // Two different neighbors relay the same packet
    router.should_filter_received(&relay);
    router.should_filter_received(&relay);

    let acks: Vec<_> = std::iter::from_fn(|| router.pop_loopback()).collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].routing().unwrap().error_reason, RoutingError::None);
    assert_eq!(acks[0].request_id(), 8);
    assert!(!router.is_pending(GlobalPacketId::new(ME, 8)));

    clock.advance_millis(5 * RETRY_MS);
    router.run_retransmission_tick();
    assert_eq!(radio.sent().len(), 1, "no resends after the implicit ack");
}

#[test]
fn test_stop_twice_second_reports_not_found() {
    let (mut router, _radio, _clock) = stack();
    router.send(reliable_text(NodeNum::new(0x99), 9)).unwrap();

    let key = GlobalPacketId::new(ME, 9);
    assert!(router.stop_retransmission(key));
    assert!(!router.stop_retransmission(key));
    assert_eq!(router.pending_count(), 0);
}

#[test]
fn test_explicit_ack_from_peer() {
    let (mut router, radio, clock) = stack();
    let peer = NodeNum::new(0x99);
    router.send(reliable_text(peer, 10)).unwrap();

    let ack = ack_nak_packet(
        MeshPacket {
            from: peer,
            id: 4000,
            ..MeshPacket::default()
        },
        RoutingError::None,
        ME,
        10,
    );
    assert!(!router.should_filter_received(&ack));
    router.sniff_received(&ack, ack.routing());
    assert_eq!(router.pending_count(), 0);

    clock.advance_millis(RETRY_MS);
    assert_eq!(router.run_retransmission_tick(), None);
    assert_eq!(radio.sent().len(), 1);
}

#[test]
fn test_ack_for_unknown_packet_is_harmless() {
    let (mut router, _radio, _clock) = stack();
    let ack = ack_nak_packet(
        MeshPacket {
            from: NodeNum::new(0x99),
            id: 4001,
            ..MeshPacket::default()
        },
        RoutingError::None,
        ME,
        12345,
    );
    router.sniff_received(&ack, ack.routing());
    assert_eq!(router.pending_count(), 0);
    assert_eq!(router.stats().acks_received, 1);
}

#[test]
fn test_star_network_delivers_and_acks() {
    let config = SimConfig::default()
        .with_node_count(4)
        .with_topology(Topology::Star);
    let mut sim = SimNetwork::new(config);

    let id = sim.send_text(1, Some(0), "to the hub", true).unwrap();
    assert!(sim.run_until_idle(1_000).is_some());

    let hub_got = sim
        .inbox(0)
        .iter()
        .any(|p| p.id == id && p.sender(sim.node_num(0)) == sim.node_num(1));
    assert!(hub_got);
    assert_eq!(sim.stats().router.naks_synthesized, 0);
}
