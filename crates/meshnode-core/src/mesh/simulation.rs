//! Multi-node mesh simulation
//!
//! This module runs several [`MeshService`] nodes against each other without
//! hardware. It models:
//!
//! - A shared simulated clock, advanced in fixed steps
//! - A static topology (chain, star or full mesh) with per-link control
//! - Random frame loss from a seeded RNG
//! - Airtime-based retransmission timing from the modem preset
//!
//! Frames are delivered within the step they are sent in; only the
//! retransmission timers depend on simulated time.
//!
//! ## Example
//!
//! ```ignore
//! use meshnode_core::mesh::simulation::{SimConfig, SimNetwork, Topology};
//!
//! let config = SimConfig::default()
//!     .with_node_count(5)
//!     .with_topology(Topology::Chain)
//!     .with_loss_rate(0.2);
//! let mut sim = SimNetwork::new(config);
//!
//! sim.send_text(0, None, "hello", true);
//! sim.run_until_idle(10_000);
//! sim.print_summary();
//! ```

use super::airtime::{AirtimeModel, ModemPreset};
use super::packet::{MeshPacket, NodeNum, PacketId};
use super::reliable::RouterStats;
use super::service::MeshService;
use super::traits::{MeshError, MeshResult, RadioInterface};
use crate::clock::{Clock, ManualClock, SystemClock};
use crate::config::MeshConfig;
use crate::persistence::MemoryStorage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Frames a simulated radio will queue before refusing more
pub const SIM_TX_QUEUE_SIZE: usize = 32;

/// Radio that queues frames in an outbox for the network to carry
pub struct SimRadio {
    outbox: VecDeque<MeshPacket>,
    airtime: AirtimeModel,
    clock: Arc<dyn Clock>,
    frames_sent: u64,
}

impl SimRadio {
    pub fn new(preset: ModemPreset, clock: Arc<dyn Clock>) -> Self {
        Self {
            outbox: VecDeque::new(),
            airtime: AirtimeModel::new(preset),
            clock,
            frames_sent: 0,
        }
    }

    /// Radio not attached to any network, on the system clock
    pub fn detached() -> Self {
        Self::new(ModemPreset::default(), Arc::new(SystemClock::new()))
    }

    /// Take every frame sent since the last call
    pub fn take_outbox(&mut self) -> Vec<MeshPacket> {
        self.outbox.drain(..).collect()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn airtime(&self) -> &AirtimeModel {
        &self.airtime
    }

    /// Percent of the last minute the channel was busy, as this radio saw it
    pub fn channel_utilization(&self) -> f32 {
        self.airtime.utilization_percent(self.clock.millis())
    }

    /// Account for a frame heard from a neighbor
    pub fn record_heard(&mut self, packet: &MeshPacket) {
        let airtime = self.airtime.airtime(packet.encoded_len());
        self.airtime.record_activity(self.clock.millis(), airtime);
    }
}

impl RadioInterface for SimRadio {
    fn send(&mut self, packet: MeshPacket) -> MeshResult<()> {
        if self.outbox.len() >= SIM_TX_QUEUE_SIZE {
            return Err(MeshError::QueueFull);
        }
        let airtime = self.airtime.airtime(packet.encoded_len());
        self.airtime.record_activity(self.clock.millis(), airtime);
        self.frames_sent += 1;
        self.outbox.push_back(packet);
        Ok(())
    }

    fn retransmission_delay(&self, packet: &MeshPacket) -> Duration {
        self.airtime
            .retransmission_delay(packet.encoded_len(), self.clock.millis())
    }
}

/// Static link layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// 0 - 1 - 2 - ... - n
    Chain,
    /// Node 0 hears everyone, the rest only hear node 0
    Star,
    /// Everyone hears everyone
    FullMesh,
}

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub node_count: usize,
    pub topology: Topology,
    /// Probability that a single frame on a single link is lost
    pub loss_rate: f64,
    pub seed: u64,
    /// Simulated time per step
    pub step_ms: u64,
    /// Wall-clock time at simulation start (epoch seconds)
    pub start_rtc: u32,
    pub mesh: MeshConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 3,
            topology: Topology::Chain,
            loss_rate: 0.0,
            seed: 42,
            step_ms: 250,
            start_rtc: 1_700_000_000,
            mesh: MeshConfig {
                no_save: true,
                ..MeshConfig::default()
            },
        }
    }
}

impl SimConfig {
    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_step_ms(mut self, step_ms: u64) -> Self {
        self.step_ms = step_ms.max(1);
        self
    }

    pub fn with_mesh_config(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }
}

/// Aggregate statistics
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub steps: u64,
    /// Frames put on the air
    pub frames_sent: u64,
    /// Frame receptions (one per listening neighbor)
    pub frames_received: u64,
    /// Frame receptions lost to the channel
    pub frames_lost: u64,
    /// Packets handed to applications
    pub app_deliveries: u64,
    /// Reliable delivery counters summed over all nodes
    pub router: RouterStats,
    /// Flood rebroadcasts summed over all nodes
    pub rebroadcasts: u64,
}

impl SimStats {
    /// Fraction of frame receptions not lost to the channel
    pub fn link_success_rate(&self) -> f64 {
        let total = self.frames_received + self.frames_lost;
        if total == 0 {
            0.0
        } else {
            self.frames_received as f64 / total as f64
        }
    }
}

/// Several nodes on a simulated channel
pub struct SimNetwork {
    config: SimConfig,
    clock: ManualClock,
    nodes: Vec<MeshService<SimRadio>>,
    storages: Vec<MemoryStorage>,
    /// `links[a][b]`: b hears a
    links: Vec<Vec<bool>>,
    rng: StdRng,
    /// Everything each node's application received, in order
    inboxes: Vec<Vec<MeshPacket>>,
    stats: SimStats,
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Self {
        let clock = ManualClock::with_rtc(config.start_rtc);
        let n = config.node_count;

        let mut nodes = Vec::with_capacity(n);
        let mut storages = Vec::with_capacity(n);
        for i in 0..n {
            let storage = MemoryStorage::new();
            let radio = SimRadio::new(config.mesh.modem_preset, Arc::new(clock.clone()));
            nodes.push(MeshService::init(
                config.mesh.clone(),
                radio,
                Arc::new(clock.clone()),
                Box::new(storage.clone()),
                Self::mac_for(i),
            ));
            storages.push(storage);
        }

        let mut links = vec![vec![false; n]; n];
        for a in 0..n {
            for b in 0..n {
                if a == b {
                    continue;
                }
                links[a][b] = match config.topology {
                    Topology::Chain => a.abs_diff(b) == 1,
                    Topology::Star => a == 0 || b == 0,
                    Topology::FullMesh => true,
                };
            }
        }

        debug!(nodes = n, topology = ?config.topology, "Simulation initialized");

        Self {
            rng: StdRng::seed_from_u64(config.seed),
            clock,
            nodes,
            storages,
            links,
            inboxes: vec![Vec::new(); n],
            stats: SimStats::default(),
            config,
        }
    }

    /// Hardware address of node `idx`; its node number is 0x1000_0000 + idx + 1
    pub fn mac_for(idx: usize) -> [u8; 6] {
        let n = (idx + 1) as u16;
        [0x02, 0x00, 0x10, 0x00, (n >> 8) as u8, n as u8]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// # Panics
    ///
    /// Panics if `idx` is not a node of this network.
    pub fn node(&self, idx: usize) -> &MeshService<SimRadio> {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut MeshService<SimRadio> {
        &mut self.nodes[idx]
    }

    pub fn node_num(&self, idx: usize) -> NodeNum {
        self.nodes[idx].node_num()
    }

    pub fn storage(&self, idx: usize) -> &MemoryStorage {
        &self.storages[idx]
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Packets node `idx`'s application has received so far
    pub fn inbox(&self, idx: usize) -> &[MeshPacket] {
        &self.inboxes[idx]
    }

    /// Bring a link up or down in both directions
    pub fn set_link(&mut self, a: usize, b: usize, up: bool) {
        self.links[a][b] = up;
        self.links[b][a] = up;
    }

    /// Send a text from node `from`. `to = None` broadcasts.
    ///
    /// Indexes outside the network are rejected with `InvalidPacket`.
    pub fn send_text(
        &mut self,
        from: usize,
        to: Option<usize>,
        text: &str,
        want_ack: bool,
    ) -> MeshResult<PacketId> {
        if let Some(bad) = [Some(from), to].into_iter().flatten().find(|i| *i >= self.nodes.len()) {
            return Err(MeshError::InvalidPacket(format!(
                "no node {} in a {}-node network",
                bad,
                self.nodes.len()
            )));
        }
        let dest = to.map(|i| self.node_num(i)).unwrap_or(NodeNum::BROADCAST);
        let id = self.nodes[from].send_text(dest, text, want_ack)?;
        self.propagate();
        self.collect_inboxes();
        Ok(id)
    }

    /// Advance time one step and run every node once
    pub fn step(&mut self) {
        self.clock.advance_millis(self.config.step_ms);
        self.stats.steps += 1;

        for node in &mut self.nodes {
            node.run_once();
        }
        self.propagate();
        self.collect_inboxes();
    }

    /// Step until no node has pending retransmissions. Returns the steps
    /// taken, or `None` if still busy after `max_steps`.
    pub fn run_until_idle(&mut self, max_steps: u64) -> Option<u64> {
        for taken in 0..max_steps {
            if self.is_idle() {
                return Some(taken);
            }
            self.step();
        }
        self.is_idle().then_some(max_steps)
    }

    pub fn is_idle(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| n.router().pending_count() == 0 && n.router().loopback_len() == 0)
    }

    /// Carry frames until no radio has anything left to send
    fn propagate(&mut self) {
        // Every relay decrements the hop limit and dedups, so this ends
        for _round in 0..64 {
            let mut on_air = Vec::new();
            for (src, node) in self.nodes.iter_mut().enumerate() {
                for frame in node.radio_mut().take_outbox() {
                    on_air.push((src, frame));
                }
            }
            if on_air.is_empty() {
                return;
            }

            self.stats.frames_sent += on_air.len() as u64;
            for (src, frame) in on_air {
                for dst in 0..self.nodes.len() {
                    if !self.links[src][dst] {
                        continue;
                    }
                    if self.rng.gen::<f64>() < self.config.loss_rate {
                        trace!(src, dst, id = frame.id, "Frame lost");
                        self.stats.frames_lost += 1;
                        continue;
                    }

                    let mut rx = frame.clone();
                    rx.rx_time = self.clock.rtc_secs();
                    rx.rx_snr = self.rng.gen_range(-5.0..10.0);
                    self.stats.frames_received += 1;

                    let node = &mut self.nodes[dst];
                    node.radio_mut().record_heard(&rx);
                    node.handle_from_radio(rx);
                }
            }
        }
    }

    fn collect_inboxes(&mut self) {
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            let received = node.drain_received();
            self.stats.app_deliveries += received.len() as u64;
            self.inboxes[idx].extend(received);
        }
    }

    /// Statistics including per-node router counters
    pub fn stats(&self) -> SimStats {
        let mut stats = self.stats.clone();
        let mut router = RouterStats::default();
        for node in &self.nodes {
            let s = node.router().stats();
            router.reliable_sends += s.reliable_sends;
            router.retransmissions += s.retransmissions;
            router.acks_sent += s.acks_sent;
            router.naks_sent += s.naks_sent;
            router.implicit_acks += s.implicit_acks;
            router.naks_synthesized += s.naks_synthesized;
            router.acks_received += s.acks_received;
            router.naks_received += s.naks_received;
            router.duplicates_dropped += s.duplicates_dropped;
            stats.rebroadcasts += node.router().base().stats().rebroadcasts;
        }
        stats.router = router;
        stats
    }

    /// Print simulation summary
    pub fn print_summary(&self) {
        let stats = self.stats();
        println!("\n=== Mesh Simulation Summary ===");
        println!("Steps: {}", stats.steps);
        println!("Nodes: {}", self.nodes.len());
        println!("Simulated time: {:.1}s", self.clock.millis() as f64 / 1000.0);
        println!();
        println!("Frames:");
        println!("  Sent: {}", stats.frames_sent);
        println!("  Received: {}", stats.frames_received);
        println!("  Lost: {}", stats.frames_lost);
        println!("  Link success: {:.1}%", stats.link_success_rate() * 100.0);
        println!("  Rebroadcasts: {}", stats.rebroadcasts);
        println!();
        println!("Reliable delivery:");
        println!("  Reliable sends: {}", stats.router.reliable_sends);
        println!("  Retransmissions: {}", stats.router.retransmissions);
        println!("  Acks sent: {}", stats.router.acks_sent);
        println!("  Implicit acks: {}", stats.router.implicit_acks);
        println!("  Naks synthesized: {}", stats.router.naks_synthesized);
        println!("  Duplicates dropped: {}", stats.router.duplicates_dropped);
        println!();
        println!("Per-node:");
        for (idx, node) in self.nodes.iter().enumerate() {
            println!(
                "  [{}] {} db={} inbox={} pending={} util={:.1}%",
                idx,
                node.node_num(),
                node.node_db().len(),
                self.inboxes[idx].len(),
                node.router().pending_count(),
                node.radio().channel_utilization()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::packet::{AppMessage, RoutingError};

    fn texts(inbox: &[MeshPacket]) -> Vec<String> {
        inbox
            .iter()
            .filter_map(|p| match &p.decoded_data()?.message {
                AppMessage::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_node_numbers_from_mac() {
        let sim = SimNetwork::new(SimConfig::default());
        assert_eq!(sim.node_num(0), NodeNum::new(0x1000_0001));
        assert_eq!(sim.node_num(2), NodeNum::new(0x1000_0003));
    }

    #[test]
    fn test_sim_radio_queue_limit() {
        let mut radio = SimRadio::new(ModemPreset::ShortFast, Arc::new(ManualClock::new()));
        for _ in 0..SIM_TX_QUEUE_SIZE {
            radio.send(MeshPacket::default()).unwrap();
        }
        assert_eq!(radio.send(MeshPacket::default()), Err(MeshError::QueueFull));
        assert_eq!(radio.take_outbox().len(), SIM_TX_QUEUE_SIZE);
        assert!(radio.send(MeshPacket::default()).is_ok());
        assert!(radio.channel_utilization() > 0.0);
    }

    #[test]
    fn test_send_text_rejects_unknown_node() {
        let mut sim = SimNetwork::new(SimConfig::default());
        assert!(matches!(
            sim.send_text(3, None, "x", false),
            Err(MeshError::InvalidPacket(_))
        ));
        assert!(matches!(
            sim.send_text(0, Some(7), "x", true),
            Err(MeshError::InvalidPacket(_))
        ));
        assert!(sim.is_idle());
        assert_eq!(sim.stats().frames_sent, 0);
    }

    #[test]
    fn test_broadcast_floods_chain() {
        let mut sim = SimNetwork::new(SimConfig::default().with_node_count(4));
        sim.send_text(0, None, "flood", false).unwrap();

        for idx in 1..4 {
            assert_eq!(texts(sim.inbox(idx)), vec!["flood".to_string()]);
        }
        // The sender's own app does not get its text back
        assert!(texts(sim.inbox(0)).is_empty());
    }

    #[test]
    fn test_reliable_broadcast_implicit_ack() {
        let mut sim = SimNetwork::new(SimConfig::default().with_node_count(3));
        let id = sim.send_text(0, None, "hello", true).unwrap();

        // Node 1 relays, node 0 hears it: implicit ack
        assert_eq!(sim.node(0).router().pending_count(), 0);
        assert!(sim.run_until_idle(100).is_some());

        let acks: Vec<_> = sim
            .inbox(0)
            .iter()
            .filter(|p| p.request_id() == id)
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].routing().unwrap().error_reason, RoutingError::None);
        assert_eq!(sim.stats().router.implicit_acks, 1);
        assert_eq!(sim.stats().router.retransmissions, 0);
    }

    #[test]
    fn test_unicast_explicit_ack() {
        let mut sim = SimNetwork::new(SimConfig::default().with_node_count(2));
        sim.send_text(0, Some(1), "direct", true).unwrap();

        assert_eq!(texts(sim.inbox(1)), vec!["direct".to_string()]);
        assert_eq!(sim.node(0).router().pending_count(), 0);
        assert_eq!(sim.stats().router.acks_received, 1);
    }

    #[test]
    fn test_unreachable_destination_naks() {
        let mut sim = SimNetwork::new(SimConfig::default().with_node_count(2));
        sim.set_link(0, 1, false);
        let id = sim.send_text(0, Some(1), "lost", true).unwrap();

        assert!(sim.run_until_idle(10_000).is_some());
        let stats = sim.stats();
        assert_eq!(stats.router.retransmissions, 2);
        assert_eq!(stats.router.naks_synthesized, 1);

        let nak = sim
            .inbox(0)
            .iter()
            .find(|p| p.request_id() == id)
            .unwrap();
        assert_eq!(nak.routing().unwrap().error_reason, RoutingError::MaxRetransmit);
    }

    #[test]
    fn test_lossy_network_settles() {
        let config = SimConfig::default()
            .with_node_count(5)
            .with_topology(Topology::FullMesh)
            .with_loss_rate(0.3)
            .with_seed(7);
        let mut sim = SimNetwork::new(config);
        for i in 0..5 {
            sim.send_text(i, Some((i + 1) % 5), "hi", true).unwrap();
        }
        assert!(sim.run_until_idle(20_000).is_some());
        assert!(sim.stats().frames_lost > 0);
    }
}
