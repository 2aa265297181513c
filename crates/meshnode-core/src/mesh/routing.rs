//! Flooding transport
//!
//! The base router the reliable layer builds on. Every node rebroadcasts
//! broadcasts it has not seen before, with a decremented hop limit, and
//! drops anything already in its packet history:
//!
//! 1. Outbound packets are recorded as seen so our own rebroadcast echoes
//!    are filtered.
//! 2. Inbound packets already in the history are dropped.
//! 3. Surviving broadcasts from other nodes with hops left and a nonzero id
//!    are rebroadcast once.

use super::packet::{MeshPacket, NodeNum, Payload, Routing};
use super::packet_id::{GlobalPacketId, PacketIdGenerator};
use super::traits::{MeshResult, RadioInterface, Router};
use crate::clock::Clock;
use crate::config::MeshConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Recently seen packets, keyed by (originating node, packet id).
#[derive(Debug)]
pub struct PacketHistory {
    /// Seen packet keys -> time first seen (monotonic ms)
    seen: HashMap<GlobalPacketId, u64>,
    /// Lifetime of an entry
    ttl_ms: u64,
    /// Maximum history size
    max_size: usize,
    /// Time of last cleanup
    last_cleanup_ms: u64,
}

impl PacketHistory {
    pub fn new(ttl_ms: u64, max_size: usize) -> Self {
        Self {
            seen: HashMap::new(),
            ttl_ms,
            max_size,
            last_cleanup_ms: 0,
        }
    }

    /// Check whether `key` was seen within the TTL, recording it if not.
    ///
    /// Packets with id 0 are never tracked and never count as seen.
    pub fn was_seen_recently(&mut self, key: GlobalPacketId, now_ms: u64) -> bool {
        if key.id == 0 {
            return false;
        }
        self.maybe_cleanup(now_ms);

        if let Some(first_seen) = self.seen.get(&key) {
            if now_ms.saturating_sub(*first_seen) < self.ttl_ms {
                return true;
            }
        }

        if self.seen.len() >= self.max_size {
            self.cleanup(now_ms);
            if self.seen.len() >= self.max_size {
                self.evict_oldest();
            }
        }
        self.seen.insert(key, now_ms);
        false
    }

    /// Check without recording
    pub fn contains(&self, key: GlobalPacketId, now_ms: u64) -> bool {
        self.seen
            .get(&key)
            .map(|t| now_ms.saturating_sub(*t) < self.ttl_ms)
            .unwrap_or(false)
    }

    /// Remove expired entries
    pub fn cleanup(&mut self, now_ms: u64) {
        let ttl = self.ttl_ms;
        self.seen.retain(|_, t| now_ms.saturating_sub(*t) < ttl);
        self.last_cleanup_ms = now_ms;
    }

    fn maybe_cleanup(&mut self, now_ms: u64) {
        // Cleanup every 30 seconds
        if now_ms.saturating_sub(self.last_cleanup_ms) > 30_000 {
            self.cleanup(now_ms);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .seen
            .iter()
            .min_by_key(|(_, t)| **t)
            .map(|(k, _)| *k)
        {
            self.seen.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for PacketHistory {
    fn default() -> Self {
        Self::new(crate::config::FLOOD_EXPIRE_TIME_MS, 256)
    }
}

/// Counters kept by the flooding layer
#[derive(Debug, Clone, Default)]
pub struct FloodStats {
    /// Packets handed to the radio (including rebroadcasts)
    pub packets_sent: u64,
    /// Received broadcasts we relayed
    pub rebroadcasts: u64,
    /// Inbound packets dropped as already seen
    pub duplicates_dropped: u64,
    /// Radio send failures
    pub send_failures: u64,
}

/// Flooding router over a radio interface
pub struct FloodRouter<R: RadioInterface> {
    node_num: NodeNum,
    radio: R,
    history: PacketHistory,
    ids: PacketIdGenerator,
    /// Hop limit for packets we originate
    hop_limit: u8,
    clock: Arc<dyn Clock>,
    stats: FloodStats,
}

impl<R: RadioInterface> FloodRouter<R> {
    pub fn new(node_num: NodeNum, radio: R, clock: Arc<dyn Clock>, config: &MeshConfig) -> Self {
        Self {
            node_num,
            radio,
            history: PacketHistory::new(config.flood_expire_ms, config.dedup_capacity),
            ids: PacketIdGenerator::new(),
            hop_limit: config.hop_limit,
            clock,
            stats: FloodStats::default(),
        }
    }

    /// Replace the packet id source (deterministic ids in tests)
    pub fn with_id_generator(mut self, ids: PacketIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn history(&self) -> &PacketHistory {
        &self.history
    }

    pub fn stats(&self) -> &FloodStats {
        &self.stats
    }

    /// Next packet id from this node
    pub fn generate_packet_id(&mut self) -> u32 {
        self.ids.next_id()
    }

    /// Hand a packet to the radio without touching the history.
    fn send_raw(&mut self, mut packet: MeshPacket) -> MeshResult<()> {
        packet.from = packet.sender(self.node_num);
        if packet.is_broadcast() {
            // Nobody acks a broadcast over the air
            packet.want_ack = false;
        }

        trace!(
            from = %packet.from,
            to = %packet.to,
            id = packet.id,
            hop_limit = packet.hop_limit,
            "Sending packet"
        );

        match self.radio.send(packet) {
            Ok(()) => {
                self.stats.packets_sent += 1;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Radio send failed");
                self.stats.send_failures += 1;
                Err(e)
            }
        }
    }
}

impl<R: RadioInterface> Router for FloodRouter<R> {
    fn node_num(&self) -> NodeNum {
        self.node_num
    }

    fn send(&mut self, packet: MeshPacket) -> MeshResult<()> {
        // Remember it so we don't rebroadcast our own packet when it echoes back
        let key = GlobalPacketId::of(&packet, self.node_num);
        self.history.was_seen_recently(key, self.clock.millis());
        self.send_raw(packet)
    }

    fn should_filter_received(&mut self, packet: &MeshPacket) -> bool {
        let key = GlobalPacketId::of(packet, self.node_num);
        if self.history.was_seen_recently(key, self.clock.millis()) {
            debug!(?key, "Ignoring incoming msg, already seen");
            self.stats.duplicates_dropped += 1;
            return true;
        }
        false
    }

    fn sniff_received(&mut self, packet: &MeshPacket, _routing: Option<&Routing>) {
        if !packet.is_broadcast() || packet.hop_limit == 0 {
            return;
        }
        if packet.sender(self.node_num) == self.node_num {
            return;
        }
        if packet.id == 0 {
            debug!("Ignoring a simple (0 id) broadcast");
            return;
        }

        let mut relay = packet.clone();
        relay.decrement_hop_limit();
        debug!(id = packet.id, hop_limit = relay.hop_limit, "Rebroadcasting received floodmsg");

        // Already in the history from the filter step
        if self.send_raw(relay).is_ok() {
            self.stats.rebroadcasts += 1;
        }
    }

    fn alloc_for_sending(&mut self) -> MeshPacket {
        MeshPacket {
            from: self.node_num,
            to: NodeNum::BROADCAST,
            id: self.ids.next_id(),
            hop_limit: self.hop_limit,
            rx_time: self.clock.rtc_secs(),
            payload: Payload::default(),
            ..MeshPacket::default()
        }
    }

    fn retransmission_delay(&self, packet: &MeshPacket) -> Duration {
        self.radio.retransmission_delay(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mesh::traits::MeshError;

    #[derive(Default)]
    struct RecordingRadio {
        sent: Vec<MeshPacket>,
        fail: bool,
    }

    impl RadioInterface for RecordingRadio {
        fn send(&mut self, packet: MeshPacket) -> MeshResult<()> {
            if self.fail {
                return Err(MeshError::Radio("tx busy".into()));
            }
            self.sent.push(packet);
            Ok(())
        }

        fn retransmission_delay(&self, _packet: &MeshPacket) -> Duration {
            Duration::from_secs(5)
        }
    }

    fn router(clock: &ManualClock) -> FloodRouter<RecordingRadio> {
        FloodRouter::new(
            NodeNum::new(0x10),
            RecordingRadio::default(),
            Arc::new(clock.clone()),
            &MeshConfig::default(),
        )
        .with_id_generator(PacketIdGenerator::starting_at(0))
    }

    #[test]
    fn test_packet_history() {
        let mut history = PacketHistory::new(1000, 16);
        let key = GlobalPacketId::new(NodeNum::new(1), 7);

        assert!(!history.was_seen_recently(key, 0));
        assert!(history.was_seen_recently(key, 500));
        assert!(history.contains(key, 999));
        // Expired: counts as new again
        assert!(!history.was_seen_recently(key, 1500));
    }

    #[test]
    fn test_packet_history_ignores_zero_id() {
        let mut history = PacketHistory::default();
        let key = GlobalPacketId::new(NodeNum::new(1), 0);
        assert!(!history.was_seen_recently(key, 0));
        assert!(!history.was_seen_recently(key, 1));
        assert!(history.is_empty());
    }

    #[test]
    fn test_packet_history_bounded() {
        let mut history = PacketHistory::new(60_000, 4);
        for id in 1..=10 {
            history.was_seen_recently(GlobalPacketId::new(NodeNum::new(1), id), id as u64);
        }
        assert_eq!(history.len(), 4);
        assert!(history.contains(GlobalPacketId::new(NodeNum::new(1), 10), 10));
    }

    #[test]
    fn test_send_fills_from_and_clears_broadcast_ack() {
        let clock = ManualClock::new();
        let mut router = router(&clock);

        let mut packet = MeshPacket::text(NodeNum::LOCAL, NodeNum::BROADCAST, 5, "hi");
        packet.want_ack = true;
        router.send(packet.clone()).unwrap();

        let sent = &router.radio().sent[0];
        assert_eq!(sent.from, NodeNum::new(0x10));
        assert!(!sent.want_ack);

        // Our own echo is filtered
        assert!(router.should_filter_received(&packet));
    }

    #[test]
    fn test_unicast_keeps_want_ack() {
        let clock = ManualClock::new();
        let mut router = router(&clock);

        let mut packet = MeshPacket::text(NodeNum::LOCAL, NodeNum::new(0x20), 6, "hi");
        packet.want_ack = true;
        router.send(packet).unwrap();
        assert!(router.radio().sent[0].want_ack);
    }

    #[test]
    fn test_rebroadcast_rules() {
        let clock = ManualClock::new();
        let mut router = router(&clock);

        let mut packet = MeshPacket::text(NodeNum::new(0x30), NodeNum::BROADCAST, 9, "flood");
        packet.hop_limit = 2;
        assert!(!router.should_filter_received(&packet));
        router.sniff_received(&packet, None);
        assert_eq!(router.radio().sent.len(), 1);
        assert_eq!(router.radio().sent[0].hop_limit, 1);
        assert_eq!(router.stats().rebroadcasts, 1);

        // Duplicate is filtered before it can be relayed again
        assert!(router.should_filter_received(&packet));

        // No hops left
        let mut last_hop = packet.clone();
        last_hop.id = 10;
        last_hop.hop_limit = 0;
        router.sniff_received(&last_hop, None);

        // Zero id
        let mut simple = packet.clone();
        simple.id = 0;
        router.sniff_received(&simple, None);

        // Addressed to someone
        let mut direct = packet.clone();
        direct.id = 11;
        direct.to = NodeNum::new(0x10);
        router.sniff_received(&direct, None);

        // Our own
        let mut own = packet.clone();
        own.id = 12;
        own.from = NodeNum::new(0x10);
        router.sniff_received(&own, None);

        assert_eq!(router.radio().sent.len(), 1);
    }

    #[test]
    fn test_alloc_for_sending() {
        let clock = ManualClock::with_rtc(1_700_000_000);
        let mut router = router(&clock);

        let a = router.alloc_for_sending();
        let b = router.alloc_for_sending();
        assert_eq!(a.from, NodeNum::new(0x10));
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.hop_limit, crate::config::HOP_RELIABLE);
        assert_eq!(a.rx_time, 1_700_000_000);
    }

    #[test]
    fn test_radio_failure_propagates() {
        let clock = ManualClock::new();
        let mut router = router(&clock);
        router.radio_mut().fail = true;

        let packet = MeshPacket::text(NodeNum::LOCAL, NodeNum::BROADCAST, 5, "hi");
        assert_eq!(
            router.send(packet),
            Err(MeshError::Radio("tx busy".into()))
        );
        assert_eq!(router.stats().send_failures, 1);
    }
}
