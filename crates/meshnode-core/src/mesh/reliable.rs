//! Reliable delivery
//!
//! [`ReliableRouter`] wraps a base [`Router`] and adds bounded automatic
//! retransmission for packets that set `want_ack`. Each in-flight packet
//! owns a copy of itself in the pending table, keyed by (originating node,
//! packet id):
//!
//! ```text
//!            send(want_ack)
//!                 │
//!                 ▼
//!   ┌───────────────────────────┐  deadline passed,   ┌──────────────┐
//!   │ Armed (retries_left > 0)  │─────────────────────▶│   Retrying   │
//!   │                           │◀─────────────────────│ resend, dec  │
//!   └───────────────────────────┘    rescheduled       └──────────────┘
//!        │                 │
//!   ack / nak /       deadline passed,
//!   implicit ack      retries_left == 0
//!        │                 │
//!        ▼                 ▼
//!   ┌─────────┐     ┌───────────────────────────────┐
//!   │ removed │     │ Exhausted: nak(MaxRetransmit) │
//!   └─────────┘     │ delivered locally, removed    │
//!                   └───────────────────────────────┘
//! ```
//!
//! Implicit ack: hearing a neighbor rebroadcast one of our own broadcasts
//! proves it was received, so the pending record is dropped and a local
//! ack is generated.
//!
//! The router never sleeps or spawns anything. The caller drives
//! [`ReliableRouter::run_retransmission_tick`] and sleeps for the delay it
//! returns.

use super::packet::{MeshPacket, NodeNum, PacketId, Routing, RoutingError};
use super::packet_id::GlobalPacketId;
use super::routing_control::ack_nak_packet;
use super::traits::{MeshError, MeshResult, Router};
use crate::clock::Clock;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// An in-flight reliable packet
#[derive(Debug, Clone)]
pub struct PendingPacket {
    /// Owned copy of what was sent; resends are clones of this
    pub packet: MeshPacket,
    /// Resends still allowed before giving up
    pub retries_left: u8,
    /// Monotonic deadline of the next resend (ms)
    pub next_tx_ms: u64,
}

/// Reliable delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Packets registered for retransmission
    pub reliable_sends: u64,
    /// Resends performed after a timeout
    pub retransmissions: u64,
    /// Acks we generated (explicit and implicit)
    pub acks_sent: u64,
    /// Naks we generated
    pub naks_sent: u64,
    /// Pending records removed because a rebroadcast was overheard
    pub implicit_acks: u64,
    /// Naks synthesized after the last attempt timed out
    pub naks_synthesized: u64,
    /// Acks received for our packets
    pub acks_received: u64,
    /// Naks received for our packets
    pub naks_received: u64,
    /// Inbound packets dropped as duplicates
    pub duplicates_dropped: u64,
}

/// Retransmitting router layered over a base router
pub struct ReliableRouter<R: Router> {
    base: R,
    pending: HashMap<GlobalPacketId, PendingPacket>,
    clock: Arc<dyn Clock>,
    /// Total attempts per reliable packet, initial send included
    num_retransmissions: u8,
    /// Packets we sent to ourselves, awaiting local processing
    loopback: VecDeque<MeshPacket>,
    /// An application already replied to the packet being handled
    current_reply: bool,
    stats: RouterStats,
}

impl<R: Router> ReliableRouter<R> {
    pub fn new(base: R, clock: Arc<dyn Clock>, num_retransmissions: u8) -> Self {
        Self {
            base,
            pending: HashMap::new(),
            clock,
            num_retransmissions,
            loopback: VecDeque::new(),
            current_reply: false,
            stats: RouterStats::default(),
        }
    }

    pub fn base(&self) -> &R {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut R {
        &mut self.base
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Number of packets still awaiting an ack
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: GlobalPacketId) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn pending(&self, key: GlobalPacketId) -> Option<&PendingPacket> {
        self.pending.get(&key)
    }

    /// Mark whether an application has already answered the packet
    /// currently being handled. Suppresses our own explicit ack.
    pub fn set_current_reply(&mut self, replied: bool) {
        self.current_reply = replied;
    }

    /// Stop retransmitting `key`. Returns `false` if it was not pending.
    pub fn stop_retransmission(&mut self, key: GlobalPacketId) -> bool {
        self.pending.remove(&key).is_some()
    }

    /// Next packet sent to ourselves, if any
    pub fn pop_loopback(&mut self) -> Option<MeshPacket> {
        self.loopback.pop_front()
    }

    pub fn loopback_len(&self) -> usize {
        self.loopback.len()
    }

    /// Send a locally generated packet.
    ///
    /// Packets for this node never reach the radio; they are queued for
    /// local processing instead. Broadcasts are queued locally as well as
    /// sent, so local applications see what this node broadcasts.
    pub fn send_local(&mut self, packet: MeshPacket) -> MeshResult<()> {
        let me = self.node_num();
        if packet.to == me {
            debug!(id = packet.id, "Enqueued local");
            self.loopback.push_back(packet);
            return Ok(());
        }
        if packet.is_broadcast() {
            self.loopback.push_back(packet.clone());
        }
        self.send(packet)
    }

    /// Build and send an ack (`RoutingError::None`) or nak for `request_id`.
    pub fn send_ack_nak(
        &mut self,
        error: RoutingError,
        to: NodeNum,
        request_id: PacketId,
    ) -> MeshResult<()> {
        let packet = ack_nak_packet(self.base.alloc_for_sending(), error, to, request_id);
        debug!(
            err = ?error,
            to = %to,
            id_from = request_id,
            id = packet.id,
            "Sending an ack/nak"
        );

        if error == RoutingError::None {
            self.stats.acks_sent += 1;
        } else {
            self.stats.naks_sent += 1;
        }
        self.send_local(packet)
    }

    fn send_ack_nak_logged(&mut self, error: RoutingError, to: NodeNum, request_id: PacketId) {
        if let Err(e) = self.send_ack_nak(error, to, request_id) {
            warn!(error = %e, to = %to, request_id, "Failed to send ack/nak");
        }
    }

    /// Register `packet` for retransmission, replacing any stale record
    /// with the same key.
    fn start_retransmission(&mut self, packet: MeshPacket) -> MeshResult<()> {
        let key = GlobalPacketId::of(&packet, self.node_num());
        if self.stop_retransmission(key) {
            debug!(?key, "Replacing stale retransmission record, packet id reused");
        }

        let delay = self.base.retransmission_delay(&packet);
        let record = PendingPacket {
            packet,
            retries_left: self.num_retransmissions.saturating_sub(1),
            next_tx_ms: self.clock.millis() + delay.as_millis() as u64,
        };
        debug!(?key, delay_ms = delay.as_millis() as u64, "Setting next retransmission");

        match self.pending.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                self.stats.reliable_sends += 1;
                Ok(())
            }
            Entry::Occupied(_) => {
                debug_assert!(false, "pending record {:?} survived removal", key);
                Err(MeshError::Invariant(format!(
                    "pending record {:?} survived removal",
                    key
                )))
            }
        }
    }

    /// Resend or give up on every pending packet whose deadline has passed.
    ///
    /// Returns the time until the earliest remaining deadline, or `None`
    /// when nothing is pending.
    pub fn run_retransmission_tick(&mut self) -> Option<Duration> {
        let now = self.clock.millis();
        let me = self.node_num();

        let due: Vec<GlobalPacketId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.next_tx_ms <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in due {
            let Some(record) = self.pending.get_mut(&key) else {
                continue;
            };

            if record.retries_left == 0 {
                let (to, id) = (record.packet.sender(me), record.packet.id);
                debug!(
                    from = %record.packet.from,
                    to = %record.packet.to,
                    id,
                    "Reliable send failed, returning a nak"
                );
                self.stats.naks_synthesized += 1;
                self.send_ack_nak_logged(RoutingError::MaxRetransmit, to, id);
                self.stop_retransmission(key);
            } else {
                debug!(
                    ?key,
                    tries_left = record.retries_left,
                    "Sending reliable retransmission"
                );
                let copy = record.packet.clone();
                record.retries_left -= 1;
                let delay = self.base.retransmission_delay(&record.packet);
                record.next_tx_ms = now + delay.as_millis() as u64;

                self.stats.retransmissions += 1;
                // Base send: a resend must not create a new pending record
                if let Err(e) = self.base.send(copy) {
                    warn!(error = %e, ?key, "Retransmission failed");
                }
            }
        }

        self.next_wake()
    }

    /// Time until the earliest pending deadline, `None` when idle
    pub fn next_wake(&self) -> Option<Duration> {
        let now = self.clock.millis();
        self.pending
            .values()
            .map(|p| p.next_tx_ms.saturating_sub(now))
            .min()
            .map(Duration::from_millis)
    }
}

impl<R: Router> Router for ReliableRouter<R> {
    fn node_num(&self) -> NodeNum {
        self.base.node_num()
    }

    fn send(&mut self, mut packet: MeshPacket) -> MeshResult<()> {
        if packet.want_ack {
            // At least one neighbor has to rebroadcast for an implicit ack
            if packet.is_broadcast() && packet.hop_limit == 0 {
                packet.hop_limit = 1;
            }
            self.start_retransmission(packet.clone())?;
        }
        self.base.send(packet)
    }

    fn should_filter_received(&mut self, packet: &MeshPacket) -> bool {
        let me = self.node_num();

        // Raw `from`: packets from the local app are not rebroadcasts
        if packet.is_broadcast() && packet.from == me {
            debug!(id = packet.id, "Rx someone rebroadcasting for us");
            if self.stop_retransmission(GlobalPacketId::new(me, packet.id)) {
                debug!(id = packet.id, "Generating implicit ack");
                self.stats.implicit_acks += 1;
                self.send_ack_nak_logged(RoutingError::None, me, packet.id);
            }
        }

        let filtered = self.base.should_filter_received(packet);
        if filtered {
            self.stats.duplicates_dropped += 1;
        }
        filtered
    }

    fn sniff_received(&mut self, packet: &MeshPacket, routing: Option<&Routing>) {
        let me = self.node_num();

        // Only 0-hop reliability: ignore acks and want_ack not addressed to us
        if packet.to == me {
            if packet.want_ack {
                if self.current_reply {
                    debug!(id = packet.id, "Someone else has replied to this message, no need for a 2nd ack");
                } else {
                    self.send_ack_nak_logged(RoutingError::None, packet.sender(me), packet.id);
                }
            }

            // An ack is a non-routing packet with a request id, or a routing
            // packet without error. A nak is a routing packet with an error.
            let request_id = packet.request_id();
            let is_nak = routing.map(|r| !r.is_ack()).unwrap_or(false);

            if request_id != 0 {
                if is_nak {
                    debug!(request_id, "Received a nak, stopping retransmissions");
                    self.stats.naks_received += 1;
                } else {
                    debug!(request_id, "Received an ack, stopping retransmissions");
                    self.stats.acks_received += 1;
                }
                // Removing a record that is not there is harmless
                self.stop_retransmission(GlobalPacketId::new(packet.to, request_id));
            }
        }

        self.base.sniff_received(packet, routing);
    }

    fn alloc_for_sending(&mut self) -> MeshPacket {
        self.base.alloc_for_sending()
    }

    fn retransmission_delay(&self, packet: &MeshPacket) -> Duration {
        self.base.retransmission_delay(packet)
    }
}
