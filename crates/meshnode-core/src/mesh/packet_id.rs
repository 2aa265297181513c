//! Packet identity
//!
//! Packet ids only need to be unique per originating node within the
//! retransmission and dedup windows, so they come from a per-boot sequence
//! with a random starting point. A packet is identified mesh-wide by the
//! pair (originating node, packet id).

use super::packet::{MeshPacket, NodeNum, PacketId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of distinct ids handed out before wrapping
const NUM_PACKET_IDS: u32 = 0x7FFF;

/// Sequential packet id source.
///
/// Ids fall in `1..=0x7FFF`; 0 is reserved for packets that are never
/// rebroadcast or acknowledged.
#[derive(Debug, Clone)]
pub struct PacketIdGenerator {
    counter: u32,
}

impl PacketIdGenerator {
    /// Start at a random point so repeated reboots don't reuse the same ids.
    pub fn new() -> Self {
        Self::with_rng(&mut rand::thread_rng())
    }

    pub fn with_rng<G: Rng + ?Sized>(rng: &mut G) -> Self {
        Self {
            counter: rng.gen_range(0..NUM_PACKET_IDS),
        }
    }

    /// Generator whose next id is deterministic (`start % 0x7FFF + 1`)
    pub fn starting_at(start: u32) -> Self {
        Self {
            counter: start % NUM_PACKET_IDS,
        }
    }

    pub fn next_id(&mut self) -> PacketId {
        let id = self.counter + 1;
        self.counter = (self.counter + 1) % NUM_PACKET_IDS;
        id
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Mesh-wide packet identity: originating node plus its packet id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalPacketId {
    pub node: NodeNum,
    pub id: PacketId,
}

impl GlobalPacketId {
    pub fn new(node: NodeNum, id: PacketId) -> Self {
        Self { node, id }
    }

    /// Identity of `packet`, attributing locally injected packets to `local`.
    pub fn of(packet: &MeshPacket, local: NodeNum) -> Self {
        Self::new(packet.sender(local), packet.id)
    }
}

impl fmt::Debug for GlobalPacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/0x{:x}", self.node, self.id)
    }
}
