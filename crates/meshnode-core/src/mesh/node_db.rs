//! Node database
//!
//! Bounded registry of every peer this node has heard of, keyed by node
//! number. Records are created lazily on first reference and never evicted;
//! once the table is full, creating another record fails with
//! [`MeshError::NodeDbFull`].
//!
//! Storage is a `Vec` reserved to full capacity up front. Inserts only ever
//! append below that capacity, so the backing buffer never moves and
//! lookups are plain scans over initialized records.
//!
//! ## Concurrency
//!
//! Every mutation takes `&mut self`, so the borrow checker rules out a
//! lookup racing an insert within one owner. [`MeshService`] owns its
//! registry outright and is driven from a single processing loop. A
//! reader on another thread (a display or client-facing task) shares the
//! registry behind a `Mutex`; `find` holds the lock only for a bounded,
//! non-allocating scan. `NodeDb` is `Send + Sync` for that purpose.
//!
//! [`MeshService`]: super::MeshService
//!
//! ## Merge rules
//!
//! - **User**: replaced wholesale. A "changed" flag compares the whole
//!   identity against the previous one (an absent identity compares as
//!   empty); only a real change triggers a redraw and an activity event.
//! - **Position**: merged field by field. A zero field never overwrites a
//!   known value. Latitude and longitude move together when either is
//!   nonzero. The stored fix time is only filled in when it was unset.
//!   Always notifies observers.
//! - **Packet metadata**: any decoded packet refreshes `last_heard` (when it
//!   carries a receive time) and `snr` (always).

use super::packet::{MeshPacket, NodeNum, Payload, Position, User};
use super::traits::{MeshError, MeshResult, NullObserver, StateObserver};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Node numbers below this are reserved and never picked for ourselves
pub const NUM_RESERVED: u32 = 4;

/// Everything known about one peer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    pub num: NodeNum,
    pub user: Option<User>,
    pub position: Option<Position>,
    /// Epoch seconds of the last packet with a valid receive time, 0 if never
    pub last_heard: u32,
    /// SNR of the most recent packet from this node (dB)
    pub snr: f32,
}

impl NodeRecord {
    pub fn new(num: NodeNum) -> Self {
        Self {
            num,
            ..Self::default()
        }
    }

    /// Seconds since this node was last heard, relative to `now` (epoch
    /// seconds). Clamped to zero when our clock is behind the peer's
    /// timestamp, which happens before the first time fix.
    pub fn since_last_seen(&self, now: u32) -> u32 {
        let delta = now as i64 - self.last_heard as i64;
        delta.max(0) as u32
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }
}

/// Fixed-capacity peer registry
pub struct NodeDb {
    nodes: Vec<NodeRecord>,
    capacity: usize,
    observer: Arc<dyn StateObserver>,
    /// Node whose change deserves a redraw, consumed by the display
    updated_for_display: Option<NodeNum>,
    /// Cursor for streaming the node list to a client
    read_pointer: usize,
}

impl NodeDb {
    /// Create an empty database holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self::with_observer(capacity, Arc::new(NullObserver))
    }

    pub fn with_observer(capacity: usize, observer: Arc<dyn StateObserver>) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            capacity,
            observer,
            updated_for_display: None,
            read_pointer: 0,
        }
    }

    pub fn set_observer(&mut self, observer: Arc<dyn StateObserver>) {
        self.observer = observer;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }

    /// All records in insertion order
    pub fn records(&self) -> &[NodeRecord] {
        &self.nodes
    }

    /// Find a node by number. Never allocates.
    pub fn find(&self, num: NodeNum) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.num == num)
    }

    pub fn find_mut(&mut self, num: NodeNum) -> Option<&mut NodeRecord> {
        self.nodes.iter_mut().find(|n| n.num == num)
    }

    /// Find a node, creating an empty record for it if missing.
    pub fn get_or_create(&mut self, num: NodeNum) -> MeshResult<&mut NodeRecord> {
        if num.is_local() {
            return Err(MeshError::InvalidPacket(
                "node number 0 cannot be stored".to_string(),
            ));
        }

        match self.nodes.iter().position(|n| n.num == num) {
            Some(idx) => Ok(&mut self.nodes[idx]),
            None => {
                if self.nodes.len() >= self.capacity {
                    return Err(MeshError::NodeDbFull {
                        capacity: self.capacity,
                    });
                }
                debug!(node = %num, count = self.nodes.len() + 1, "Adding node to db");
                self.nodes.push(NodeRecord::new(num));
                let last = self.nodes.len() - 1;
                Ok(&mut self.nodes[last])
            }
        }
    }

    /// Merge a position report from `num`.
    pub fn update_position(&mut self, num: NodeNum, incoming: &Position) -> MeshResult<()> {
        let info = self.get_or_create(num)?;

        debug!(
            node = %num,
            time = incoming.time,
            lat_i = incoming.latitude_i,
            lon_i = incoming.longitude_i,
            "DB update position"
        );

        let stored = info.position.get_or_insert_with(Position::default);
        // Many reports carry no time; keep the one we already have
        if stored.time == 0 && incoming.time != 0 {
            stored.time = incoming.time;
        }
        if incoming.battery_level != 0 {
            stored.battery_level = incoming.battery_level;
        }
        if incoming.latitude_i != 0 || incoming.longitude_i != 0 {
            stored.latitude_i = incoming.latitude_i;
            stored.longitude_i = incoming.longitude_i;
        }

        self.updated_for_display = Some(num);
        self.observer.notify_state_changed(true);
        Ok(())
    }

    /// Replace the identity of `num`. Returns whether anything changed.
    pub fn update_user(&mut self, num: NodeNum, incoming: &User) -> MeshResult<bool> {
        let info = self.get_or_create(num)?;

        let changed = match &info.user {
            Some(old) => old != incoming,
            None => *incoming != User::default(),
        };
        info.user = Some(incoming.clone());

        debug!(
            node = %num,
            changed,
            id = %incoming.id,
            long_name = %incoming.long_name,
            short_name = %incoming.short_name,
            "Updating user"
        );

        if changed {
            self.updated_for_display = Some(num);
            self.observer.notify_activity_event();
            self.observer.notify_state_changed(true);
        }
        Ok(changed)
    }

    /// Refresh last-heard time and SNR from any decoded packet.
    ///
    /// `local` is our own node number, used for packets with `from == 0`.
    pub fn update_from(&mut self, packet: &MeshPacket, local: NodeNum) -> MeshResult<()> {
        if !matches!(packet.payload, Payload::Decoded(_)) {
            return Ok(());
        }

        let sender = packet.sender(local);
        trace!(node = %sender, rx_time = packet.rx_time, "Update DB node");

        let info = self.get_or_create(sender)?;
        if packet.rx_time != 0 {
            info.last_heard = packet.rx_time;
        }
        info.snr = packet.rx_snr;
        Ok(())
    }

    /// Number of nodes heard within `threshold_secs` of `now`
    pub fn num_online(&self, now: u32, threshold_secs: u32) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.since_last_seen(now) < threshold_secs)
            .count()
    }

    /// Choose our node number.
    ///
    /// Starts from `current` (or the low four bytes of `own_mac` when unset)
    /// and resamples uniformly from the non-reserved, non-broadcast range
    /// while the candidate belongs to a record with a different hardware
    /// address. Termination is probabilistic: it only loops while it keeps
    /// drawing numbers owned by other devices.
    pub fn pick_node_num<G: Rng + ?Sized>(
        &self,
        current: NodeNum,
        own_mac: &[u8; 6],
        rng: &mut G,
    ) -> NodeNum {
        let mut candidate = if current.is_local() {
            NodeNum::from_mac(own_mac)
        } else {
            current
        };

        if candidate.is_broadcast() || candidate.get() < NUM_RESERVED {
            candidate = NodeNum::new(NUM_RESERVED);
        }

        while let Some(found) = self.find(candidate) {
            let owner_mac = found.user.as_ref().map(|u| u.macaddr).unwrap_or_default();
            if owner_mac == *own_mac {
                break;
            }
            let next = NodeNum::new(rng.gen_range(NUM_RESERVED..NodeNum::BROADCAST.get()));
            debug!(desired = %candidate, trying = %next, "Desired node number in use");
            candidate = next;
        }

        candidate
    }

    /// Next record for a client streaming the node list, `None` at the end
    pub fn read_next_info(&mut self) -> Option<&NodeRecord> {
        let record = self.nodes.get(self.read_pointer)?;
        self.read_pointer += 1;
        Some(record)
    }

    pub fn reset_read_pointer(&mut self) {
        self.read_pointer = 0;
    }

    /// Node changed enough to deserve a redraw since the last call
    pub fn take_display_update(&mut self) -> Option<NodeNum> {
        self.updated_for_display.take()
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.read_pointer = 0;
        self.updated_for_display = None;
    }

    /// Replace the contents with previously persisted records.
    ///
    /// Records for node 0, duplicates and anything beyond capacity are
    /// dropped. Returns how many records were kept.
    pub fn restore(&mut self, records: Vec<NodeRecord>) -> usize {
        self.clear();
        for record in records {
            if record.num.is_local() || self.find(record.num).is_some() {
                continue;
            }
            if self.nodes.len() >= self.capacity {
                debug!(capacity = self.capacity, "Persisted node db exceeds capacity, truncating");
                break;
            }
            self.nodes.push(record);
        }
        self.nodes.len()
    }
}

impl std::fmt::Debug for NodeDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDb")
            .field("nodes", &self.nodes)
            .field("capacity", &self.capacity)
            .field("read_pointer", &self.read_pointer)
            .finish()
    }
}
