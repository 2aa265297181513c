//! Core mesh networking traits
//!
//! This module defines the router capability interface and the contracts of
//! the collaborators the core talks to: the radio, the local application and
//! the UI/power notification sink. The reliable router composes a base
//! router through [`Router`] instead of extending it.

use super::packet::{MeshPacket, NodeNum, Routing};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in mesh networking operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    /// Node database has no free slot for a new peer
    #[error("node database full ({capacity} records)")]
    NodeDbFull { capacity: usize },
    /// No radio interface available to send on
    #[error("no radio interface")]
    NoInterface,
    /// Transmit queue is full
    #[error("transmit queue full")]
    QueueFull,
    /// Physical layer error
    #[error("radio error: {0}")]
    Radio(String),
    /// Invalid packet contents
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    /// Internal bookkeeping found in an impossible state
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// The physical transport under the flooding router.
pub trait RadioInterface {
    /// Put a packet on the air.
    fn send(&mut self, packet: MeshPacket) -> MeshResult<()>;

    /// How long to wait for an ack before sending `packet` again.
    ///
    /// Depends on the packet's airtime, so it is asked for at every
    /// scheduling point rather than cached.
    fn retransmission_delay(&self, packet: &MeshPacket) -> Duration;
}

/// Capability interface shared by the flooding and reliable routers.
pub trait Router {
    /// This node's number
    fn node_num(&self) -> NodeNum;

    /// Send a packet toward the mesh. Returns the underlying transport's
    /// result unchanged.
    fn send(&mut self, packet: MeshPacket) -> MeshResult<()>;

    /// Whether a freshly received packet should be dropped before any
    /// further processing. Records the packet as seen.
    fn should_filter_received(&mut self, packet: &MeshPacket) -> bool;

    /// Observe a received packet that passed the filter. `routing` carries
    /// the decoded control message when the packet is one.
    fn sniff_received(&mut self, packet: &MeshPacket, routing: Option<&Routing>);

    /// Fresh outbound packet from this node with a new id.
    fn alloc_for_sending(&mut self) -> MeshPacket;

    /// Retransmission delay for `packet`, from the transport.
    fn retransmission_delay(&self, packet: &MeshPacket) -> Duration;
}

/// Where packets addressed to this node (or broadcast) end up.
pub trait AppDelivery {
    fn deliver(&mut self, packet: &MeshPacket);
}

impl AppDelivery for VecDeque<MeshPacket> {
    fn deliver(&mut self, packet: &MeshPacket) {
        self.push_back(packet.clone());
    }
}

impl AppDelivery for Vec<MeshPacket> {
    fn deliver(&mut self, packet: &MeshPacket) {
        self.push(packet.clone());
    }
}

/// UI redraw and power-state sink. Fire and forget.
pub trait StateObserver: Send + Sync {
    /// Something in the node database changed. `force` asks for a redraw
    /// even when node counts are unchanged.
    fn notify_state_changed(&self, force: bool);

    /// User-visible activity happened (keeps the device awake).
    fn notify_activity_event(&self);
}

/// Observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StateObserver for NullObserver {
    fn notify_state_changed(&self, _force: bool) {}
    fn notify_activity_event(&self) {}
}

/// Application hook asked to answer packets that set `want_response`.
///
/// A reply produced here is sent back to the requester and suppresses the
/// router's own explicit ack for the request.
pub trait Responder {
    fn respond(&mut self, request: &MeshPacket) -> Option<super::packet::AppMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_error_display() {
        let err = MeshError::NodeDbFull { capacity: 32 };
        assert!(err.to_string().contains("32"));
        assert!(MeshError::Invariant("dup".into()).to_string().contains("dup"));
    }

    #[test]
    fn test_queue_delivery() {
        let mut queue: VecDeque<MeshPacket> = VecDeque::new();
        let packet = MeshPacket::default();
        queue.deliver(&packet);
        queue.deliver(&packet);
        assert_eq!(queue.len(), 2);
    }
}
