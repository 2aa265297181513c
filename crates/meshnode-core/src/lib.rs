//! # Mesh Node Core
//!
//! This crate provides the mesh-networking core of a LoRa mesh device: a
//! bounded database of peers heard over the radio, and a reliable-delivery
//! layer built on top of an unreliable flooding broadcast transport.
//!
//! ## Overview
//!
//! - **Node Registry**: fixed-capacity table of peer records with
//!   field-level merging of position and identity updates
//! - **Reliable Router**: per-packet retransmission state machine with
//!   explicit acks, naks and implicit acks from overheard rebroadcasts
//! - **Routing Control**: construction and dispatch of ack/nak packets and
//!   delivery of locally addressed packets to the application
//! - **Persistence**: versioned device state with reset-to-defaults on
//!   corruption
//!
//! ## Packet Flow
//!
//! ```text
//! RX: Radio → ReliableRouter::should_filter_received → NodeDb::update_from
//!           → routing_control::dispatch → sniff (ack/nak) → application
//! TX: Application → ReliableRouter::send (pending copy) → FloodRouter → Radio
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshnode_core::clock::SystemClock;
//! use meshnode_core::config::MeshConfig;
//! use meshnode_core::mesh::{MeshService, NodeNum};
//! use meshnode_core::mesh::simulation::SimRadio;
//! use meshnode_core::persistence::MemoryStorage;
//! use std::sync::Arc;
//!
//! let radio = SimRadio::detached();
//! let mut node = MeshService::init(
//!     MeshConfig::default(),
//!     radio,
//!     Arc::new(SystemClock::new()),
//!     Box::new(MemoryStorage::default()),
//!     [0x24, 0x0a, 0xc4, 0x12, 0x34, 0x56],
//! );
//!
//! node.send_text(NodeNum::BROADCAST, "Hello mesh!", true).unwrap();
//! let next_wake = node.run_once();
//! ```

pub mod clock;
pub mod config;
pub mod persistence;

// Mesh networking core
pub mod mesh;

// Re-export main types
pub use config::MeshConfig;
pub use mesh::{
    FloodRouter, MeshError, MeshPacket, MeshResult, MeshService, NodeDb, NodeNum, NodeRecord,
    ReliableRouter,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::MeshConfig;
    pub use crate::mesh::{
        AppMessage, MeshPacket, MeshService, NodeDb, NodeNum, PacketId, Position, RoutingError,
        User,
    };
}
