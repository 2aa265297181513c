//! Mesh Networking Core
//!
//! This module implements the peer database and the reliable-delivery layer
//! of a flooding mesh node. The architecture separates concerns into:
//!
//! - **Traits**: Router capability interface and collaborator contracts
//! - **Packet**: Packet model, node numbers and control messages
//! - **Node DB**: Bounded registry of peers with merge semantics
//! - **Routing**: Flooding transport with duplicate suppression
//! - **Reliable**: Retransmission state machine with ack/nak/implicit ack
//! - **Routing Control**: Ack/nak construction and inbound dispatch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Application Layer                                   │
//! │              (Text Messaging, Position Sharing, etc.)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MeshService (context object)                        │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌──────────────┐  ┌──────────┐  │
//! │  │   NodeDb    │  │ routing_control  │  │  persistence │  │ observer │  │
//! │  └─────────────┘  └──────────────────┘  └──────────────┘  └──────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Router Stack                                      │
//! │  ┌───────────────────────────┐  ┌─────────────────────────────────────┐  │
//! │  │    ReliableRouter         │  │      FloodRouter                    │  │
//! │  │ (pending retransmissions) │─▶│ (dedup history, rebroadcast)        │  │
//! │  └───────────────────────────┘  └─────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      RadioInterface Trait                                │
//! │  ┌─────────────┐  ┌──────────────────────────┐                          │
//! │  │    send     │  │  retransmission_delay    │                          │
//! │  └─────────────┘  └──────────────────────────┘                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use meshnode_core::mesh::{MeshService, NodeNum};
//!
//! // Reliable broadcast: retried until someone rebroadcasts it
//! node.send_text(NodeNum::BROADCAST, "Hello mesh!", true)?;
//!
//! // Feed packets heard by the radio
//! node.handle_from_radio(incoming_packet);
//!
//! // Cooperative scheduling: run, then sleep for the returned delay
//! let next_wake = node.run_once();
//! ```

pub mod traits;
pub mod packet;
pub mod packet_id;
pub mod airtime;
pub mod node_db;
pub mod routing;
pub mod reliable;
pub mod routing_control;
pub mod service;
pub mod simulation;

// Re-export main types
pub use traits::{
    AppDelivery, MeshError, MeshResult, NullObserver, RadioInterface, Responder, Router,
    StateObserver,
};
pub use packet::{
    AppMessage, Data, MeshPacket, NodeNum, PacketId, Payload, PortNum, Position, Priority,
    Routing, RoutingError, User,
};
pub use packet_id::{GlobalPacketId, PacketIdGenerator};
pub use airtime::{AirtimeModel, ModemPreset};
pub use node_db::{NodeDb, NodeRecord};
pub use routing::{FloodRouter, PacketHistory};
pub use reliable::{PendingPacket, ReliableRouter, RouterStats};
pub use service::{CriticalErrorCode, MeshService, MyNodeInfo};
