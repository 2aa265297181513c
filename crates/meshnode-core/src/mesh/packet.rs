//! Mesh packet types
//!
//! This module defines the packet model the core works with. The on-air
//! framing belongs to the radio layer; the core only depends on addressing
//! (node number, packet id) and on optional fields being either present or
//! entirely absent.
//!
//! ## Packet Structure
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        MeshPacket                                   │
//! ├──────────┬──────────┬──────────┬─────────────┬────────────────────┤
//! │ from (4) │  to (4)  │  id (4)  │ flags/hops  │ payload             │
//! │          │          │          │ want_ack    │  Decoded(Data) or   │
//! │          │          │          │ priority    │  Encrypted(bytes)   │
//! └──────────┴──────────┴──────────┴─────────────┴────────────────────┘
//!
//! Data:
//! ┌──────────────────────┬──────────────┬────────────────┐
//! │ AppMessage (by port) │ request_id   │ want_response  │
//! └──────────────────────┴──────────────┴────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Packet identifier, unique per originating node within the retry window.
pub type PacketId = u32;

/// Node number - 4-byte mesh address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeNum(u32);

impl NodeNum {
    /// Broadcast address (all nodes)
    pub const BROADCAST: NodeNum = NodeNum(0xFFFF_FFFF);

    /// The local phone/app, or "unset"
    pub const LOCAL: NodeNum = NodeNum(0);

    pub const fn new(value: u32) -> Self {
        NodeNum(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Candidate node number from the low four bytes of a hardware address.
    pub fn from_mac(mac: &[u8; 6]) -> Self {
        NodeNum(u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]))
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

impl fmt::Debug for NodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeNum(0x{:08x})", self.0)
    }
}

impl fmt::Display for NodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl From<u32> for NodeNum {
    fn from(value: u32) -> Self {
        NodeNum(value)
    }
}

/// Transmit priority, higher values go out first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    #[default]
    Unset = 0,
    Min = 1,
    Background = 10,
    Default = 64,
    Reliable = 70,
    Ack = 120,
    Max = 127,
}

/// Application port a decoded payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PortNum {
    Unknown = 0,
    TextMessage = 1,
    RemoteHardware = 2,
    Position = 3,
    NodeInfo = 4,
    Routing = 5,
    Admin = 6,
    Reply = 32,
    Private = 256,
}

/// Last known location of a node.
///
/// Zero means "not reported" for every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in 1e-7 degrees
    pub latitude_i: i32,
    /// Longitude in 1e-7 degrees
    pub longitude_i: i32,
    /// Altitude in meters
    pub altitude: i32,
    /// Battery level 0-100
    pub battery_level: u32,
    /// Seconds since the Unix epoch when the fix was taken
    pub time: u32,
}

impl Position {
    pub fn from_degrees(lat: f64, lon: f64) -> Self {
        Self {
            latitude_i: (lat * 1e7).round() as i32,
            longitude_i: (lon * 1e7).round() as i32,
            ..Self::default()
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude_i as f64 * 1e-7
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_i as f64 * 1e-7
    }

    pub fn has_location(&self) -> bool {
        self.latitude_i != 0 || self.longitude_i != 0
    }
}

/// Identity a node announces about itself
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    /// Stable id string, `!` followed by the node number in hex by default
    pub id: String,
    /// Long name (up to 40 characters)
    pub long_name: String,
    /// Short name (up to 4 characters)
    pub short_name: String,
    /// Hardware address of the radio
    pub macaddr: [u8; 6],
}

impl User {
    /// Default identity for an unconfigured device.
    pub fn default_for(node: NodeNum, mac: [u8; 6]) -> Self {
        Self {
            id: format!("!{:08x}", node.get()),
            long_name: format!("Unknown {:02x}{:02x}", mac[4], mac[5]),
            short_name: format!("?{:02X}", node.get() & 0xff),
            macaddr: mac,
        }
    }
}

/// Routing-layer error carried in ack/nak control messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoutingError {
    /// Success: this is an ack
    #[default]
    None,
    NoRoute,
    GotNak,
    Timeout,
    NoInterface,
    /// Reliable send gave up after its last attempt
    MaxRetransmit,
    NoChannel,
    TooLarge,
    NoResponse,
}

/// Routing control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Routing {
    pub error_reason: RoutingError,
}

impl Routing {
    pub fn is_ack(&self) -> bool {
        self.error_reason == RoutingError::None
    }
}

/// Decoded application payload, tagged by port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppMessage {
    Text(String),
    Position(Position),
    User(User),
    Routing(Routing),
    Raw { port: PortNum, bytes: Vec<u8> },
}

impl AppMessage {
    pub fn port(&self) -> PortNum {
        match self {
            AppMessage::Text(_) => PortNum::TextMessage,
            AppMessage::Position(_) => PortNum::Position,
            AppMessage::User(_) => PortNum::NodeInfo,
            AppMessage::Routing(_) => PortNum::Routing,
            AppMessage::Raw { port, .. } => *port,
        }
    }

    /// Rough encoded size of the message body in bytes
    fn encoded_len(&self) -> usize {
        match self {
            AppMessage::Text(text) => text.len() + 2,
            AppMessage::Position(_) => 5 * 6,
            AppMessage::User(user) => {
                user.id.len() + user.long_name.len() + user.short_name.len() + 6 + 4 * 2
            }
            AppMessage::Routing(_) => 2,
            AppMessage::Raw { bytes, .. } => bytes.len() + 2,
        }
    }
}

impl Default for AppMessage {
    fn default() -> Self {
        AppMessage::Text(String::new())
    }
}

/// Decoded packet contents
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Data {
    pub message: AppMessage,
    /// Id of the packet this one answers (acks, naks, replies), 0 if none
    pub request_id: PacketId,
    /// Sender would like an application-level reply
    pub want_response: bool,
}

impl Data {
    pub fn new(message: AppMessage) -> Self {
        Self {
            message,
            request_id: 0,
            want_response: false,
        }
    }
}

/// Packet contents as received: decoded, or still opaque to us
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Decoded(Data),
    Encrypted(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Decoded(Data::default())
    }
}

/// A mesh packet
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshPacket {
    /// Originating node; `LOCAL` if injected by the local app
    pub from: NodeNum,
    /// Destination node, or `BROADCAST`
    pub to: NodeNum,
    /// Packet id, 0 for "simple" packets that are never rebroadcast
    pub id: PacketId,
    /// Remaining hops (decremented on each rebroadcast)
    pub hop_limit: u8,
    /// Sender requests an acknowledgment
    pub want_ack: bool,
    pub priority: Priority,
    /// Receive timestamp in epoch seconds, 0 if no valid time
    pub rx_time: u32,
    /// Receive signal-to-noise ratio (dB)
    pub rx_snr: f32,
    pub payload: Payload,
}

impl MeshPacket {
    /// Minimal on-air header size in bytes
    pub const HEADER_SIZE: usize = 16;

    /// Maximum payload size in bytes
    pub const MAX_PAYLOAD_SIZE: usize = 237;

    /// Create a decoded packet carrying `message`
    pub fn decoded(from: NodeNum, to: NodeNum, id: PacketId, message: AppMessage) -> Self {
        Self {
            from,
            to,
            id,
            payload: Payload::Decoded(Data::new(message)),
            ..Self::default()
        }
    }

    /// Create a text message packet
    pub fn text(from: NodeNum, to: NodeNum, id: PacketId, text: &str) -> Self {
        Self::decoded(from, to, id, AppMessage::Text(text.to_string()))
    }

    pub fn decoded_data(&self) -> Option<&Data> {
        match &self.payload {
            Payload::Decoded(data) => Some(data),
            Payload::Encrypted(_) => None,
        }
    }

    pub fn decoded_data_mut(&mut self) -> Option<&mut Data> {
        match &mut self.payload {
            Payload::Decoded(data) => Some(data),
            Payload::Encrypted(_) => None,
        }
    }

    /// The routing control message, if this packet carries one
    pub fn routing(&self) -> Option<&Routing> {
        match self.decoded_data() {
            Some(Data {
                message: AppMessage::Routing(routing),
                ..
            }) => Some(routing),
            _ => None,
        }
    }

    /// `request_id` of the decoded payload, 0 if absent
    pub fn request_id(&self) -> PacketId {
        self.decoded_data().map(|d| d.request_id).unwrap_or(0)
    }

    /// Originating node, with packets from the local app attributed to
    /// `local`.
    pub fn sender(&self, local: NodeNum) -> NodeNum {
        if self.from.is_local() {
            local
        } else {
            self.from
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_broadcast()
    }

    /// Check if this packet is addressed to us or broadcast
    pub fn is_for_node(&self, node: NodeNum) -> bool {
        self.to.is_broadcast() || self.to == node
    }

    /// Decrement hop limit, returns false if already zero
    pub fn decrement_hop_limit(&mut self) -> bool {
        if self.hop_limit > 0 {
            self.hop_limit -= 1;
            true
        } else {
            false
        }
    }

    /// Estimated on-air size, used for airtime calculations
    pub fn encoded_len(&self) -> usize {
        let body = match &self.payload {
            Payload::Decoded(data) => {
                let request = if data.request_id != 0 { 5 } else { 0 };
                2 + data.message.encoded_len() + request
            }
            Payload::Encrypted(bytes) => bytes.len(),
        };
        Self::HEADER_SIZE + body.min(Self::MAX_PAYLOAD_SIZE)
    }
}
