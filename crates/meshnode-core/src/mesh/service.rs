//! Mesh service context
//!
//! [`MeshService`] is the one object that owns a node's state: the node
//! database, the router stack, our own identity and the persistence
//! backend. Nothing in the core is process-global; every operation goes
//! through a service instance.

use super::node_db::NodeDb;
use super::packet::{AppMessage, Data, MeshPacket, NodeNum, PacketId, Payload, Position, Priority, User};
use super::reliable::ReliableRouter;
use super::routing::FloodRouter;
use super::routing_control::dispatch;
use super::traits::{MeshError, MeshResult, RadioInterface, Responder, Router, StateObserver};
use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::persistence::{load_device_state, DeviceState, LoadOutcome, Storage, CURRENT_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Oldest client app version this node talks to (Mmmss)
pub const MIN_APP_VERSION: u32 = 20200;

/// Errors worth reporting out of band. Recorded, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CriticalErrorCode {
    #[default]
    None,
    TxWatchdog,
    NoRadio,
    Unspecified,
    InvalidRadioSetting,
    /// Radio refused a packet
    TransmitFailed,
    /// A new peer was heard but the node database had no room for it
    NodeDbFull,
}

/// Information about this node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MyNodeInfo {
    pub my_node_num: NodeNum,
    /// How long flooded packets stay in the duplicate history
    pub message_timeout_msec: u32,
    pub min_app_version: u32,
    /// Last critical error of this boot
    pub error_code: CriticalErrorCode,
    pub error_address: u32,
    /// Critical errors recorded, across boots
    pub error_count: u32,
}

/// A mesh node: registry, router stack, identity and persistence.
pub struct MeshService<R: RadioInterface> {
    config: MeshConfig,
    node_db: NodeDb,
    router: ReliableRouter<FloodRouter<R>>,
    my_info: MyNodeInfo,
    owner: User,
    own_mac: [u8; 6],
    no_save: bool,
    clock: Arc<dyn Clock>,
    /// Packets delivered to the local application
    app_queue: VecDeque<MeshPacket>,
    storage: Box<dyn Storage>,
    responder: Option<Box<dyn Responder + Send>>,
}

impl<R: RadioInterface> MeshService<R> {
    /// Boot a node: load saved state (falling back to defaults), pick our
    /// node number and register ourselves in the node database.
    pub fn init(
        config: MeshConfig,
        radio: R,
        clock: Arc<dyn Clock>,
        storage: Box<dyn Storage>,
        own_mac: [u8; 6],
    ) -> Self {
        let (state, loaded) = match load_device_state(storage.as_ref()) {
            LoadOutcome::Loaded(state) => {
                info!(version = state.version, "Loaded saved device state");
                (state, true)
            }
            LoadOutcome::NotFound => {
                info!("No saved device state found");
                (DeviceState::default(), false)
            }
            LoadOutcome::Corrupt(e) => {
                warn!(error = %e, "Can't decode saved device state, installing defaults");
                (DeviceState::default(), false)
            }
            LoadOutcome::TooOld(version) => {
                warn!(version, "Device state is old, discarding");
                (DeviceState::default(), false)
            }
        };

        let mut node_db = NodeDb::new(config.max_nodes);
        node_db.restore(state.node_db);

        let mut my_info = state.my_node;
        // Only report errors from this boot
        my_info.error_code = CriticalErrorCode::None;
        my_info.error_address = 0;
        my_info.min_app_version = MIN_APP_VERSION;
        my_info.message_timeout_msec = config.flood_expire_ms.min(u32::MAX as u64) as u32;

        // Re-checked against the db even when loaded, so a bad stored
        // number is not kept forever
        let node_num =
            node_db.pick_node_num(my_info.my_node_num, &own_mac, &mut rand::thread_rng());
        my_info.my_node_num = node_num;

        let owner = if loaded && state.owner != User::default() {
            state.owner
        } else {
            User::default_for(node_num, own_mac)
        };

        let flood = FloodRouter::new(node_num, radio, clock.clone(), &config);
        let router = ReliableRouter::new(flood, clock.clone(), config.num_retransmissions);

        let mut service = Self {
            no_save: state.no_save || config.no_save,
            config,
            node_db,
            router,
            my_info,
            owner,
            own_mac,
            clock,
            app_queue: VecDeque::new(),
            storage,
            responder: None,
        };

        if service.no_save {
            warn!("Development mode: device state will not be saved");
        }

        // Include our owner in the node db under our node number
        let owner = service.owner.clone();
        match service.node_db.get_or_create(node_num) {
            Ok(record) => record.user = Some(owner),
            Err(e) => service.handle_db_error(e),
        }

        info!(node = %node_num, db_size = service.node_db.len(), "Mesh service started");
        service
    }

    pub fn node_num(&self) -> NodeNum {
        self.my_info.my_node_num
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn my_info(&self) -> &MyNodeInfo {
        &self.my_info
    }

    pub fn owner(&self) -> &User {
        &self.owner
    }

    pub fn own_mac(&self) -> [u8; 6] {
        self.own_mac
    }

    pub fn node_db(&self) -> &NodeDb {
        &self.node_db
    }

    pub fn node_db_mut(&mut self) -> &mut NodeDb {
        &mut self.node_db
    }

    pub fn router(&self) -> &ReliableRouter<FloodRouter<R>> {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut ReliableRouter<FloodRouter<R>> {
        &mut self.router
    }

    pub fn radio(&self) -> &R {
        self.router.base().radio()
    }

    pub fn radio_mut(&mut self) -> &mut R {
        self.router.base_mut().radio_mut()
    }

    /// Route UI and power notifications from the node database
    pub fn set_observer(&mut self, observer: Arc<dyn StateObserver>) {
        self.node_db.set_observer(observer);
    }

    /// Application asked to answer packets that set `want_response`
    pub fn set_responder(&mut self, responder: Box<dyn Responder + Send>) {
        self.responder = Some(responder);
    }

    /// Change our identity and record it in the node database
    pub fn set_owner(&mut self, owner: User) -> MeshResult<bool> {
        self.owner = owner;
        let me = self.node_num();
        let changed = self.node_db.update_user(me, &self.owner)?;
        Ok(changed)
    }

    /// Number of nodes heard within the online threshold
    pub fn num_online_nodes(&self) -> usize {
        self.node_db
            .num_online(self.clock.rtc_secs(), self.config.online_threshold_secs)
    }

    /// Record an error for out-of-band reporting. Never stops the node.
    pub fn record_critical_error(&mut self, code: CriticalErrorCode, address: u32) {
        error!(?code, address, "Recording critical error");
        self.my_info.error_code = code;
        self.my_info.error_address = address;
        self.my_info.error_count += 1;
    }

    fn handle_db_error(&mut self, e: MeshError) {
        match e {
            MeshError::NodeDbFull { capacity } => {
                warn!(capacity, "Node database full, not tracking new node");
                self.record_critical_error(CriticalErrorCode::NodeDbFull, capacity as u32);
            }
            other => debug!(error = %other, "Node database update skipped"),
        }
    }

    /// Process a packet heard by the radio.
    ///
    /// Returns `false` if it was filtered as a duplicate.
    pub fn handle_from_radio(&mut self, packet: MeshPacket) -> bool {
        if self.router.should_filter_received(&packet) {
            return false;
        }
        self.handle_received(packet);
        true
    }

    /// Registry updates, optional application reply, then routing dispatch.
    fn handle_received(&mut self, packet: MeshPacket) {
        let me = self.node_num();

        if let Err(e) = self.node_db.update_from(&packet, me) {
            self.handle_db_error(e);
        }

        if let Some(data) = packet.decoded_data() {
            let sender = packet.sender(me);
            let result = match &data.message {
                AppMessage::Position(position) => self.node_db.update_position(sender, position),
                AppMessage::User(user) if sender != me => {
                    self.node_db.update_user(sender, user).map(|_| ())
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                self.handle_db_error(e);
            }
        }

        let replied = self.maybe_reply(&packet);
        self.router.set_current_reply(replied);
        dispatch(&mut self.router, &packet, &mut self.app_queue);
        self.router.set_current_reply(false);
    }

    /// Ask the responder to answer a request addressed to us.
    fn maybe_reply(&mut self, request: &MeshPacket) -> bool {
        let me = self.node_num();
        let wants_response = request
            .decoded_data()
            .map(|d| d.want_response)
            .unwrap_or(false);
        if !wants_response || request.to != me {
            return false;
        }

        let Some(message) = self.responder.as_mut().and_then(|r| r.respond(request)) else {
            return false;
        };

        let mut reply = self.router.alloc_for_sending();
        reply.to = request.sender(me);
        reply.want_ack = !request.from.is_local() && request.want_ack;
        reply.priority = if reply.want_ack {
            Priority::Reliable
        } else {
            Priority::Default
        };
        reply.payload = Payload::Decoded(Data {
            message,
            request_id: request.id,
            want_response: false,
        });

        debug!(to = %reply.to, request_id = request.id, "Sending reply");
        match self.router.send_local(reply) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to send reply");
                false
            }
        }
    }

    /// Send a packet from the local application.
    ///
    /// A zero id is replaced with a fresh one and the packet is stamped with
    /// the current time. Transport errors are returned unchanged.
    pub fn send_to_mesh(&mut self, mut packet: MeshPacket) -> MeshResult<PacketId> {
        if packet.id == 0 {
            packet.id = self.router.base_mut().generate_packet_id();
        }
        packet.rx_time = self.clock.rtc_secs();
        let id = packet.id;

        // The app may have sent our own position or identity
        if let Err(e) = self.node_db.update_from(&packet, self.node_num()) {
            self.handle_db_error(e);
        }

        match self.router.send_local(packet) {
            Ok(()) => Ok(id),
            Err(e) => {
                if matches!(e, MeshError::Radio(_) | MeshError::QueueFull) {
                    self.record_critical_error(CriticalErrorCode::TransmitFailed, id);
                }
                Err(e)
            }
        }
    }

    fn app_packet(&mut self, to: NodeNum, message: AppMessage, want_ack: bool) -> MeshPacket {
        let mut packet = self.router.alloc_for_sending();
        // Injected by the local application
        packet.from = NodeNum::LOCAL;
        packet.to = to;
        packet.want_ack = want_ack;
        packet.priority = if want_ack {
            Priority::Reliable
        } else {
            Priority::Default
        };
        packet.payload = Payload::Decoded(Data::new(message));
        packet
    }

    /// Send a text message. Returns the packet id.
    pub fn send_text(&mut self, to: NodeNum, text: &str, want_ack: bool) -> MeshResult<PacketId> {
        let packet = self.app_packet(to, AppMessage::Text(text.to_string()), want_ack);
        self.send_to_mesh(packet)
    }

    /// Announce our identity, optionally asking peers for theirs
    pub fn send_owner(&mut self, to: NodeNum, want_response: bool) -> MeshResult<PacketId> {
        let mut packet = self.app_packet(to, AppMessage::User(self.owner.clone()), false);
        if let Some(data) = packet.decoded_data_mut() {
            data.want_response = want_response;
        }
        self.send_to_mesh(packet)
    }

    /// Send our position and record it for ourselves
    pub fn send_position(&mut self, to: NodeNum, position: Position) -> MeshResult<PacketId> {
        let me = self.node_num();
        if let Err(e) = self.node_db.update_position(me, &position) {
            self.handle_db_error(e);
        }
        let packet = self.app_packet(to, AppMessage::Position(position), false);
        self.send_to_mesh(packet)
    }

    /// One pass of the cooperative loop: local packets, due
    /// retransmissions, and local packets they produced.
    ///
    /// Returns how long the caller may sleep, `None` when nothing is pending.
    pub fn run_once(&mut self) -> Option<Duration> {
        self.drain_loopback();
        self.router.run_retransmission_tick();
        self.drain_loopback();
        self.router.next_wake()
    }

    fn drain_loopback(&mut self) {
        while let Some(packet) = self.router.pop_loopback() {
            self.handle_received(packet);
        }
    }

    /// Next packet delivered to the local application
    pub fn receive(&mut self) -> Option<MeshPacket> {
        self.app_queue.pop_front()
    }

    pub fn drain_received(&mut self) -> Vec<MeshPacket> {
        self.app_queue.drain(..).collect()
    }

    /// Snapshot of everything that gets persisted
    pub fn device_state(&self) -> DeviceState {
        DeviceState {
            version: CURRENT_VERSION,
            my_node: self.my_info.clone(),
            owner: self.owner.clone(),
            node_db: self.node_db.records().to_vec(),
            no_save: self.no_save,
        }
    }

    /// Persist the device state. Failures are logged, never raised.
    pub fn save_to_disk(&mut self) -> bool {
        if self.no_save {
            warn!("Development mode: not saving device state");
            return false;
        }

        match self.storage.save(&self.device_state()) {
            Ok(()) => {
                debug!(nodes = self.node_db.len(), "Saved device state");
                true
            }
            Err(e) => {
                error!(error = %e, "Can't write device state");
                false
            }
        }
    }
}
