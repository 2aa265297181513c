//! Node database contents surviving a reboot through file storage.

use meshnode_core::clock::ManualClock;
use meshnode_core::config::MeshConfig;
use meshnode_core::mesh::simulation::SimRadio;
use meshnode_core::mesh::{
    AppMessage, MeshPacket, MeshService, ModemPreset, NodeNum, Position, User,
};
use meshnode_core::persistence::{FileStorage, Storage, CURRENT_VERSION};
use std::path::Path;
use std::sync::Arc;

const MAC: [u8; 6] = [0xde, 0xad, 0x00, 0x00, 0xbe, 0xef];

fn boot(path: &Path, clock: &ManualClock) -> MeshService<SimRadio> {
    MeshService::init(
        MeshConfig::default(),
        SimRadio::new(ModemPreset::LongFast, Arc::new(clock.clone())),
        Arc::new(clock.clone()),
        Box::new(FileStorage::new(path)),
        MAC,
    )
}

fn heard(from: NodeNum, id: u32, message: AppMessage, rx_time: u32) -> MeshPacket {
    let mut packet = MeshPacket::decoded(from, NodeNum::BROADCAST, id, message);
    packet.rx_time = rx_time;
    packet.rx_snr = 7.25;
    packet
}

#[test]
fn test_peers_survive_reboot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.json");
    let clock = ManualClock::with_rtc(1_650_000_000);

    let peer = NodeNum::new(0x4242);
    let peer_user = User {
        id: "!00004242".into(),
        long_name: "Hilltop relay".into(),
        short_name: "HTR".into(),
        macaddr: [1, 1, 1, 1, 0x42, 0x42],
    };

    let mut node = boot(&path, &clock);
    let me = node.node_num();
    assert_eq!(me, NodeNum::new(0x0000beef));

    node.handle_from_radio(heard(peer, 1, AppMessage::User(peer_user.clone()), 1_650_000_000));
    node.handle_from_radio(heard(
        peer,
        2,
        AppMessage::Position(Position {
            latitude_i: 377_749_000,
            longitude_i: -1_224_194_000,
            battery_level: 91,
            time: 1_649_999_990,
            ..Position::default()
        }),
        0,
    ));
    assert!(node.save_to_disk());

    clock.advance_millis(60_000);
    let rebooted = boot(&path, &clock);
    assert_eq!(rebooted.node_num(), me);

    let record = rebooted.node_db().find(peer).unwrap();
    assert_eq!(record.user.as_ref(), Some(&peer_user));
    assert_eq!(record.last_heard, 1_650_000_000);
    assert_eq!(record.snr, 7.25);
    let position = record.position.unwrap();
    assert_eq!(position.battery_level, 91);
    assert_eq!(position.time, 1_649_999_990);

    // Heard 60 s ago: still online
    assert_eq!(rebooted.num_online_nodes(), 1);
}

#[test]
fn test_corrupt_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.json");
    std::fs::write(&path, "{\"version\": 11, \"my_node\": ").unwrap();

    let clock = ManualClock::new();
    let mut node = boot(&path, &clock);
    assert_eq!(node.node_db().len(), 1);
    assert_eq!(node.owner().long_name, "Unknown beef");

    // Saving replaces the corrupt file with a readable one
    assert!(node.save_to_disk());
    let state = FileStorage::new(&path).load().unwrap().unwrap();
    assert_eq!(state.version, CURRENT_VERSION);
    assert_eq!(state.node_db.len(), 1);
}

#[test]
fn test_old_version_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.json");
    let clock = ManualClock::new();

    let mut node = boot(&path, &clock);
    node.node_db_mut().get_or_create(NodeNum::new(0x777)).unwrap();
    let mut state = node.device_state();
    state.version = CURRENT_VERSION - 1;
    FileStorage::new(&path).save(&state).unwrap();

    let rebooted = boot(&path, &clock);
    assert!(rebooted.node_db().find(NodeNum::new(0x777)).is_none());
    assert_eq!(rebooted.node_db().len(), 1);
}
