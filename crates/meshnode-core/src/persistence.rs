//! Device state persistence
//!
//! The whole device state (our node info, owner identity and the node
//! database) is stored as one versioned JSON document. Writes are atomic
//! (write to `.tmp`, then rename). A state that cannot be decoded, or whose
//! version is below [`MIN_VERSION`], is discarded and the device starts
//! from defaults.

use crate::mesh::node_db::NodeRecord;
use crate::mesh::packet::User;
use crate::mesh::service::MyNodeInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Version written by this build
pub const CURRENT_VERSION: u32 = 11;

/// Oldest version this build can read
pub const MIN_VERSION: u32 = CURRENT_VERSION;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt device state: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Everything the device persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub version: u32,
    pub my_node: MyNodeInfo,
    pub owner: User,
    pub node_db: Vec<NodeRecord>,
    /// Development mode: never write this state back
    #[serde(default)]
    pub no_save: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            my_node: MyNodeInfo::default(),
            owner: User::default(),
            node_db: Vec::new(),
            no_save: false,
        }
    }
}

/// Backing store for the device state
pub trait Storage: Send {
    /// `Ok(None)` when nothing was saved yet, `Err(Corrupt)` when the stored
    /// bytes cannot be decoded.
    fn load(&self) -> Result<Option<DeviceState>, StorageError>;

    fn save(&self, state: &DeviceState) -> Result<(), StorageError>;
}

/// What came back from storage at boot
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(DeviceState),
    NotFound,
    /// Unreadable; caller falls back to defaults
    Corrupt(StorageError),
    /// Readable but older than [`MIN_VERSION`]; caller falls back to defaults
    TooOld(u32),
}

/// Load and version-check the stored device state.
pub fn load_device_state(storage: &dyn Storage) -> LoadOutcome {
    match storage.load() {
        Ok(Some(state)) if state.version < MIN_VERSION => LoadOutcome::TooOld(state.version),
        Ok(Some(state)) => LoadOutcome::Loaded(state),
        Ok(None) => LoadOutcome::NotFound,
        Err(e) => LoadOutcome::Corrupt(e),
    }
}

fn decode(text: &str) -> Result<DeviceState, StorageError> {
    serde_json::from_str(text).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn encode(state: &DeviceState) -> Result<String, StorageError> {
    serde_json::to_string_pretty(state).map_err(|e| StorageError::Serialize(e.to_string()))
}

/// JSON file on disk
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write data atomically: write to a `.tmp` file then rename.
    fn atomic_write(&self, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<Option<DeviceState>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => decode(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn save(&self, state: &DeviceState) -> Result<(), StorageError> {
        let text = encode(state)?;
        self.atomic_write(text.as_bytes())
    }
}

/// In-memory store. Clones share the same contents, so a test or a
/// simulated reboot can hand the same storage to a new node.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<Option<String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored document, if any
    pub fn raw(&self) -> Option<String> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Overwrite the stored document with arbitrary text
    pub fn set_raw(&self, text: impl Into<String>) {
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = Some(text.into());
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Option<DeviceState>, StorageError> {
        match self.raw() {
            Some(text) => decode(&text).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, state: &DeviceState) -> Result<(), StorageError> {
        let text = encode(state)?;
        self.set_raw(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::packet::NodeNum;

    fn sample_state() -> DeviceState {
        let mut state = DeviceState::default();
        state.my_node.my_node_num = NodeNum::new(0x1234);
        state.owner.long_name = "Base camp".into();
        state.node_db.push(NodeRecord::new(NodeNum::new(0x1234)));
        state.node_db.push(NodeRecord {
            last_heard: 99,
            snr: 4.5,
            ..NodeRecord::new(NodeNum::new(0x55))
        });
        state
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state").join("db.json"));

        assert!(storage.load().unwrap().is_none());

        let state = sample_state();
        storage.save(&state).unwrap();
        assert!(!storage.path().with_extension("tmp").exists());
        assert_eq!(storage.load().unwrap(), Some(state));
    }

    #[test]
    fn test_file_storage_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, b"{ truncated").unwrap();

        let storage = FileStorage::new(&path);
        assert!(matches!(storage.load(), Err(StorageError::Corrupt(_))));
        assert!(matches!(
            load_device_state(&storage),
            LoadOutcome::Corrupt(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_old_version_rejected() {
        let storage = MemoryStorage::new();
        let mut state = sample_state();
        state.version = MIN_VERSION - 1;
        storage.save(&state).unwrap();

        assert!(matches!(
            load_device_state(&storage),
            LoadOutcome::TooOld(v) if v == MIN_VERSION - 1
        ));
    }

    #[test]
    fn test_memory_storage_shared_between_clones() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        assert!(matches!(load_device_state(&other), LoadOutcome::NotFound));

        storage.save(&sample_state()).unwrap();
        match load_device_state(&other) {
            LoadOutcome::Loaded(state) => assert_eq!(state.node_db.len(), 2),
            other => panic!("unexpected outcome: {:?}", other),
        }

        other.set_raw("not json");
        assert!(matches!(storage.load(), Err(StorageError::Corrupt(_))));
    }
}
