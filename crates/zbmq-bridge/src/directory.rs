//! Device directory: the bridge's address book of joined mesh nodes
//!
//! The directory maps short network addresses to extended ids so inbound
//! frames that only carry a short address can be published under the
//! device's stable identity. It changes only on join and leave events and
//! is written back to its store in full after every change.
//!
//! # Persistence
//!
//! [`JsonFileStore`] keeps the records as a flat JSON array:
//!
//! ```json
//! [
//!   { "shortAddress": 4660, "extendedId": "00124b0001abcdef" }
//! ]
//! ```
//!
//! The whole file is rewritten on each mutation. That is fine at mesh
//! population scale; a keyed store can replace it behind [`DirectoryStore`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::frame::Eui64;

/// One known mesh node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Current short network address
    pub short_address: u16,
    /// Stable extended id
    pub extended_id: Eui64,
}

// ============================================================================
// Stores
// ============================================================================

/// Backing storage for the device directory
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Read every record. A store that does not exist yet reads as empty.
    async fn load(&self) -> Result<Vec<DeviceRecord>>;

    /// Replace the stored records
    async fn save(&self, records: &[DeviceRecord]) -> Result<()>;

    /// Human-readable location, for logging
    fn location(&self) -> String;
}

/// Directory store backed by a JSON file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Create a store at the given path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DirectoryStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<DeviceRecord>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No device directory yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&content).map_err(|e| BridgeError::StorageCorrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn save(&self, records: &[DeviceRecord]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| BridgeError::StorageWrite(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write a sibling file, then rename it into place
        let temp = self.temp_path();
        tokio::fs::write(&temp, &json)
            .await
            .map_err(|e| BridgeError::StorageWrite(format!("{}: {}", temp.display(), e)))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| BridgeError::StorageWrite(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory directory store, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<DeviceRecord>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records
    pub fn with_records(records: Vec<DeviceRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
            saves: Arc::default(),
        }
    }

    /// Snapshot of what was last saved
    pub fn records(&self) -> Vec<DeviceRecord> {
        self.records.lock().clone()
    }

    /// Number of save calls so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn load(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn save(&self, records: &[DeviceRecord]) -> Result<()> {
        *self.records.lock() = records.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

// ============================================================================
// Directory
// ============================================================================

/// Address book of joined devices
pub struct DeviceDirectory {
    store: Box<dyn DirectoryStore>,
    records: Vec<DeviceRecord>,
}

impl std::fmt::Debug for DeviceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDirectory")
            .field("store", &self.store.location())
            .field("records", &self.records)
            .finish()
    }
}

impl DeviceDirectory {
    /// Load the directory from a store
    ///
    /// Fails with [`BridgeError::StorageCorrupt`] if the store cannot be parsed.
    pub async fn load(store: impl DirectoryStore + 'static) -> Result<Self> {
        let records = store.load().await?;
        info!(
            devices = records.len(),
            store = %store.location(),
            "Loaded device directory"
        );
        Ok(Self {
            store: Box::new(store),
            records,
        })
    }

    /// Load the directory, starting empty if the store is corrupt
    pub async fn load_or_reset(store: impl DirectoryStore + 'static) -> Result<Self> {
        match store.load().await {
            Ok(records) => Ok(Self {
                store: Box::new(store),
                records,
            }),
            Err(e @ BridgeError::StorageCorrupt { .. }) => {
                warn!("{}; starting with an empty device directory", e);
                Ok(Self {
                    store: Box::new(store),
                    records: Vec::new(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// All known devices
    pub fn records(&self) -> &[DeviceRecord] {
        &self.records
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no devices are known
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record a join
    ///
    /// A join is ignored when a record with the same extended id or the same
    /// short address already exists. A device that rejoins under a new short
    /// address therefore keeps its old entry until a leave removes it.
    ///
    /// Returns whether a record was added.
    pub async fn record_join(&mut self, short_address: u16, extended_id: Eui64) -> Result<bool> {
        let exists = self
            .records
            .iter()
            .any(|r| r.extended_id == extended_id || r.short_address == short_address);
        if exists {
            debug!(
                nwk = format!("0x{:04x}", short_address),
                eui64 = %extended_id,
                "Device already in directory, ignoring join"
            );
            return Ok(false);
        }

        let mut records = self.records.clone();
        records.push(DeviceRecord {
            short_address,
            extended_id,
        });
        self.commit(records).await?;

        info!(
            nwk = format!("0x{:04x}", short_address),
            eui64 = %extended_id,
            "Device joined"
        );
        Ok(true)
    }

    /// Record a leave
    ///
    /// Removes the first record matching both fields. Unknown pairs are
    /// ignored. Returns whether a record was removed.
    pub async fn record_leave(&mut self, short_address: u16, extended_id: Eui64) -> Result<bool> {
        let Some(index) = self
            .records
            .iter()
            .position(|r| r.extended_id == extended_id && r.short_address == short_address)
        else {
            debug!(
                nwk = format!("0x{:04x}", short_address),
                eui64 = %extended_id,
                "Leave for unknown device, ignoring"
            );
            return Ok(false);
        };

        let mut records = self.records.clone();
        records.remove(index);
        self.commit(records).await?;

        info!(
            nwk = format!("0x{:04x}", short_address),
            eui64 = %extended_id,
            "Device left"
        );
        Ok(true)
    }

    /// Save `records`, adopting them only once the store accepted them
    async fn commit(&mut self, records: Vec<DeviceRecord>) -> Result<()> {
        self.store.save(&records).await?;
        self.records = records;
        Ok(())
    }

    /// Look up the extended id currently bound to a short address
    pub fn resolve_extended_id(&self, short_address: u16) -> Option<Eui64> {
        self.records
            .iter()
            .find(|r| r.short_address == short_address)
            .map(|r| r.extended_id)
    }

    /// Look up the short address of a device
    pub fn resolve_short_address(&self, extended_id: Eui64) -> Option<u16> {
        self.records
            .iter()
            .find(|r| r.extended_id == extended_id)
            .map(|r| r.short_address)
    }
}
