/*!
 * Per-device configuration store.
 *
 * A device's saved configuration is a record of property name to element
 * values. Records are replayed into matching properties when the device
 * starts and when hardware-dependent properties are defined on connect.
 */
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{DeviceError, Result};
use crate::property::PropertyValues;

/// Saved values of one device, by property name
pub type DeviceRecord = BTreeMap<String, PropertyValues>;

/// Storage backend for device records
pub trait ConfigStore: Send + Sync {
    /// Load a device's record, `None` if nothing was saved
    fn load(&self, device: &str) -> Result<Option<DeviceRecord>>;

    /// Replace a device's record
    fn save(&self, device: &str, record: &DeviceRecord) -> Result<()>;

    /// Forget a device's record
    fn purge(&self, device: &str) -> Result<()>;

    /// Save the values of one property, keeping the rest of the record
    fn save_property(&self, device: &str, name: &str, values: PropertyValues) -> Result<()> {
        let mut record = self.load(device)?.unwrap_or_default();
        record.insert(name.to_string(), values);
        self.save(device, &record)
    }
}

/// Shared store handle
pub type SharedConfigStore = Arc<dyn ConfigStore>;

/// Store keeping one JSON file per device in a directory
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    /// Create a store rooted at `dir`; the directory is created on first save
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// File holding a device's record
    pub fn path_for(&self, device: &str) -> PathBuf {
        let file: String = device
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}_config.json", file))
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self, device: &str) -> Result<Option<DeviceRecord>> {
        let path = self.path_for(device);
        if !path.exists() {
            debug!("No saved configuration for {} at {}", device, path.display());
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&text).map_err(|e| {
            DeviceError::Serialization(format!("{}: {}", path.display(), e))
        })?;
        Ok(Some(record))
    }

    fn save(&self, device: &str, record: &DeviceRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(device);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved configuration for {} to {}", device, path.display());
        Ok(())
    }

    fn purge(&self, device: &str) -> Result<()> {
        let path = self.path_for(device);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store, for tests and for drivers that do not persist
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    records: Mutex<HashMap<String, DeviceRecord>>,
}

impl MemoryConfigStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self, device: &str) -> Result<Option<DeviceRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| DeviceError::other("configuration store lock poisoned"))?;
        Ok(records.get(device).cloned())
    }

    fn save(&self, device: &str, record: &DeviceRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| DeviceError::other("configuration store lock poisoned"))?;
        records.insert(device.to_string(), record.clone());
        Ok(())
    }

    fn purge(&self, device: &str) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| DeviceError::other("configuration store lock poisoned"))?;
        records.remove(device);
        Ok(())
    }
}
