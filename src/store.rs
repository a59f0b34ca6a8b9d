use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::alarm::model::{AlarmId, AlarmRecord, DeviceDefaults};
use crate::error::PersistenceError;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Default)]
pub struct LoadedState {
    pub alarms: Vec<AlarmRecord>,
    pub devices: Vec<DeviceDefaults>,
    pub rejected_alarms: Vec<RejectedRecord>,
    pub rejected_devices: Vec<RejectedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub key: String,
    pub reason: String,
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<LoadedState, PersistenceError>;
    fn save_alarm(&self, record: &AlarmRecord) -> Result<(), PersistenceError>;
    fn remove_alarm(&self, id: &AlarmId) -> Result<(), PersistenceError>;
    fn save_device(&self, defaults: &DeviceDefaults) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default)]
    alarms: BTreeMap<String, Value>,
    #[serde(default)]
    devices: BTreeMap<String, Value>,
}

impl StateDocument {
    fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            ..Self::default()
        }
    }

    fn parse(content: &str) -> Result<Self, PersistenceError> {
        let document = serde_json::from_str::<StateDocument>(content)
            .map_err(|err| PersistenceError::invalid_json(&err))?;
        if document.version != STATE_VERSION {
            return Err(PersistenceError::UnsupportedVersion(document.version));
        }
        Ok(document)
    }

    fn decode(&self) -> LoadedState {
        let mut state = LoadedState::default();
        for (key, value) in &self.alarms {
            match serde_json::from_value::<AlarmRecord>(value.clone()) {
                Ok(record) if record.definition.id.as_str() == key => state.alarms.push(record),
                Ok(record) => state.rejected_alarms.push(RejectedRecord {
                    key: key.clone(),
                    reason: format!(
                        "record id '{}' does not match its key",
                        record.definition.id
                    ),
                }),
                Err(err) => state.rejected_alarms.push(RejectedRecord {
                    key: key.clone(),
                    reason: format!("undecodable alarm record: {err}"),
                }),
            }
        }
        for (key, value) in &self.devices {
            match serde_json::from_value::<DeviceDefaults>(value.clone()) {
                Ok(defaults) if defaults.entry_id.as_str() == key => state.devices.push(defaults),
                Ok(defaults) => state.rejected_devices.push(RejectedRecord {
                    key: key.clone(),
                    reason: format!(
                        "device entry '{}' does not match its key",
                        defaults.entry_id
                    ),
                }),
                Err(err) => state.rejected_devices.push(RejectedRecord {
                    key: key.clone(),
                    reason: format!("undecodable device record: {err}"),
                }),
            }
        }
        state
    }

    fn put_alarm(&mut self, record: &AlarmRecord) -> Result<(), PersistenceError> {
        self.alarms.insert(
            record.definition.id.as_str().to_string(),
            serde_json::to_value(record)?,
        );
        Ok(())
    }

    fn put_device(&mut self, defaults: &DeviceDefaults) -> Result<(), PersistenceError> {
        self.devices.insert(
            defaults.entry_id.as_str().to_string(),
            serde_json::to_value(defaults)?,
        );
        Ok(())
    }

    fn to_text(&self) -> Result<String, PersistenceError> {
        let text = serde_json::to_string_pretty(self)?;
        Ok(format!("{text}\n"))
    }
}

pub struct JsonFileStore {
    path: PathBuf,
    document: Mutex<StateDocument>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(content) => StateDocument::parse(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StateDocument::empty(),
            Err(err) => return Err(PersistenceError::io(&path, err)),
        };
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    fn update(
        &self,
        change: impl FnOnce(&mut StateDocument) -> Result<(), PersistenceError>,
    ) -> Result<(), PersistenceError> {
        let mut document = lock(&self.document);
        change(&mut document)?;
        let text = document.to_text()?;
        atomic_write(&self.path, text.as_bytes())?;
        debug!(path = %self.path.display(), "state file written");
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<LoadedState, PersistenceError> {
        Ok(lock(&self.document).decode())
    }

    fn save_alarm(&self, record: &AlarmRecord) -> Result<(), PersistenceError> {
        self.update(|document| document.put_alarm(record))
    }

    fn remove_alarm(&self, id: &AlarmId) -> Result<(), PersistenceError> {
        self.update(|document| {
            document.alarms.remove(id.as_str());
            Ok(())
        })
    }

    fn save_device(&self, defaults: &DeviceDefaults) -> Result<(), PersistenceError> {
        self.update(|document| document.put_device(defaults))
    }
}

pub struct MemoryStore {
    document: Mutex<StateDocument>,
    fail_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            document: Mutex::new(StateDocument::empty()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn from_text(content: &str) -> Result<Self, PersistenceError> {
        Ok(Self {
            document: Mutex::new(StateDocument::parse(content)?),
            fail_writes: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn raw_alarm(&self, key: &str) -> Option<Value> {
        lock(&self.document).alarms.get(key).cloned()
    }

    #[cfg(test)]
    pub fn alarm(&self, id: &AlarmId) -> Option<AlarmRecord> {
        self.raw_alarm(id.as_str())
            .and_then(|value| serde_json::from_value(value).ok())
    }

    #[cfg(test)]
    pub fn device(&self, entry_id: &str) -> Option<DeviceDefaults> {
        lock(&self.document)
            .devices
            .get(entry_id)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    fn update(
        &self,
        change: impl FnOnce(&mut StateDocument) -> Result<(), PersistenceError>,
    ) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::io(
                "memory",
                std::io::Error::other("writes disabled"),
            ));
        }
        change(&mut lock(&self.document))
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<LoadedState, PersistenceError> {
        Ok(lock(&self.document).decode())
    }

    fn save_alarm(&self, record: &AlarmRecord) -> Result<(), PersistenceError> {
        self.update(|document| document.put_alarm(record))
    }

    fn remove_alarm(&self, id: &AlarmId) -> Result<(), PersistenceError> {
        self.update(|document| {
            document.alarms.remove(id.as_str());
            Ok(())
        })
    }

    fn save_device(&self, defaults: &DeviceDefaults) -> Result<(), PersistenceError> {
        self.update(|document| document.put_device(defaults))
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("json.tmp");
    fs::write(&tmp, data).map_err(|err| PersistenceError::io(&tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| PersistenceError::io(path, err))
}

fn lock(document: &Mutex<StateDocument>) -> MutexGuard<'_, StateDocument> {
    document.lock().unwrap_or_else(PoisonError::into_inner)
}
