use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use color_eyre::Result;
use eyre::{eyre, WrapErr};
use serde::{Deserialize, Serialize};

use crate::bulb::{Bulb, BulbGroup};

/// Where adopted bulbs and groups live between sessions. Every save replaces
/// the whole collection.
pub trait BulbStore: Send + Sync {
    fn load_bulbs(&self) -> Result<Vec<Bulb>>;
    fn save_bulbs(&self, bulbs: &[Bulb]) -> Result<()>;
    fn load_groups(&self) -> Result<Vec<BulbGroup>>;
    fn save_groups(&self, groups: &[BulbGroup]) -> Result<()>;
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct Devices {
    #[serde(default)]
    bulbs: Vec<Bulb>,

    #[serde(default)]
    groups: Vec<BulbGroup>,
}

/// Keeps everything in one JSON document on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> JsonFileStore {
        JsonFileStore {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<Devices> {
        if !self.path.exists() {
            return Ok(Devices::default());
        }

        let json = std::fs::read_to_string(&self.path)
            .wrap_err_with(|| format!("Failed to read {}", self.path.display()))?;
        let de = &mut serde_json::Deserializer::from_str(&json);
        let devices = serde_path_to_error::deserialize(de)
            .wrap_err_with(|| format!("Failed to parse {}", self.path.display()))?;

        Ok(devices)
    }

    /// Writes to a sibling file first so a crash never leaves half a document.
    fn write(&self, devices: &Devices) -> Result<()> {
        let json = serde_json::to_string_pretty(devices)?;
        let tmp = self.path.with_extension("json.tmp");

        std::fs::write(&tmp, json)
            .wrap_err_with(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .wrap_err_with(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Devices)) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| eyre!("Store lock poisoned"))?;
        let mut devices = self.read()?;
        f(&mut devices);
        self.write(&devices)
    }
}

impl BulbStore for JsonFileStore {
    fn load_bulbs(&self) -> Result<Vec<Bulb>> {
        Ok(self.read()?.bulbs)
    }

    fn save_bulbs(&self, bulbs: &[Bulb]) -> Result<()> {
        self.update(|devices| devices.bulbs = bulbs.to_vec())
    }

    fn load_groups(&self) -> Result<Vec<BulbGroup>> {
        Ok(self.read()?.groups)
    }

    fn save_groups(&self, groups: &[BulbGroup]) -> Result<()> {
        self.update(|devices| devices.groups = groups.to_vec())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: Mutex<Devices>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Devices) -> T) -> Result<T> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| eyre!("Store lock poisoned"))?;
        Ok(f(&mut devices))
    }
}

impl BulbStore for MemoryStore {
    fn load_bulbs(&self) -> Result<Vec<Bulb>> {
        self.with(|devices| devices.bulbs.clone())
    }

    fn save_bulbs(&self, bulbs: &[Bulb]) -> Result<()> {
        self.with(|devices| devices.bulbs = bulbs.to_vec())
    }

    fn load_groups(&self) -> Result<Vec<BulbGroup>> {
        self.with(|devices| devices.groups.clone())
    }

    fn save_groups(&self, groups: &[BulbGroup]) -> Result<()> {
        self.with(|devices| devices.groups = groups.to_vec())
    }
}
