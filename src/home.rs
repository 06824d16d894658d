use crate::geo::{self, GeoSource, WatchOptions};
use crate::models::{Coordinate, HomeLocation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

const HOME_KEY_PREFIX: &str = "home_location:";

/// Small string store backing per-user settings
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// Settings persisted as one JSON file on disk
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStorage { path: path.into() }
    }

    fn load_map(&self) -> Result<HashMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| StorageError::ReadError(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| StorageError::ParseError(e.to_string()))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut map = self.load_map()?;
        map.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::WriteError(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(&map)
            .map_err(|e| StorageError::WriteError(e.to_string()))?;
        std::fs::write(&self.path, contents).map_err(|e| StorageError::WriteError(e.to_string()))
    }
}

/// Volatile storage for tests and the demo mode
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Saved home value as it sits in storage
#[derive(Serialize, Deserialize)]
struct StoredHome {
    latitude: f64,
    longitude: f64,
}

/// Manages each student's saved home coordinate
///
/// The home feeds the arrival estimate. It changes only on explicit user
/// action and survives restarts; students without one fall back to the
/// configured campus center.
pub struct HomeStore {
    storage: Arc<dyn KeyValueStorage>,
    default_center: Coordinate,
}

impl HomeStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, default_center: Coordinate) -> Self {
        HomeStore {
            storage,
            default_center,
        }
    }

    fn storage_key(owner_id: &str) -> String {
        format!("{HOME_KEY_PREFIX}{owner_id}")
    }

    /// The user's saved home, or `None` when nothing was saved yet
    pub fn load(&self, owner_id: &str) -> Result<Option<HomeLocation>, HomeError> {
        let raw = self
            .storage
            .get(&Self::storage_key(owner_id))
            .map_err(|e| HomeError::StorageError(e.to_string()))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let stored: StoredHome = serde_json::from_str(&raw)
            .map_err(|e| HomeError::InvalidHomeLocation(e.to_string()))?;
        let home = HomeLocation::new(owner_id, stored.latitude, stored.longitude);
        if !home.coordinate().is_valid() {
            return Err(HomeError::InvalidHomeLocation(format!(
                "stored coordinate ({}, {}) is out of range",
                stored.latitude, stored.longitude
            )));
        }

        Ok(Some(home))
    }

    /// The saved home, or the campus center when unset or unreadable
    pub fn load_or_default(&self, owner_id: &str) -> HomeLocation {
        match self.load(owner_id) {
            Ok(Some(home)) => home,
            Ok(None) => self.default_home(owner_id),
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "Falling back to the campus center");
                self.default_home(owner_id)
            }
        }
    }

    /// Save a home picked on the map; out-of-range values leave the
    /// previous home untouched
    pub fn set_manual(
        &self,
        owner_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<HomeLocation, HomeError> {
        let coordinate = Coordinate::new(latitude, longitude);
        if !coordinate.is_valid() {
            return Err(HomeError::InvalidHomeLocation(format!(
                "coordinate ({latitude}, {longitude}) is out of range"
            )));
        }

        let stored = StoredHome {
            latitude,
            longitude,
        };
        let raw = serde_json::to_string(&stored)
            .map_err(|e| HomeError::StorageError(e.to_string()))?;
        self.storage
            .set(&Self::storage_key(owner_id), &raw)
            .map_err(|e| HomeError::StorageError(e.to_string()))?;

        info!(owner_id = %owner_id, latitude, longitude, "Saved home location");
        Ok(HomeLocation::new(owner_id, latitude, longitude))
    }

    /// Save the device's current position as the home
    pub async fn set_from_device(
        &self,
        owner_id: &str,
        source: &dyn GeoSource,
        options: WatchOptions,
    ) -> Result<HomeLocation, HomeError> {
        let sample = geo::current_position(source, options)
            .await
            .map_err(|e| HomeError::GeoError(e.to_string()))?;
        self.set_manual(owner_id, sample.latitude, sample.longitude)
    }

    fn default_home(&self, owner_id: &str) -> HomeLocation {
        HomeLocation::new(
            owner_id,
            self.default_center.latitude,
            self.default_center.longitude,
        )
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage read error: {0}")]
    ReadError(String),
    #[error("Storage parse error: {0}")]
    ParseError(String),
    #[error("Storage write error: {0}")]
    WriteError(String),
}

#[derive(Error, Debug)]
pub enum HomeError {
    #[error("Invalid home location: {0}")]
    InvalidHomeLocation(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Location error: {0}")]
    GeoError(String),
}
