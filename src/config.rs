use crate::eta::DEFAULT_AVG_SPEED_KMH;
use crate::fleet::BusAssignment;
use crate::geo::gpsd::DEFAULT_GPSD_ADDR;
use crate::geo::WatchOptions;
use crate::models::{Coordinate, Session};
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use thiserror::Error;

/// Daemon configuration, loaded from a YAML file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub eta: EtaConfig,
    #[serde(default)]
    pub home: HomeConfig,
    /// Where per-user settings such as home locations are kept
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    /// The identity this daemon runs as
    pub session: Session,
    #[serde(default)]
    pub fleet: Vec<BusAssignment>,
}

/// The hosted location table this deployment publishes to
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    #[serde(default = "default_gpsd_addr")]
    pub gpsd_addr: String,
    #[serde(default = "default_high_accuracy")]
    pub high_accuracy: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl GeoConfig {
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            high_accuracy: self.high_accuracy,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        GeoConfig {
            gpsd_addr: default_gpsd_addr(),
            high_accuracy: default_high_accuracy(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtaConfig {
    #[serde(default = "default_avg_speed_kmh")]
    pub avg_speed_kmh: f64,
}

impl Default for EtaConfig {
    fn default() -> Self {
        EtaConfig {
            avg_speed_kmh: default_avg_speed_kmh(),
        }
    }
}

/// Fallback center for students without a saved home
#[derive(Debug, Clone, Deserialize)]
pub struct HomeConfig {
    #[serde(default = "default_home_latitude")]
    pub default_latitude: f64,
    #[serde(default = "default_home_longitude")]
    pub default_longitude: f64,
}

impl HomeConfig {
    pub fn default_center(&self) -> Coordinate {
        Coordinate::new(self.default_latitude, self.default_longitude)
    }
}

impl Default for HomeConfig {
    fn default() -> Self {
        HomeConfig {
            default_latitude: default_home_latitude(),
            default_longitude: default_home_longitude(),
        }
    }
}

fn default_gpsd_addr() -> String {
    DEFAULT_GPSD_ADDR.to_string()
}

fn default_high_accuracy() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_avg_speed_kmh() -> f64 {
    DEFAULT_AVG_SPEED_KMH
}

fn default_home_latitude() -> f64 {
    22.7369
}

fn default_home_longitude() -> f64 {
    75.9193
}

fn default_storage_path() -> String {
    "data/pravaas_store.json".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.url.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "remote.url must not be empty".to_string(),
            ));
        }
        if !self.eta.avg_speed_kmh.is_finite() || self.eta.avg_speed_kmh <= 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "eta.avg_speed_kmh must be positive, got {}",
                self.eta.avg_speed_kmh
            )));
        }
        if !self.home.default_center().is_valid() {
            return Err(ConfigError::InvalidValue(format!(
                "home center ({}, {}) is out of range",
                self.home.default_latitude, self.home.default_longitude
            )));
        }
        if self.geo.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "geo.timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
