use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A geographic point in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Coordinate {
            latitude,
            longitude,
        }
    }

    /// Finite and within the WGS84 value range
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A single location fix from a device provider
///
/// Immutable once created; folded into a [`BusLocation`] and not retained
/// as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters, when the provider reports one
    pub accuracy: Option<f64>,
    /// Ground speed in m/s
    pub speed: Option<f64>,
    /// Course over ground in degrees from true north, [0, 360)
    pub heading: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        PositionSample {
            latitude,
            longitude,
            accuracy: None,
            speed: None,
            heading: None,
            captured_at: Utc::now(),
        }
    }

    /// Providers signal "unknown accuracy" with negative values
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = (accuracy >= 0.0).then_some(accuracy);
        self
    }

    /// Negative speeds mean "unknown" in both provider APIs
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = (speed.is_finite() && speed >= 0.0).then_some(speed);
        self
    }

    /// Wraps into [0, 360); NaN (stationary device) becomes unknown
    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = heading.is_finite().then(|| heading.rem_euclid(360.0));
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Live location row for one tracked bus
///
/// At most one row per bus is active at a time. Rows are soft-deactivated,
/// never deleted, so the admin view can tell "last known, now inactive"
/// apart from "no data ever".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusLocation {
    /// Remote row identifier, assigned on publish
    pub id: String,
    pub bus_id: String,
    /// Driver who produced the row
    pub driver_id: String,
    #[serde(flatten)]
    pub position: PositionSample,
    pub active: bool,
}

impl BusLocation {
    /// Build the active row published for a fresh fix
    pub fn from_sample(bus_id: &str, driver_id: &str, position: PositionSample) -> Self {
        BusLocation {
            id: Uuid::new_v4().to_string(),
            bus_id: bus_id.to_string(),
            driver_id: driver_id.to_string(),
            position,
            active: true,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        self.position.coordinate()
    }
}

/// A student's saved home coordinate
///
/// Mutated only by explicit user action; persists across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeLocation {
    pub owner_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl HomeLocation {
    pub fn new(owner_id: &str, latitude: f64, longitude: f64) -> Self {
        HomeLocation {
            owner_id: owner_id.to_string(),
            latitude,
            longitude,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Derived arrival estimate; recomputed on every location change, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EtaResult {
    /// Great-circle distance from home to the bus in kilometers
    pub distance_km: f64,
    /// Whole minutes remaining at the assumed average speed
    pub eta_minutes: u32,
}

/// Arrival badge shown next to the ETA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalStatus {
    ArrivingSoon,
    GettingClose,
    OnTime,
    /// No active location row for the bus
    NotActive,
}

impl ArrivalStatus {
    pub const ARRIVING_SOON_MAX_MINUTES: u32 = 10;
    pub const GETTING_CLOSE_MAX_MINUTES: u32 = 20;

    pub fn from_estimate(estimate: Option<EtaResult>) -> Self {
        match estimate {
            None => ArrivalStatus::NotActive,
            Some(eta) if eta.eta_minutes <= Self::ARRIVING_SOON_MAX_MINUTES => {
                ArrivalStatus::ArrivingSoon
            }
            Some(eta) if eta.eta_minutes <= Self::GETTING_CLOSE_MAX_MINUTES => {
                ArrivalStatus::GettingClose
            }
            Some(_) => ArrivalStatus::OnTime,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArrivalStatus::ArrivingSoon => "arriving soon",
            ArrivalStatus::GettingClose => "getting close",
            ArrivalStatus::OnTime => "on time",
            ArrivalStatus::NotActive => "not active",
        }
    }
}

/// Account role, mirrored from the auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Driver,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Driver => "driver",
            Role::Student => "student",
        }
    }
}

/// Authenticated user identity for the running process
///
/// Supplied externally and treated as opaque; the core never refreshes or
/// re-validates it.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    /// Bus assignment; drivers need one before tracking can start
    #[serde(default)]
    pub bus_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_builders_drop_unknown_values() {
        let sample = PositionSample::new(22.74, 75.92)
            .with_speed(-1.0)
            .with_heading(f64::NAN)
            .with_accuracy(-5.0);

        assert_eq!(sample.speed, None);
        assert_eq!(sample.heading, None);
        assert_eq!(sample.accuracy, None);
    }

    #[test]
    fn sample_heading_wraps_into_range() {
        let sample = PositionSample::new(22.74, 75.92).with_heading(450.0);
        assert_eq!(sample.heading, Some(90.0));

        let sample = PositionSample::new(22.74, 75.92).with_heading(-90.0);
        assert_eq!(sample.heading, Some(270.0));
    }

    #[test]
    fn coordinate_validity_bounds() {
        assert!(Coordinate::new(22.7369, 75.9193).is_valid());
        assert!(Coordinate::new(-90.0, 180.0).is_valid());
        assert!(!Coordinate::new(91.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, -181.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn fresh_rows_are_active() {
        let row = BusLocation::from_sample("S5", "driver-1", PositionSample::new(22.74, 75.92));
        assert!(row.active);
        assert_eq!(row.bus_id, "S5");
        assert!(!row.id.is_empty());
    }

    #[test]
    fn bus_location_serializes_position_fields_inline() {
        let row = BusLocation::from_sample("S5", "driver-1", PositionSample::new(22.74, 75.92));
        let json = serde_json::to_value(&row).unwrap();

        assert_eq!(json["bus_id"], "S5");
        assert_eq!(json["latitude"], 22.74);
        assert_eq!(json["active"], true);
    }

    #[test]
    fn role_uses_lowercase_names() {
        let role: Role = serde_json::from_str("\"driver\"").unwrap();
        assert_eq!(role, Role::Driver);
        assert_eq!(role.as_str(), "driver");
    }

    #[test]
    fn arrival_status_thresholds() {
        let eta = |minutes| {
            Some(EtaResult {
                distance_km: 1.0,
                eta_minutes: minutes,
            })
        };

        assert_eq!(ArrivalStatus::from_estimate(eta(1)), ArrivalStatus::ArrivingSoon);
        assert_eq!(ArrivalStatus::from_estimate(eta(10)), ArrivalStatus::ArrivingSoon);
        assert_eq!(ArrivalStatus::from_estimate(eta(11)), ArrivalStatus::GettingClose);
        assert_eq!(ArrivalStatus::from_estimate(eta(20)), ArrivalStatus::GettingClose);
        assert_eq!(ArrivalStatus::from_estimate(eta(21)), ArrivalStatus::OnTime);
        assert_eq!(ArrivalStatus::from_estimate(None), ArrivalStatus::NotActive);
    }
}
