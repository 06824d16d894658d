use crate::models::BusLocation;
use crate::store::LocationStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// One bus of the fleet with its route and riders
#[derive(Debug, Clone, Deserialize)]
pub struct BusAssignment {
    pub bus_id: String,
    pub route_name: String,
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub student_ids: Vec<String>,
}

/// What the admin map shows for one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackingStatus {
    /// A driver is publishing right now
    Live,
    /// The last session's final position; the bus is not tracking
    LastKnown,
    /// The bus never reported a position
    NoData,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Live => "live",
            TrackingStatus::LastKnown => "last_known",
            TrackingStatus::NoData => "no_data",
        }
    }
}

/// One row of the admin fleet view
#[derive(Debug, Clone, Serialize)]
pub struct BusOverview {
    pub bus_id: String,
    pub route_name: String,
    pub driver_id: Option<String>,
    pub student_count: usize,
    pub status: TrackingStatus,
    pub location: Option<BusLocation>,
}

/// Fleet-wide counters for the admin header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub total_buses: usize,
    pub active_buses: usize,
    pub assigned_drivers: usize,
    pub enrolled_students: usize,
}

/// The configured fleet: buses, their routes, drivers and riders
///
/// The roster is static configuration; live positions come from the
/// location store and are joined in on demand.
pub struct FleetRoster {
    buses: Vec<BusAssignment>,
}

impl FleetRoster {
    pub fn new(buses: Vec<BusAssignment>) -> Self {
        let mut seen = HashSet::new();
        for bus in &buses {
            if !seen.insert(bus.bus_id.clone()) {
                warn!(bus_id = %bus.bus_id, "Duplicate bus in the fleet roster");
            }
        }
        FleetRoster { buses }
    }

    pub fn buses(&self) -> &[BusAssignment] {
        &self.buses
    }

    pub fn get(&self, bus_id: &str) -> Option<&BusAssignment> {
        self.buses.iter().find(|bus| bus.bus_id == bus_id)
    }

    /// The bus a driver is assigned to drive
    pub fn assignment_for_driver(&self, driver_id: &str) -> Option<&BusAssignment> {
        self.buses
            .iter()
            .find(|bus| bus.driver_id.as_deref() == Some(driver_id))
    }

    /// The bus a student rides
    pub fn bus_for_student(&self, student_id: &str) -> Option<&BusAssignment> {
        self.buses
            .iter()
            .find(|bus| bus.student_ids.iter().any(|id| id == student_id))
    }

    /// Buses whose id or route name contains the query, case-insensitive
    pub fn search(&self, query: &str) -> Vec<&BusAssignment> {
        let query = query.to_lowercase();
        self.buses
            .iter()
            .filter(|bus| {
                bus.bus_id.to_lowercase().contains(&query)
                    || bus.route_name.to_lowercase().contains(&query)
            })
            .collect()
    }

    /// Joins the roster with the store into the admin map rows
    pub async fn overview(&self, store: &LocationStore) -> Vec<BusOverview> {
        let mut rows = Vec::with_capacity(self.buses.len());
        for bus in &self.buses {
            let location = store.get(&bus.bus_id).await;
            let status = match &location {
                Some(row) if row.active => TrackingStatus::Live,
                Some(_) => TrackingStatus::LastKnown,
                None => TrackingStatus::NoData,
            };
            rows.push(BusOverview {
                bus_id: bus.bus_id.clone(),
                route_name: bus.route_name.clone(),
                driver_id: bus.driver_id.clone(),
                student_count: bus.student_ids.len(),
                status,
                location,
            });
        }
        rows
    }

    pub async fn summary(&self, store: &LocationStore) -> FleetSummary {
        let overview = self.overview(store).await;
        let students: HashSet<&str> = self
            .buses
            .iter()
            .flat_map(|bus| bus.student_ids.iter().map(String::as_str))
            .collect();

        FleetSummary {
            total_buses: self.buses.len(),
            active_buses: overview
                .iter()
                .filter(|row| row.status == TrackingStatus::Live)
                .count(),
            assigned_drivers: self
                .buses
                .iter()
                .filter(|bus| bus.driver_id.is_some())
                .count(),
            enrolled_students: students.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSample;

    fn assignment(bus_id: &str, route: &str, driver: Option<&str>, students: &[&str]) -> BusAssignment {
        BusAssignment {
            bus_id: bus_id.to_string(),
            route_name: route.to_string(),
            driver_id: driver.map(str::to_string),
            student_ids: students.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn roster() -> FleetRoster {
        FleetRoster::new(vec![
            assignment("S5", "Vijay Nagar", Some("d1"), &["alice", "bob"]),
            assignment("S7", "Palasia", Some("d2"), &["carol"]),
            assignment("S9", "Rau Circle", None, &[]),
        ])
    }

    #[test]
    fn lookups_find_drivers_and_students() {
        let roster = roster();
        assert_eq!(roster.assignment_for_driver("d2").unwrap().bus_id, "S7");
        assert!(roster.assignment_for_driver("unknown").is_none());
        assert_eq!(roster.bus_for_student("bob").unwrap().bus_id, "S5");
        assert!(roster.bus_for_student("mallory").is_none());
    }

    #[test]
    fn search_matches_id_and_route_case_insensitively() {
        let roster = roster();
        let hits = roster.search("pala");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].bus_id, "S7");
        assert_eq!(roster.search("s").len(), 3);
        assert!(roster.search("airport").is_empty());
    }

    #[tokio::test]
    async fn overview_joins_live_and_stale_positions() {
        let roster = roster();
        let store = LocationStore::new();
        store
            .upsert(BusLocation::from_sample(
                "S5",
                "d1",
                PositionSample::new(22.74, 75.92),
            ))
            .await;
        let mut stale = BusLocation::from_sample("S7", "d2", PositionSample::new(22.70, 75.88));
        stale.active = false;
        store.upsert(stale).await;

        let rows = roster.overview(&store).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].status, TrackingStatus::Live);
        assert_eq!(rows[1].status, TrackingStatus::LastKnown);
        assert_eq!(rows[2].status, TrackingStatus::NoData);
        assert!(rows[2].location.is_none());
        assert_eq!(rows[0].student_count, 2);
    }

    #[tokio::test]
    async fn summary_counts_the_fleet() {
        let roster = roster();
        let store = LocationStore::new();
        store
            .upsert(BusLocation::from_sample(
                "S5",
                "d1",
                PositionSample::new(22.74, 75.92),
            ))
            .await;

        let summary = roster.summary(&store).await;
        assert_eq!(
            summary,
            FleetSummary {
                total_buses: 3,
                active_buses: 1,
                assigned_drivers: 2,
                enrolled_students: 3,
            }
        );
    }
}
