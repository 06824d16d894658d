use crate::models::BusLocation;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Broadcast on every mutation so derived views can recompute
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Row inserted or replaced for this bus
    Upserted(BusLocation),
    /// Row flipped inactive; the last position is retained
    Deactivated(String),
}

/// The single authoritative in-memory snapshot of latest location per bus
///
/// One row per bus, no eviction: rows persist as inactive until the process
/// ends, which is fine because the table is bounded by fleet size.
pub struct LocationStore {
    rows: RwLock<HashMap<String, BusLocation>>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        LocationStore {
            rows: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Replace whatever row the bus had; last write wins by call order
    ///
    /// Re-applying an identical row emits no event.
    pub async fn upsert(&self, location: BusLocation) {
        let mut rows = self.rows.write().await;
        let replaced = rows.insert(location.bus_id.clone(), location.clone());
        drop(rows);

        if replaced.as_ref() != Some(&location) {
            let _ = self.events.send(StoreEvent::Upserted(location));
        }
    }

    pub async fn get(&self, bus_id: &str) -> Option<BusLocation> {
        self.rows.read().await.get(bus_id).cloned()
    }

    /// Point-in-time snapshot of every row, active or not
    pub async fn all(&self) -> Vec<BusLocation> {
        self.rows.read().await.values().cloned().collect()
    }

    pub async fn active(&self) -> Vec<BusLocation> {
        self.rows
            .read()
            .await
            .values()
            .filter(|row| row.active)
            .cloned()
            .collect()
    }

    /// Flip the bus inactive, keeping its last position
    ///
    /// Returns whether an active row was actually flipped.
    pub async fn mark_inactive(&self, bus_id: &str) -> bool {
        let mut rows = self.rows.write().await;
        let flipped = match rows.get_mut(bus_id) {
            Some(row) if row.active => {
                row.active = false;
                true
            }
            _ => false,
        };
        drop(rows);

        if flipped {
            debug!(bus_id = %bus_id, "Marked bus inactive in local store");
            let _ = self.events.send(StoreEvent::Deactivated(bus_id.to_string()));
        }
        flipped
    }

    /// Reconcile against an authoritative active-row snapshot
    ///
    /// Fetched rows replace local ones; buses missing from the snapshot are
    /// flipped inactive rather than removed. Re-applying the same snapshot
    /// is harmless, so a delayed notification never corrupts the table.
    pub async fn replace_active(&self, fetched: Vec<BusLocation>) {
        let fetched_ids: HashSet<String> = fetched.iter().map(|row| row.bus_id.clone()).collect();
        let mut deactivated = Vec::new();
        let mut upserted = Vec::new();

        let mut rows = self.rows.write().await;
        for (bus_id, row) in rows.iter_mut() {
            if row.active && !fetched_ids.contains(bus_id) {
                row.active = false;
                deactivated.push(bus_id.clone());
            }
        }
        for location in fetched {
            let replaced = rows.get(&location.bus_id);
            if replaced != Some(&location) {
                upserted.push(location.clone());
            }
            rows.insert(location.bus_id.clone(), location);
        }
        drop(rows);

        debug!(
            upserted = upserted.len(),
            deactivated = deactivated.len(),
            "Reconciled store against remote snapshot"
        );
        for bus_id in deactivated {
            let _ = self.events.send(StoreEvent::Deactivated(bus_id));
        }
        for location in upserted {
            let _ = self.events.send(StoreEvent::Upserted(location));
        }
    }

    /// Change feed; subscribers that fall behind see a lag error, not stale rows
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

impl Default for LocationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSample;

    fn row(bus_id: &str, latitude: f64, active: bool) -> BusLocation {
        let mut location =
            BusLocation::from_sample(bus_id, "driver-1", PositionSample::new(latitude, 75.92));
        location.active = active;
        location
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_bus() {
        let store = LocationStore::new();
        assert!(store.is_empty().await);

        store.upsert(row("S5", 22.74, true)).await;
        store.upsert(row("S5", 22.75, true)).await;
        store.upsert(row("S7", 22.10, true)).await;

        assert_eq!(store.len().await, 2);
        assert_eq!(store.active().await.len(), 2);
        let latest = store.get("S5").await.unwrap();
        assert_eq!(latest.position.latitude, 22.75);
    }

    #[tokio::test]
    async fn last_write_wins_by_call_order() {
        let store = LocationStore::new();
        // Second row carries an older timestamp; call order still wins
        let newer = row("S5", 22.74, true);
        let mut older = row("S5", 22.75, true);
        older.position.captured_at = newer.position.captured_at - chrono::Duration::minutes(5);

        store.upsert(newer).await;
        store.upsert(older).await;

        assert_eq!(store.get("S5").await.unwrap().position.latitude, 22.75);
    }

    #[tokio::test]
    async fn mark_inactive_retains_last_position() {
        let store = LocationStore::new();
        store.upsert(row("S5", 22.74, true)).await;

        assert!(store.mark_inactive("S5").await);
        let stored = store.get("S5").await.unwrap();
        assert!(!stored.active);
        assert_eq!(stored.position.latitude, 22.74);

        // Second flip and unknown ids are no-ops
        assert!(!store.mark_inactive("S5").await);
        assert!(!store.mark_inactive("unknown").await);
    }

    #[tokio::test]
    async fn replace_active_deactivates_missing_buses() {
        let store = LocationStore::new();
        store.upsert(row("S5", 22.74, true)).await;
        store.upsert(row("S7", 22.10, true)).await;

        store.replace_active(vec![row("S7", 22.11, true)]).await;

        // Both rows survive; only S7 is still in the active view
        assert_eq!(store.all().await.len(), 2);
        let active = store.active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].bus_id, "S7");

        assert!(!store.get("S5").await.unwrap().active);
        let surviving = store.get("S7").await.unwrap();
        assert!(surviving.active);
        assert_eq!(surviving.position.latitude, 22.11);
    }

    #[tokio::test]
    async fn replace_active_is_idempotent() {
        let store = LocationStore::new();
        let snapshot = vec![row("S5", 22.74, true)];

        store.replace_active(snapshot.clone()).await;
        store.replace_active(snapshot).await;

        assert_eq!(store.len().await, 1);
        assert!(store.get("S5").await.unwrap().active);
    }

    #[tokio::test]
    async fn subscribers_observe_mutations() {
        let store = LocationStore::new();
        let mut events = store.subscribe();

        store.upsert(row("S5", 22.74, true)).await;
        store.mark_inactive("S5").await;

        match events.recv().await.unwrap() {
            StoreEvent::Upserted(location) => assert_eq!(location.bus_id, "S5"),
            other => panic!("expected upsert, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            StoreEvent::Deactivated(bus_id) => assert_eq!(bus_id, "S5"),
            other => panic!("expected deactivation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identical_upsert_is_event_quiet() {
        let store = LocationStore::new();
        let mut events = store.subscribe();
        let location = row("S5", 22.74, true);

        store.upsert(location.clone()).await;
        store.upsert(location).await;
        store.upsert(row("S5", 22.75, true)).await;

        // The repeated row emits nothing, so the feed jumps to the change
        match events.recv().await.unwrap() {
            StoreEvent::Upserted(location) => assert_eq!(location.position.latitude, 22.74),
            other => panic!("expected upsert, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            StoreEvent::Upserted(location) => assert_eq!(location.position.latitude, 22.75),
            other => panic!("expected upsert, got {other:?}"),
        }
    }
}
