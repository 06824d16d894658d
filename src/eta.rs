use crate::models::{ArrivalStatus, Coordinate, EtaResult};
use crate::notify::{Notifier, Severity};
use crate::store::{LocationStore, StoreEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Mean Earth radius in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Assumed average bus speed when none is measured
pub const DEFAULT_AVG_SPEED_KMH: f64 = 30.0;

/// An ETA at or below this many minutes raises the approach alert
pub const APPROACH_THRESHOLD_MINUTES: u32 = 10;

/// Great-circle distance between two points using the haversine formula
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);

    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

/// Whole minutes to cover the distance at the given average speed
///
/// The speed comes from validated configuration and is always positive.
pub fn eta_minutes(distance_km: f64, avg_speed_kmh: f64) -> u32 {
    (distance_km / avg_speed_kmh * 60.0).round() as u32
}

/// Arrival estimate for a bus, or `None` when it has no active position
pub fn estimate(home: Coordinate, bus: Option<Coordinate>, avg_speed_kmh: f64) -> Option<EtaResult> {
    let bus = bus?;
    let distance = distance_km(home, bus);

    Some(EtaResult {
        distance_km: distance,
        eta_minutes: eta_minutes(distance, avg_speed_kmh),
    })
}

/// Recomputes the arrival estimate on every store change for one bus and
/// raises a one-time approach alert per approach window
pub struct EtaWatcher {
    latest: watch::Receiver<Option<EtaResult>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EtaWatcher {
    pub fn spawn(
        store: Arc<LocationStore>,
        notifier: Arc<dyn Notifier>,
        home: Coordinate,
        bus_id: String,
        avg_speed_kmh: f64,
    ) -> Self {
        let (latest_tx, latest_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let inner = Arc::new(WatcherInner {
            store,
            notifier,
            home,
            bus_id,
            avg_speed_kmh,
            latest: latest_tx,
            approach_notified: AtomicBool::new(false),
        });

        let task = tokio::spawn(inner.run(cancel.clone()));

        EtaWatcher {
            latest: latest_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Most recent estimate; `None` while the bus is not active
    pub fn latest(&self) -> Option<EtaResult> {
        *self.latest.borrow()
    }

    pub fn status(&self) -> ArrivalStatus {
        ArrivalStatus::from_estimate(self.latest())
    }

    /// Receiver that observes every recomputed estimate
    pub fn changes(&self) -> watch::Receiver<Option<EtaResult>> {
        self.latest.clone()
    }

    /// Idempotent; the recompute loop is gone once this returns
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EtaWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatcherInner {
    store: Arc<LocationStore>,
    notifier: Arc<dyn Notifier>,
    home: Coordinate,
    bus_id: String,
    avg_speed_kmh: f64,
    latest: watch::Sender<Option<EtaResult>>,
    approach_notified: AtomicBool,
}

impl WatcherInner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.store.subscribe();

        // Seed from whatever the store already holds
        self.recompute().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(StoreEvent::Upserted(row)) if row.bus_id == self.bus_id => {
                        self.recompute().await;
                    }
                    Ok(StoreEvent::Deactivated(bus_id)) if bus_id == self.bus_id => {
                        self.recompute().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(bus_id = %self.bus_id, skipped, "ETA watcher lagged behind store events");
                        self.recompute().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    async fn recompute(&self) {
        let bus = self
            .store
            .get(&self.bus_id)
            .await
            .filter(|row| row.active)
            .map(|row| row.coordinate());

        let estimate = estimate(self.home, bus, self.avg_speed_kmh);
        self.latest.send_replace(estimate);
        self.evaluate_alert(estimate);
    }

    /// One alert per approach window; the window resets when the ETA climbs
    /// back above the threshold or the bus goes inactive
    fn evaluate_alert(&self, estimate: Option<EtaResult>) {
        match estimate {
            Some(eta) if eta.eta_minutes > 0 && eta.eta_minutes <= APPROACH_THRESHOLD_MINUTES => {
                if !self.approach_notified.swap(true, Ordering::SeqCst) {
                    info!(
                        bus_id = %self.bus_id,
                        eta_minutes = eta.eta_minutes,
                        "Bus approaching home"
                    );
                    self.notifier.notify(
                        "Bus approaching",
                        &format!("Bus {} is about {} min away", self.bus_id, eta.eta_minutes),
                        Severity::Info,
                    );
                }
            }
            Some(eta) if eta.eta_minutes > APPROACH_THRESHOLD_MINUTES => {
                self.approach_notified.store(false, Ordering::SeqCst);
            }
            None => {
                self.approach_notified.store(false, Ordering::SeqCst);
            }
            // An ETA of zero means the bus has arrived; the window stays used
            Some(_) => {}
        }
    }
}
