use crate::geo::{GeoError, GeoEvent, GeoSource, GeoWatch, WatchOptions};
use crate::models::{Role, Session};
use crate::notify::{Notifier, Severity};
use crate::realtime::{run_store_sync, RealtimeChannel};
use crate::store::LocationStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a driver's tracking session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingState {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl TrackingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingState::Idle => "idle",
            TrackingState::Starting => "starting",
            TrackingState::Active => "active",
            TrackingState::Stopping => "stopping",
        }
    }
}

struct TaskRuntime {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TaskRuntime {
    async fn shut_down(self) {
        self.cancel.cancel();
        if self.task.await.is_err() {
            warn!("Tracking task panicked");
        }
    }
}

/// Drives one bus's publishing session
///
/// Owns the provider watch and pushes every fix to the remote channel,
/// echoing accepted rows into the local store. The session walks
/// Idle, Starting, Active, Stopping and back to Idle; provider or publish
/// failures drop it straight from Active to Idle with a notification.
pub struct TrackingController {
    source: Arc<dyn GeoSource>,
    channel: Arc<dyn RealtimeChannel>,
    store: Arc<LocationStore>,
    notifier: Arc<dyn Notifier>,
    session: Session,
    options: WatchOptions,
    state: watch::Sender<TrackingState>,
    pump: Mutex<Option<TaskRuntime>>,
    feed: Mutex<Option<TaskRuntime>>,
    started_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl TrackingController {
    pub fn new(
        source: Arc<dyn GeoSource>,
        channel: Arc<dyn RealtimeChannel>,
        store: Arc<LocationStore>,
        notifier: Arc<dyn Notifier>,
        session: Session,
        options: WatchOptions,
    ) -> Self {
        let (state, _) = watch::channel(TrackingState::Idle);
        TrackingController {
            source,
            channel,
            store,
            notifier,
            session,
            options,
            state,
            pump: Mutex::new(None),
            feed: Mutex::new(None),
            started_at: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> TrackingState {
        *self.state.borrow()
    }

    pub fn is_tracking(&self) -> bool {
        matches!(
            self.state(),
            TrackingState::Starting | TrackingState::Active
        )
    }

    /// The bus this session publishes for, when the driver has one
    pub fn bus_id(&self) -> Option<&str> {
        self.session.bus_id.as_deref()
    }

    /// Observe state transitions, e.g. to drive a UI
    pub fn state_changes(&self) -> watch::Receiver<TrackingState> {
        self.state.subscribe()
    }

    /// How long the current session has been live
    pub fn session_elapsed(&self) -> Option<chrono::Duration> {
        let started = self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        started.map(|at| Utc::now() - at)
    }

    /// Begin publishing this driver's bus position
    ///
    /// Only an assigned driver may publish. Calling while a session is
    /// already starting or live is a no-op.
    pub async fn start_tracking(self: Arc<Self>) -> Result<(), TrackingError> {
        if self.session.role != Role::Driver {
            return Err(TrackingError::NotAuthorized(format!(
                "role {} cannot publish a bus location",
                self.session.role.as_str()
            )));
        }
        let Some(bus_id) = self.session.bus_id.clone() else {
            return Err(TrackingError::NotAuthorized(
                "no bus assigned to this driver".to_string(),
            ));
        };

        let mut pump = self.pump.lock().await;
        let state = self.state();
        if state != TrackingState::Idle {
            debug!(state = state.as_str(), "Tracking already running, start ignored");
            return Ok(());
        }
        // Reap a pump that wound itself down on an earlier failure
        if let Some(runtime) = pump.take() {
            runtime.shut_down().await;
        }

        self.set_state(TrackingState::Starting);
        let watch = match self.source.start(self.options).await {
            Ok(watch) => watch,
            Err(e) => {
                self.set_state(TrackingState::Idle);
                self.notifier.notify(
                    "Tracking failed",
                    &format!("the location provider refused to start: {e}"),
                    Severity::Critical,
                );
                return Err(TrackingError::Geo(e));
            }
        };

        let cancel = CancellationToken::new();
        let controller = Arc::clone(&self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            controller.run_pump(bus_id, watch, token).await;
        });
        *pump = Some(TaskRuntime { cancel, task });

        info!(source = self.source.name(), "Tracking session starting");
        Ok(())
    }

    /// End the session and retire the published position
    ///
    /// Calling while no session is starting or live is a no-op.
    pub async fn stop_tracking(&self) {
        let mut pump = self.pump.lock().await;

        let state = self.state();
        if !matches!(state, TrackingState::Starting | TrackingState::Active) {
            // Reap a pump that wound itself down on an earlier failure
            if let Some(runtime) = pump.take() {
                runtime.shut_down().await;
            }
            debug!(state = state.as_str(), "Tracking is not running, stop ignored");
            return;
        }

        self.set_state(TrackingState::Stopping);
        if let Some(runtime) = pump.take() {
            // The pump stops its provider watch before it finishes
            runtime.shut_down().await;
        }

        if let Some(bus_id) = self.session.bus_id.as_deref() {
            if let Err(e) = self.channel.deactivate(bus_id).await {
                warn!(error = %e, "Could not retire the remote position");
                self.notifier.notify(
                    "Stop incomplete",
                    &format!("the last published position may still look live: {e}"),
                    Severity::Warning,
                );
            }
            self.store.mark_inactive(bus_id).await;
        }

        self.set_state(TrackingState::Idle);
        info!("Tracking session ended");
    }

    /// Stop tracking and tear the store sync down as well
    pub async fn shutdown(&self) {
        self.stop_tracking().await;
        let mut feed = self.feed.lock().await;
        if let Some(runtime) = feed.take() {
            runtime.shut_down().await;
        }
    }

    async fn run_pump(
        self: Arc<Self>,
        bus_id: String,
        mut watch: GeoWatch,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = watch.recv() => match event {
                    Some(GeoEvent::Fix(sample)) => {
                        if self.state() == TrackingState::Starting {
                            self.mark_session_live(&bus_id).await;
                        }
                        match self
                            .channel
                            .publish(&bus_id, &self.session.user_id, sample)
                            .await
                        {
                            Ok(row) => self.store.upsert(row).await,
                            Err(e) => {
                                warn!(error = %e, "Publishing the position failed, tracking stopped");
                                self.notifier.notify(
                                    "Tracking stopped",
                                    &format!("could not publish the bus position: {e}"),
                                    Severity::Warning,
                                );
                                // Remote step one already retired the row
                                self.store.mark_inactive(&bus_id).await;
                                self.set_state(TrackingState::Idle);
                                break;
                            }
                        }
                    }
                    Some(GeoEvent::Error(e)) => {
                        let severity = match &e {
                            GeoError::PermissionDenied(_) => Severity::Critical,
                            _ => Severity::Warning,
                        };
                        self.notifier.notify(
                            "Tracking stopped",
                            &format!("the location provider failed: {e}"),
                            severity,
                        );
                        self.set_state(TrackingState::Idle);
                        break;
                    }
                    None => {
                        self.notifier.notify(
                            "Tracking stopped",
                            "the location stream ended",
                            Severity::Warning,
                        );
                        self.set_state(TrackingState::Idle);
                        break;
                    }
                }
            }
        }

        watch.stop().await;
    }

    /// First fix of the session: the bus is now visibly live
    async fn mark_session_live(&self, bus_id: &str) {
        *self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());

        let mut feed = self.feed.lock().await;
        if feed.is_none() {
            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_store_sync(
                self.channel.clone(),
                self.store.clone(),
                cancel.clone(),
            ));
            *feed = Some(TaskRuntime { cancel, task });
        }

        self.set_state(TrackingState::Active);
        info!(bus_id = %bus_id, "Tracking session is live");
    }

    fn set_state(&self, next: TrackingState) {
        if next == TrackingState::Idle {
            // No session, no timer
            *self
                .started_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        }
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                from = previous.as_str(),
                to = next.as_str(),
                "Tracking state changed"
            );
        }
    }
}

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Not authorized to track: {0}")]
    NotAuthorized(String),
    #[error("Location provider error: {0}")]
    Geo(#[from] GeoError),
}
