use pravaas_tracking::config::Config;
use pravaas_tracking::eta::EtaWatcher;
use pravaas_tracking::fleet::FleetRoster;
use pravaas_tracking::geo::{detect_source, BridgeSource, GeoSource, GpsdSource};
use pravaas_tracking::home::{FileStorage, HomeStore};
use pravaas_tracking::models::{ArrivalStatus, Role};
use pravaas_tracking::notify::LogNotifier;
use pravaas_tracking::realtime::{run_store_sync, RealtimeChannel, RestChannel};
use pravaas_tracking::store::LocationStore;
use pravaas_tracking::tracking::{TrackingController, TrackingState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "pravaas.yaml";
const FLEET_SUMMARY_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pravaas_tracking=info,pravaasd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "Could not load the configuration");
            std::process::exit(1);
        }
    };
    info!(
        path = %config_path,
        role = config.session.role.as_str(),
        "Configuration loaded"
    );

    let channel: Arc<dyn RealtimeChannel> =
        match RestChannel::new(&config.remote.url, &config.remote.api_key) {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                error!(error = %e, "Could not build the remote channel");
                std::process::exit(1);
            }
        };
    let store = Arc::new(LocationStore::new());
    let roster = FleetRoster::new(config.fleet.clone());

    match config.session.role {
        Role::Driver => run_driver(&config, channel, store, &roster).await,
        Role::Student => run_student(&config, channel, store, &roster).await,
        Role::Admin => run_admin(channel, store, &roster).await,
    }

    info!("Shutdown complete");
}

/// Publish this driver's bus until interrupted
async fn run_driver(
    config: &Config,
    channel: Arc<dyn RealtimeChannel>,
    store: Arc<LocationStore>,
    roster: &FleetRoster,
) {
    let mut session = config.session.clone();
    if session.bus_id.is_none() {
        session.bus_id = roster
            .assignment_for_driver(&session.user_id)
            .map(|bus| bus.bus_id.clone());
    }

    // gpsd first; the bridge only answers when an embedding shell feeds it
    let candidates: Vec<Arc<dyn GeoSource>> = vec![
        Arc::new(GpsdSource::with_addr(config.geo.gpsd_addr.as_str())),
        Arc::new(BridgeSource::new()),
    ];
    let source = match detect_source(candidates).await {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "No usable location provider");
            std::process::exit(1);
        }
    };

    let controller = Arc::new(TrackingController::new(
        source,
        channel,
        store,
        Arc::new(LogNotifier::new()),
        session,
        config.geo.watch_options(),
    ));

    if let Err(e) = controller.clone().start_tracking().await {
        error!(error = %e, "Could not start tracking");
        std::process::exit(1);
    }

    let mut states = controller.state_changes();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        if *states.borrow_and_update() == TrackingState::Idle {
            warn!("Tracking ended on its own, shutting down");
            break;
        }
        tokio::select! {
            _ = &mut shutdown => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(elapsed) = controller.session_elapsed() {
        info!(minutes = elapsed.num_minutes(), "Ending the tracking session");
    }
    controller.shutdown().await;
}

/// Follow one bus and log arrival estimates until interrupted
async fn run_student(
    config: &Config,
    channel: Arc<dyn RealtimeChannel>,
    store: Arc<LocationStore>,
    roster: &FleetRoster,
) {
    let session = &config.session;
    let bus_id = session.bus_id.clone().or_else(|| {
        roster
            .bus_for_student(&session.user_id)
            .map(|bus| bus.bus_id.clone())
    });
    let Some(bus_id) = bus_id else {
        error!(user_id = %session.user_id, "No bus assignment for this student");
        std::process::exit(1);
    };
    if roster.get(&bus_id).is_none() {
        warn!(bus_id = %bus_id, "Bus is not in the fleet roster");
    }

    let storage = Arc::new(FileStorage::new(&config.storage_path));
    let homes = HomeStore::new(storage, config.home.default_center());
    let home = homes.load_or_default(&session.user_id);

    let cancel = CancellationToken::new();
    let feed = tokio::spawn(run_store_sync(channel.clone(), store.clone(), cancel.clone()));

    let mut watcher = EtaWatcher::spawn(
        store.clone(),
        Arc::new(LogNotifier::new()),
        home.coordinate(),
        bus_id.clone(),
        config.eta.avg_speed_kmh,
    );
    info!(bus_id = %bus_id, "Watching the bus");

    let mut changes = watcher.changes();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                match *changes.borrow() {
                    Some(eta) => info!(
                        bus_id = %bus_id,
                        distance_km = eta.distance_km,
                        eta_minutes = eta.eta_minutes,
                        status = ArrivalStatus::from_estimate(Some(eta)).as_str(),
                        "Bus position updated"
                    ),
                    None => info!(bus_id = %bus_id, "Bus is not reporting"),
                }
            }
        }
    }

    watcher.stop().await;
    cancel.cancel();
    let _ = feed.await;
}

/// Log fleet summaries for the whole roster until interrupted
async fn run_admin(
    channel: Arc<dyn RealtimeChannel>,
    store: Arc<LocationStore>,
    roster: &FleetRoster,
) {
    if roster.buses().is_empty() {
        error!("The fleet roster is empty, nothing to watch");
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    let feed = tokio::spawn(run_store_sync(channel.clone(), store.clone(), cancel.clone()));

    let mut ticker = tokio::time::interval(Duration::from_secs(FLEET_SUMMARY_INTERVAL_SECS));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let summary = roster.summary(&store).await;
                info!(
                    total = summary.total_buses,
                    active = summary.active_buses,
                    drivers = summary.assigned_drivers,
                    students = summary.enrolled_students,
                    "Fleet summary"
                );
                for row in roster.overview(&store).await {
                    debug!(bus_id = %row.bus_id, status = row.status.as_str(), "Bus status");
                }
            }
        }
    }

    cancel.cancel();
    let _ = feed.await;
}

