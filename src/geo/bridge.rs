use crate::geo::{GeoError, GeoEvent, GeoSource, GeoWatch, WatchGuard, WatchOptions};
use crate::models::PositionSample;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Provider fed by an embedding webview shell
///
/// The shell forwards its geolocation callbacks (fixes, permission denials,
/// per-fix failures) through a [`BridgeHandle`]; the source relays them to
/// every open watch. A denied permission prompt therefore arrives on the
/// watch channel, exactly like any other failed fix.
pub struct BridgeSource {
    inner: Arc<BridgeInner>,
    watch_count: Arc<AtomicUsize>,
    attached: AtomicBool,
}

impl BridgeSource {
    pub fn new() -> Self {
        BridgeSource {
            inner: Arc::new(BridgeInner {
                feeds: Mutex::new(Vec::new()),
                next_feed_id: AtomicU64::new(0),
            }),
            watch_count: Arc::new(AtomicUsize::new(0)),
            attached: AtomicBool::new(false),
        }
    }

    /// Push side handed to the embedding shell
    pub fn handle(&self) -> BridgeHandle {
        self.attached.store(true, Ordering::SeqCst);
        BridgeHandle {
            inner: self.inner.clone(),
        }
    }
}

impl Default for BridgeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoSource for BridgeSource {
    fn name(&self) -> &str {
        "bridge"
    }

    /// The bridge exists only once a shell has taken a handle
    async fn available(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    async fn start(&self, _options: WatchOptions) -> Result<GeoWatch, GeoError> {
        let (tx, rx) = mpsc::channel(64);
        let feed_id = self.inner.register(tx);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            inner.remove(feed_id);
        });

        debug!(feed = feed_id, "Bridge watch started");
        Ok(GeoWatch::new(
            rx,
            cancel,
            task,
            WatchGuard::register(&self.watch_count),
        ))
    }

    fn active_watches(&self) -> usize {
        self.watch_count.load(Ordering::SeqCst)
    }
}

/// Push side of the bridge; cheap to clone into shell callbacks
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<BridgeInner>,
}

impl BridgeHandle {
    pub fn push_fix(&self, sample: PositionSample) {
        self.inner.push(GeoEvent::Fix(sample));
    }

    pub fn push_error(&self, error: GeoError) {
        self.inner.push(GeoEvent::Error(error));
    }
}

struct BridgeInner {
    feeds: Mutex<Vec<(u64, mpsc::Sender<GeoEvent>)>>,
    next_feed_id: AtomicU64,
}

impl BridgeInner {
    fn register(&self, sender: mpsc::Sender<GeoEvent>) -> u64 {
        let feed_id = self.next_feed_id.fetch_add(1, Ordering::SeqCst);
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((feed_id, sender));
        feed_id
    }

    fn remove(&self, feed_id: u64) {
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != feed_id);
    }

    /// Relay to every open watch; pushes with no watch open are dropped
    fn push(&self, event: GeoEvent) {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds.retain(|(feed_id, sender)| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(feed = feed_id, "Bridge watch is not draining, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixes_reach_the_open_watch() {
        let source = BridgeSource::new();
        let handle = source.handle();
        let mut watch = source.start(WatchOptions::default()).await.unwrap();

        handle.push_fix(PositionSample::new(22.74, 75.92).with_speed(6.0));

        match watch.recv().await {
            Some(GeoEvent::Fix(sample)) => {
                assert_eq!(sample.latitude, 22.74);
                assert_eq!(sample.speed, Some(6.0));
            }
            other => panic!("expected a fix, got {other:?}"),
        }

        watch.stop().await;
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn permission_denial_flows_as_an_event() {
        let source = BridgeSource::new();
        let handle = source.handle();
        let mut watch = source.start(WatchOptions::default()).await.unwrap();

        handle.push_error(GeoError::PermissionDenied(
            "user dismissed the prompt".to_string(),
        ));

        match watch.recv().await {
            Some(GeoEvent::Error(GeoError::PermissionDenied(_))) => {}
            other => panic!("expected permission denial, got {other:?}"),
        }

        watch.stop().await;
    }

    #[tokio::test]
    async fn pushes_without_a_watch_are_harmless() {
        let source = BridgeSource::new();
        source.handle().push_fix(PositionSample::new(22.74, 75.92));
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn unattached_bridge_reports_unavailable() {
        let source = BridgeSource::new();
        assert!(!source.available().await);

        let _handle = source.handle();
        assert!(source.available().await);
    }

    #[tokio::test]
    async fn stopped_watch_stops_receiving() {
        let source = BridgeSource::new();
        let handle = source.handle();
        let mut watch = source.start(WatchOptions::default()).await.unwrap();

        watch.stop().await;
        handle.push_fix(PositionSample::new(22.74, 75.92));

        // The feed is gone, so the channel reports closed rather than a fix
        assert!(watch.recv().await.is_none());
    }

    #[tokio::test]
    async fn every_open_watch_receives_the_fix() {
        let source = BridgeSource::new();
        let handle = source.handle();
        let mut first = source.start(WatchOptions::default()).await.unwrap();
        let mut second = source.start(WatchOptions::default()).await.unwrap();
        assert_eq!(source.active_watches(), 2);

        handle.push_fix(PositionSample::new(22.74, 75.92));

        assert!(matches!(first.recv().await, Some(GeoEvent::Fix(_))));
        assert!(matches!(second.recv().await, Some(GeoEvent::Fix(_))));

        first.stop().await;
        second.stop().await;
        assert_eq!(source.active_watches(), 0);
    }
}
