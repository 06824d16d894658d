use crate::models::PositionSample;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod bridge;
pub mod gpsd;
pub mod scripted;

pub use bridge::{BridgeHandle, BridgeSource};
pub use gpsd::GpsdSource;
pub use scripted::ScriptedSource;

/// Watch parameters forwarded to the underlying provider
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// How long to wait for a connect or a single fix
    pub timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
        }
    }
}

/// One emission from a running watch
///
/// Failed fixes arrive on the same channel as successful ones; a permission
/// prompt resolves asynchronously, so denial is an event, not an early
/// return from `start`.
#[derive(Debug, Clone)]
pub enum GeoEvent {
    Fix(PositionSample),
    Error(GeoError),
}

/// A device location provider behind one contract
///
/// Two concrete providers (the gpsd daemon and the webview bridge) are
/// interchangeable here so the tracking controller never branches on which
/// one the runtime offers.
#[async_trait]
pub trait GeoSource: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Whether the provider exists in the current runtime
    async fn available(&self) -> bool;

    /// Begin a provider-level watch
    async fn start(&self, options: WatchOptions) -> Result<GeoWatch, GeoError>;

    /// Watches started and not yet stopped
    fn active_watches(&self) -> usize;
}

/// Handle over a running provider watch
///
/// Dropping the handle cancels the watch; `stop` additionally waits until
/// the provider task is gone, so no callback fires afterwards.
pub struct GeoWatch {
    events: mpsc::Receiver<GeoEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    guard: Option<WatchGuard>,
}

impl GeoWatch {
    pub(crate) fn new(
        events: mpsc::Receiver<GeoEvent>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
        guard: WatchGuard,
    ) -> Self {
        GeoWatch {
            events,
            cancel,
            task: Some(task),
            guard: Some(guard),
        }
    }

    /// Next fix or error; `None` once the provider stream has ended
    pub async fn recv(&mut self) -> Option<GeoEvent> {
        self.events.recv().await
    }

    /// Cancel the underlying watch and wait for the provider task to finish
    ///
    /// Idempotent: stopping an already-stopped watch is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.guard.take();
    }
}

impl Drop for GeoWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Keeps the per-source watch count honest across every exit path
#[derive(Debug)]
pub(crate) struct WatchGuard {
    counter: Arc<AtomicUsize>,
}

impl WatchGuard {
    pub(crate) fn register(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        WatchGuard {
            counter: counter.clone(),
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pick the first available provider, in the caller's preference order
pub async fn detect_source(
    candidates: Vec<Arc<dyn GeoSource>>,
) -> Result<Arc<dyn GeoSource>, GeoError> {
    for source in candidates {
        if source.available().await {
            info!(provider = source.name(), "Selected location provider");
            return Ok(source);
        }
    }

    Err(GeoError::ProviderUnavailable(
        "no location provider in this runtime".to_string(),
    ))
}

/// One-shot fix: start a watch, take the first usable event, stop
pub async fn current_position(
    source: &dyn GeoSource,
    options: WatchOptions,
) -> Result<PositionSample, GeoError> {
    let mut watch = source.start(options).await?;

    let result = match tokio::time::timeout(options.timeout, watch.recv()).await {
        Ok(Some(GeoEvent::Fix(sample))) => Ok(sample),
        Ok(Some(GeoEvent::Error(error))) => Err(error),
        Ok(None) => Err(GeoError::PositionUnavailable(
            "provider stream ended before the first fix".to_string(),
        )),
        Err(_) => Err(GeoError::Timeout(options.timeout.as_secs())),
    };

    watch.stop().await;
    result
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GeoError {
    #[error("Location permission denied: {0}")]
    PermissionDenied(String),
    #[error("No location provider available: {0}")]
    ProviderUnavailable(String),
    #[error("Position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("Location request timed out after {0}s")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detect_source_skips_unavailable_providers() {
        let dead: Arc<dyn GeoSource> = Arc::new(ScriptedSource::unavailable());
        let live: Arc<dyn GeoSource> = Arc::new(ScriptedSource::new(Vec::new()));

        let selected = detect_source(vec![dead, live]).await.unwrap();
        assert_eq!(selected.name(), "scripted");
    }

    #[tokio::test]
    async fn detect_source_fails_when_nothing_is_available() {
        let result = detect_source(vec![]).await;
        assert!(matches!(result, Err(GeoError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn detect_source_skips_a_bridge_without_a_shell() {
        let gpsd_down: Arc<dyn GeoSource> = Arc::new(ScriptedSource::unavailable());
        let bridge = Arc::new(BridgeSource::new());
        let as_source: Arc<dyn GeoSource> = bridge.clone();

        let unattached = detect_source(vec![gpsd_down.clone(), as_source.clone()]).await;
        assert!(matches!(unattached, Err(GeoError::ProviderUnavailable(_))));

        // Once a shell holds a handle the bridge is a real candidate
        let _handle = bridge.handle();
        let selected = detect_source(vec![gpsd_down, as_source]).await.unwrap();
        assert_eq!(selected.name(), "bridge");
    }

    #[tokio::test]
    async fn current_position_returns_first_fix_and_releases_watch() {
        let source = ScriptedSource::new(vec![
            GeoEvent::Fix(PositionSample::new(22.74, 75.92)),
            GeoEvent::Fix(PositionSample::new(22.75, 75.93)),
        ]);

        let sample = current_position(&source, WatchOptions::default())
            .await
            .unwrap();
        assert_eq!(sample.latitude, 22.74);
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn current_position_surfaces_provider_error() {
        let source = ScriptedSource::new(vec![GeoEvent::Error(GeoError::PermissionDenied(
            "user dismissed the prompt".to_string(),
        ))]);

        let result = current_position(&source, WatchOptions::default()).await;
        assert!(matches!(result, Err(GeoError::PermissionDenied(_))));
        assert_eq!(source.active_watches(), 0);
    }
}
