use crate::geo::{GeoError, GeoEvent, GeoSource, GeoWatch, WatchGuard, WatchOptions};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Replays a fixed sequence of events, for tests and dry runs
///
/// After the script is exhausted the watch stays open like a real provider
/// would, unless [`close_when_done`](Self::close_when_done) asked for the
/// stream to end.
pub struct ScriptedSource {
    script: Vec<GeoEvent>,
    interval: Duration,
    hold_open: bool,
    available: bool,
    watch_count: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(script: Vec<GeoEvent>) -> Self {
        ScriptedSource {
            script,
            interval: Duration::ZERO,
            hold_open: true,
            available: true,
            watch_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A provider that does not exist in this runtime
    pub fn unavailable() -> Self {
        let mut source = Self::new(Vec::new());
        source.available = false;
        source
    }

    /// Delay between scripted events
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// End the stream after the script instead of holding the watch open
    pub fn close_when_done(mut self) -> Self {
        self.hold_open = false;
        self
    }
}

#[async_trait]
impl GeoSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn available(&self) -> bool {
        self.available
    }

    async fn start(&self, _options: WatchOptions) -> Result<GeoWatch, GeoError> {
        if !self.available {
            return Err(GeoError::ProviderUnavailable(
                "scripted source is marked unavailable".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let script = self.script.clone();
        let interval = self.interval;
        let hold_open = self.hold_open;

        let task = tokio::spawn(async move {
            for event in script {
                if !interval.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            if hold_open {
                token.cancelled().await;
            }
        });

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSample;

    #[tokio::test]
    async fn replays_the_script_in_order() {
        let source = ScriptedSource::new(vec![
            GeoEvent::Fix(PositionSample::new(22.740, 75.920)),
            GeoEvent::Fix(PositionSample::new(22.741, 75.921)),
        ])
        .close_when_done();

        let mut watch = source.start(WatchOptions::default()).await.unwrap();

        match watch.recv().await {
            Some(GeoEvent::Fix(sample)) => assert_eq!(sample.latitude, 22.740),
            other => panic!("expected first fix, got {other:?}"),
        }
        match watch.recv().await {
            Some(GeoEvent::Fix(sample)) => assert_eq!(sample.latitude, 22.741),
            other => panic!("expected second fix, got {other:?}"),
        }
        assert!(watch.recv().await.is_none());

        watch.stop().await;
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_the_watch() {
        let source =
            ScriptedSource::new(vec![GeoEvent::Fix(PositionSample::new(22.74, 75.92))]);
        let mut watch = source.start(WatchOptions::default()).await.unwrap();
        assert_eq!(source.active_watches(), 1);

        watch.stop().await;
        watch.stop().await;
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn unavailable_source_refuses_to_start() {
        let source = ScriptedSource::unavailable();
        assert!(!source.available().await);
        assert!(matches!(
            source.start(WatchOptions::default()).await,
            Err(GeoError::ProviderUnavailable(_))
        ));
    }
}
