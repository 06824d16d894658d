use crate::models::{BusLocation, PositionSample};
use crate::realtime::{ChannelEvent, ChannelSubscription, PublishError, RealtimeChannel};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const FEED_BUFFER: usize = 16;

/// In-process channel holding the location table in memory
///
/// Used by the offline demo mode and by tests. Mirrors the remote table's
/// behavior, including the two-step publish, and counts calls so tests can
/// assert on traffic.
pub struct MemoryChannel {
    rows: Mutex<Vec<BusLocation>>,
    feeds: Arc<Mutex<Vec<(u64, mpsc::Sender<ChannelEvent>)>>>,
    next_feed_id: AtomicU64,
    publish_calls: AtomicUsize,
    connected: AtomicBool,
    fail_publishes: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        MemoryChannel {
            rows: Mutex::new(Vec::new()),
            feeds: Arc::new(Mutex::new(Vec::new())),
            next_feed_id: AtomicU64::new(1),
            publish_calls: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            fail_publishes: AtomicBool::new(false),
        }
    }

    /// Number of publish calls received, failed ones included
    pub fn publish_count(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub async fn rows(&self) -> Vec<BusLocation> {
        self.rows.lock().await.clone()
    }

    pub async fn active_rows_for(&self, bus_id: &str) -> Vec<BusLocation> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|row| row.bus_id == bus_id && row.active)
            .cloned()
            .collect()
    }

    /// Make subsequent publish calls fail with a network error
    pub fn fail_next_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Drop the connection: subscribers see a Disconnected event
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify(ChannelEvent::Disconnected).await;
    }

    async fn notify(&self, event: ChannelEvent) {
        let mut feeds = self.feeds.lock().await;
        feeds.retain(|(feed_id, sender)| match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(feed_id, "Channel feed is not keeping up, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Flips the bus's active rows in place, reporting whether any changed
    async fn deactivate_rows(&self, bus_id: &str) -> bool {
        let mut rows = self.rows.lock().await;
        let mut changed = false;
        for row in rows.iter_mut() {
            if row.bus_id == bus_id && row.active {
                row.active = false;
                changed = true;
            }
        }
        changed
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        MemoryChannel::new()
    }
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    async fn publish(
        &self,
        bus_id: &str,
        driver_id: &str,
        position: PositionSample,
    ) -> Result<BusLocation, PublishError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        // Step one: retire whatever the bus published before
        if self.deactivate_rows(bus_id).await {
            self.notify(ChannelEvent::Changed).await;
        }

        // Injected failures hit between the two steps, which is the gap the
        // non-atomic write can really leave
        if self.fail_publishes.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(PublishError::Network("injected publish failure".into()));
        }

        // Step two: insert the fresh active row
        let location = BusLocation::from_sample(bus_id, driver_id, position);
        self.rows.lock().await.push(location.clone());
        self.notify(ChannelEvent::Changed).await;

        Ok(location)
    }

    async fn deactivate(&self, bus_id: &str) -> Result<(), PublishError> {
        if self.deactivate_rows(bus_id).await {
            self.notify(ChannelEvent::Changed).await;
        }
        Ok(())
    }

    async fn fetch_active(&self) -> Result<Vec<BusLocation>, PublishError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| row.active)
            .cloned()
            .collect())
    }

    async fn subscribe(&self) -> Result<ChannelSubscription, PublishError> {
        let (sender, rx) = mpsc::channel(FEED_BUFFER);
        let feed_id = self.next_feed_id.fetch_add(1, Ordering::SeqCst);
        self.feeds.lock().await.push((feed_id, sender));

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let feeds = self.feeds.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            feeds.lock().await.retain(|(id, _)| *id != feed_id);
        });

        Ok(ChannelSubscription::new(rx, cancel, task))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSample;

    fn sample(latitude: f64, longitude: f64) -> PositionSample {
        PositionSample::new(latitude, longitude)
    }

    #[tokio::test]
    async fn publish_keeps_one_active_row_per_bus() {
        let channel = MemoryChannel::new();

        channel.publish("S5", "d1", sample(22.73, 75.91)).await.unwrap();
        channel.publish("S5", "d1", sample(22.74, 75.92)).await.unwrap();

        assert_eq!(channel.publish_count(), 2);
        assert_eq!(channel.rows().await.len(), 2);
        let active = channel.active_rows_for("S5").await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].position.latitude, 22.74);
    }

    #[tokio::test]
    async fn failed_publish_leaves_no_active_row() {
        let channel = MemoryChannel::new();
        channel.publish("S5", "d1", sample(22.73, 75.91)).await.unwrap();

        channel.fail_next_publishes(true);
        let result = channel.publish("S5", "d1", sample(22.74, 75.92)).await;

        assert!(matches!(result, Err(PublishError::Network(_))));
        assert!(!channel.is_connected());
        assert!(channel.active_rows_for("S5").await.is_empty());
        assert_eq!(channel.publish_count(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_changes_until_they_unsubscribe() {
        let channel = MemoryChannel::new();
        let mut subscription = channel.subscribe().await.unwrap();

        channel.publish("S5", "d1", sample(22.73, 75.91)).await.unwrap();
        assert_eq!(subscription.recv().await, Some(ChannelEvent::Changed));

        subscription.unsubscribe().await;
        assert!(channel.feeds.lock().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_reaches_subscribers() {
        let channel = MemoryChannel::new();
        let mut subscription = channel.subscribe().await.unwrap();

        channel.disconnect().await;

        assert_eq!(subscription.recv().await, Some(ChannelEvent::Disconnected));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn deactivate_is_quiet_when_nothing_is_active() {
        let channel = MemoryChannel::new();
        let mut subscription = channel.subscribe().await.unwrap();

        channel.deactivate("S5").await.unwrap();

        channel.publish("S5", "d1", sample(22.73, 75.91)).await.unwrap();
        // The first event is the publish, not the no-op deactivate
        assert_eq!(subscription.recv().await, Some(ChannelEvent::Changed));
        channel.disconnect().await;
        assert_eq!(subscription.recv().await, Some(ChannelEvent::Disconnected));
    }
}
