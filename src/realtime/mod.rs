use crate::models::{BusLocation, PositionSample};
use crate::store::LocationStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod memory;
pub mod rest;

pub use memory::MemoryChannel;
pub use rest::RestChannel;

/// Remote change notification delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The remote location table changed; refetch to observe it
    Changed,
    /// The feed dropped; no further notifications will arrive
    Disconnected,
}

/// Conduit between local writes and the remote location table
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Two-step write: deactivate any prior active rows for the bus, then
    /// insert the fresh one
    ///
    /// The two steps are not atomic across the boundary. A crash between
    /// them leaves the bus with zero active rows until the next publish
    /// heals it, but never with two.
    async fn publish(
        &self,
        bus_id: &str,
        driver_id: &str,
        position: PositionSample,
    ) -> Result<BusLocation, PublishError>;

    /// Flip every active remote row for the bus inactive
    async fn deactivate(&self, bus_id: &str) -> Result<(), PublishError>;

    /// Authoritative snapshot of every active row
    async fn fetch_active(&self) -> Result<Vec<BusLocation>, PublishError>;

    /// Register for change notifications on the location table
    async fn subscribe(&self) -> Result<ChannelSubscription, PublishError>;

    /// Whether the last remote interaction succeeded
    fn is_connected(&self) -> bool;
}

/// Registration over a remote change feed
pub struct ChannelSubscription {
    events: mpsc::Receiver<ChannelEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChannelSubscription {
    pub(crate) fn new(
        events: mpsc::Receiver<ChannelEvent>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        ChannelSubscription {
            events,
            cancel,
            task: Some(task),
        }
    }

    /// Next notification; `None` once the registration is released
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Release the registration; idempotent
    pub async fn unsubscribe(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Mirror the remote location table into the local store until cancelled
///
/// Every notification triggers a full refetch of the active rows; there is
/// no incremental diffing because ordering across concurrent remote writers
/// is not otherwise observable. A dropped feed ends the sync; whoever
/// spawned it decides whether to subscribe again.
pub async fn run_store_sync(
    channel: Arc<dyn RealtimeChannel>,
    store: Arc<LocationStore>,
    cancel: CancellationToken,
) {
    let mut subscription = match channel.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "Could not subscribe to the remote location feed");
            return;
        }
    };

    // Bootstrap before the first notification arrives
    refetch(channel.as_ref(), &store).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = subscription.recv() => match event {
                Some(ChannelEvent::Changed) => refetch(channel.as_ref(), &store).await,
                Some(ChannelEvent::Disconnected) => {
                    warn!("Remote location feed disconnected, store sync stopped");
                    break;
                }
                None => break,
            }
        }
    }

    subscription.unsubscribe().await;
}

async fn refetch(channel: &dyn RealtimeChannel, store: &LocationStore) {
    match channel.fetch_active().await {
        Ok(rows) => store.replace_active(rows).await,
        Err(e) => warn!(error = %e, "Failed to refetch active bus locations"),
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Remote store rejected the write (status {status}): {body}")]
    RemoteRejected { status: u16, body: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
}
