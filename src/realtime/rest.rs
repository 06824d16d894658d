use crate::models::{BusLocation, PositionSample};
use crate::realtime::{ChannelEvent, ChannelSubscription, PublishError, RealtimeChannel};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 10;

const LOCATIONS_TABLE: &str = "bus_locations";
const DEACTIVATE_BODY: &str = r#"{"active":false}"#;

/// Production channel against the hosted location table
///
/// Writes and reads go through the table's REST interface; change
/// notifications arrive on a server-sent-events endpoint bound to the same
/// table.
pub struct RestChannel {
    client: reqwest::Client,
    /// Separate client for the change feed: a whole-request timeout would
    /// kill a long-lived stream
    stream_client: reqwest::Client,
    base_url: String,
    api_key: String,
    connected: Arc<AtomicBool>,
}

impl RestChannel {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| PublishError::Network(format!("failed to build HTTP client: {e}")))?;

        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| PublishError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(RestChannel {
            client,
            stream_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, LOCATIONS_TABLE)
    }

    fn changes_url(&self) -> String {
        format!("{}/realtime/v1/changes?table={}", self.base_url, LOCATIONS_TABLE)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    fn network_error(&self, e: reqwest::Error) -> PublishError {
        self.connected.store(false, Ordering::SeqCst);
        PublishError::Network(e.to_string())
    }

    /// A response means the remote was reachable, even when it rejects the
    /// operation
    async fn ensure_success(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, PublishError> {
        self.connected.store(true, Ordering::SeqCst);

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(PublishError::RemoteRejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Row filter selecting the currently active rows of one bus
fn active_filter(bus_id: &str) -> String {
    format!("bus_id=eq.{}&active=is.true", urlencoding::encode(bus_id))
}

#[async_trait]
impl RealtimeChannel for RestChannel {
    async fn publish(
        &self,
        bus_id: &str,
        driver_id: &str,
        position: PositionSample,
    ) -> Result<BusLocation, PublishError> {
        // Step one: no bus may end up with two current positions
        self.deactivate(bus_id).await?;

        // Step two: insert the fresh active row
        let location = BusLocation::from_sample(bus_id, driver_id, position);
        let body = serde_json::to_string(&location)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let response = self
            .authorized(self.client.post(self.table_url()))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .body(body)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;
        self.ensure_success(response).await?;

        debug!(bus_id = %bus_id, "Published bus location");
        Ok(location)
    }

    async fn deactivate(&self, bus_id: &str) -> Result<(), PublishError> {
        let url = format!("{}?{}", self.table_url(), active_filter(bus_id));

        let response = self
            .authorized(self.client.patch(url))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .body(DEACTIVATE_BODY)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;
        self.ensure_success(response).await?;

        Ok(())
    }

    async fn fetch_active(&self) -> Result<Vec<BusLocation>, PublishError> {
        let url = format!("{}?select=*&active=is.true", self.table_url());

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| self.network_error(e))?;
        let response = self.ensure_success(response).await?;

        response
            .json::<Vec<BusLocation>>()
            .await
            .map_err(|e| PublishError::Serialization(e.to_string()))
    }

    async fn subscribe(&self) -> Result<ChannelSubscription, PublishError> {
        let response = self
            .authorized(self.stream_client.get(self.changes_url()))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| self.network_error(e))?;
        let response = self.ensure_success(response).await?;

        let (events, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let connected = self.connected.clone();

        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            buffer.push_str(&String::from_utf8_lossy(&bytes));
                            while let Some(newline) = buffer.find('\n') {
                                let line = buffer[..newline].trim().to_string();
                                buffer.drain(..=newline);
                                if line.starts_with("data:")
                                    && events.send(ChannelEvent::Changed).await.is_err()
                                {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Location change feed failed");
                            connected.store(false, Ordering::SeqCst);
                            let _ = events.send(ChannelEvent::Disconnected).await;
                            break;
                        }
                        None => {
                            warn!("Location change feed ended");
                            connected.store(false, Ordering::SeqCst);
                            let _ = events.send(ChannelEvent::Disconnected).await;
                            break;
                        }
                    }
                }
            }
        });

        info!(table = LOCATIONS_TABLE, "Subscribed to remote location changes");
        Ok(ChannelSubscription::new(rx, cancel, task))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_escapes_the_bus_id() {
        assert_eq!(active_filter("S5"), "bus_id=eq.S5&active=is.true");
        assert_eq!(active_filter("S 5/a"), "bus_id=eq.S%205%2Fa&active=is.true");
    }

    #[test]
    fn base_url_loses_its_trailing_slash() {
        let channel = RestChannel::new("https://demo.example.com/", "key").unwrap();
        assert_eq!(
            channel.table_url(),
            "https://demo.example.com/rest/v1/bus_locations"
        );
        assert_eq!(
            channel.changes_url(),
            "https://demo.example.com/realtime/v1/changes?table=bus_locations"
        );
    }
}
