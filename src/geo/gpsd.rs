use crate::geo::{GeoError, GeoEvent, GeoSource, GeoWatch, WatchGuard, WatchOptions};
use crate::models::PositionSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_GPSD_ADDR: &str = "127.0.0.1:2947";
const WATCH_COMMAND: &str = "?WATCH={\"enable\":true,\"json\":true}\n";

// gpsd fix modes: 0 unknown, 1 no fix, 2 2D, 3 3D
const MODE_2D_FIX: u8 = 2;

/// Native platform provider backed by the local gpsd daemon
///
/// gpsd speaks newline-delimited JSON over TCP; enabling a watch makes it
/// push TPV reports for every fix.
pub struct GpsdSource {
    addr: String,
    watch_count: Arc<AtomicUsize>,
}

impl GpsdSource {
    pub fn new() -> Self {
        Self::with_addr(DEFAULT_GPSD_ADDR)
    }

    pub fn with_addr(addr: impl Into<String>) -> Self {
        GpsdSource {
            addr: addr.into(),
            watch_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for GpsdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoSource for GpsdSource {
    fn name(&self) -> &str {
        "gpsd"
    }

    async fn available(&self) -> bool {
        TcpStream::connect(&self.addr).await.is_ok()
    }

    async fn start(&self, options: WatchOptions) -> Result<GeoWatch, GeoError> {
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                GeoError::ProviderUnavailable(format!(
                    "no answer from gpsd at {} within {}s",
                    self.addr,
                    options.timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                GeoError::ProviderUnavailable(format!("cannot reach gpsd at {}: {}", self.addr, e))
            })?;

        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(WATCH_COMMAND.as_bytes())
            .await
            .map_err(|e| {
                GeoError::ProviderUnavailable(format!("failed to enable gpsd watch: {e}"))
            })?;

        debug!(addr = %self.addr, "Enabled gpsd watch");

        let (events, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let fix_timeout = options.timeout;

        let task = tokio::spawn(async move {
            // gpsd tears the session down when the write half closes
            let _writer = writer;
            let mut lines = BufReader::new(reader).lines();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    line = tokio::time::timeout(fix_timeout, lines.next_line()) => match line {
                        Ok(Ok(Some(line))) => {
                            if let Some(event) = event_from_line(&line) {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Ok(None)) => {
                            warn!("gpsd closed the connection");
                            let _ = events
                                .send(GeoEvent::Error(GeoError::PositionUnavailable(
                                    "gpsd closed the connection".to_string(),
                                )))
                                .await;
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "Reading from gpsd failed");
                            let _ = events
                                .send(GeoEvent::Error(GeoError::PositionUnavailable(
                                    e.to_string(),
                                )))
                                .await;
                            break;
                        }
                        Err(_) => {
                            // Line inactivity, not fatal: report it and keep watching
                            let _ = events
                                .send(GeoEvent::Error(GeoError::Timeout(fix_timeout.as_secs())))
                                .await;
                        }
                    }
                }
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

/// gpsd TPV report, one JSON object per line
#[derive(Debug, Deserialize)]
struct TpvReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    /// Ground speed in m/s
    speed: Option<f64>,
    /// Course over ground in degrees from true north
    track: Option<f64>,
    /// Estimated horizontal position error in meters
    eph: Option<f64>,
    time: Option<String>,
}

/// Interpret one report line; classes other than TPV carry no position
fn event_from_line(line: &str) -> Option<GeoEvent> {
    let report: TpvReport = match serde_json::from_str(line) {
        Ok(report) => report,
        Err(e) => {
            debug!(error = %e, "Skipping unparseable gpsd line");
            return None;
        }
    };

    if report.class != "TPV" {
        return None;
    }

    if report.mode < MODE_2D_FIX {
        return Some(GeoEvent::Error(GeoError::PositionUnavailable(format!(
            "gpsd reports no fix (mode {})",
            report.mode
        ))));
    }

    let (Some(lat), Some(lon)) = (report.lat, report.lon) else {
        return Some(GeoEvent::Error(GeoError::PositionUnavailable(
            "TPV report without coordinates".to_string(),
        )));
    };

    let mut sample = PositionSample::new(lat, lon);
    if let Some(speed) = report.speed {
        sample = sample.with_speed(speed);
    }
    if let Some(track) = report.track {
        sample = sample.with_heading(track);
    }
    if let Some(eph) = report.eph {
        sample = sample.with_accuracy(eph);
    }
    if let Some(time) = &report.time {
        if let Ok(captured_at) = DateTime::parse_from_rfc3339(time) {
            sample = sample.with_captured_at(captured_at.with_timezone(&Utc));
        }
    }

    Some(GeoEvent::Fix(sample))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tpv_with_fix_becomes_a_sample() {
        let line = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2026-08-22T06:10:00.000Z","lat":22.7401,"lon":75.9221,"alt":550.1,"speed":8.3,"track":141.0,"eph":4.2}"#;

        let Some(GeoEvent::Fix(sample)) = event_from_line(line) else {
            panic!("expected a fix");
        };
        assert_eq!(sample.latitude, 22.7401);
        assert_eq!(sample.longitude, 75.9221);
        assert_eq!(sample.speed, Some(8.3));
        assert_eq!(sample.heading, Some(141.0));
        assert_eq!(sample.accuracy, Some(4.2));
        assert_eq!(sample.captured_at.to_rfc3339(), "2026-08-22T06:10:00+00:00");
    }

    #[test]
    fn tpv_without_fix_reports_position_unavailable() {
        let line = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":1}"#;

        let Some(GeoEvent::Error(GeoError::PositionUnavailable(_))) = event_from_line(line) else {
            panic!("expected a position-unavailable error");
        };
    }

    #[test]
    fn tpv_missing_coordinates_is_an_error() {
        let line = r#"{"class":"TPV","mode":2,"time":"2026-08-22T06:10:00.000Z"}"#;

        let Some(GeoEvent::Error(GeoError::PositionUnavailable(_))) = event_from_line(line) else {
            panic!("expected a position-unavailable error");
        };
    }

    #[test]
    fn non_tpv_classes_are_skipped() {
        let version = r#"{"class":"VERSION","release":"3.25","rev":"3.25"}"#;
        let sky = r#"{"class":"SKY","device":"/dev/ttyUSB0","nSat":11,"uSat":8}"#;

        assert!(event_from_line(version).is_none());
        assert!(event_from_line(sky).is_none());
        assert!(event_from_line("not json at all").is_none());
    }

    #[tokio::test]
    async fn unreachable_daemon_is_unavailable() {
        // Port 1 needs root to bind, so the connect is refused immediately
        let source = GpsdSource::with_addr("127.0.0.1:1");
        assert!(!source.available().await);
    }
}
