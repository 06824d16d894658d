use std::sync::Mutex;
use tracing::{error, info, warn};

/// Alert severity, from informational to session-blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    /// Requires explicit user action, e.g. a denied location permission
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Single-shot user-facing alert surface
///
/// The core only emits alerts; rendering and dismissal belong to the
/// embedding UI.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str, severity: Severity);
}

/// Writes alerts to the log, the default surface for the headless daemon
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        LogNotifier
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str, severity: Severity) {
        let level = severity.as_str();
        match severity {
            Severity::Info => info!(severity = level, title = %title, body = %body, "User notification"),
            Severity::Warning => warn!(severity = level, title = %title, body = %body, "User notification"),
            Severity::Critical => error!(severity = level, title = %title, body = %body, "User notification"),
        }
    }
}

/// One captured alert
#[derive(Debug, Clone)]
pub struct RecordedAlert {
    pub title: String,
    pub body: String,
    pub severity: Severity,
}

/// Captures alerts for inspection instead of surfacing them
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<RecordedAlert>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        RecordingNotifier::default()
    }

    pub fn alerts(&self) -> Vec<RecordedAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count_titled(&self, title: &str) -> usize {
        self.alerts()
            .iter()
            .filter(|alert| alert.title == title)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str, severity: Severity) {
        self.alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedAlert {
                title: title.to_string(),
                body: body.to_string(),
                severity,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_notifier_captures_in_order() {
        let notifier = RecordingNotifier::new();
        notifier.notify("Bus approaching", "Bus S5 is about 5 min away", Severity::Info);
        notifier.notify("Location error", "position unavailable", Severity::Warning);

        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].title, "Bus approaching");
        assert_eq!(alerts[1].severity, Severity::Warning);
        assert_eq!(notifier.count_titled("Bus approaching"), 1);
    }
}
