// =============================================================================
// Alert Sink — abstract notification outlet
// =============================================================================
//
// The engine raises alerts on: the first trade of a session, the session
// daily summary, critical events of severity >= HIGH, and broker errors after
// exhausted retries. Delivery (chat service, webhook) is out of scope; the
// default sink renders alerts into the structured log.
// =============================================================================

use serde::Serialize;
use tracing::{info, warn};

use crate::types::EventSeverity;

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    FirstTrade,
    DailySummary,
    CriticalEvent,
    BrokerFailure,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstTrade => write!(f, "FIRST_TRADE"),
            Self::DailySummary => write!(f, "DAILY_SUMMARY"),
            Self::CriticalEvent => write!(f, "CRITICAL_EVENT"),
            Self::BrokerFailure => write!(f, "BROKER_FAILURE"),
        }
    }
}

/// A single alert with free-form structured fields.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: EventSeverity,
    pub fields: serde_json::Value,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: EventSeverity, fields: serde_json::Value) -> Self {
        Self {
            kind,
            severity,
            fields,
        }
    }
}

/// Abstract sink; delivery is a collaborator concern.
pub trait AlertSink: Send + Sync {
    fn send_alert(&self, alert: Alert);
}

/// Default sink: alerts land in the structured log.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send_alert(&self, alert: Alert) {
        match alert.severity {
            EventSeverity::High | EventSeverity::Critical => warn!(
                kind = %alert.kind,
                severity = %alert.severity,
                fields = %alert.fields,
                "ALERT"
            ),
            _ => info!(
                kind = %alert.kind,
                severity = %alert.severity,
                fields = %alert.fields,
                "alert"
            ),
        }
    }
}

/// Test sink that records every alert it receives.
#[cfg(test)]
pub struct CollectingAlertSink {
    pub alerts: parking_lot::Mutex<Vec<Alert>>,
}

#[cfg(test)]
impl CollectingAlertSink {
    pub fn new() -> Self {
        Self {
            alerts: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn count_of(&self, kind: AlertKind) -> usize {
        self.alerts.lock().iter().filter(|a| a.kind == kind).count()
    }
}

#[cfg(test)]
impl AlertSink for CollectingAlertSink {
    fn send_alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}
