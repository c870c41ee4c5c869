use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEventKind {
  BadSecret,
  BadSignature,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityEvent {
  pub kind: SecurityEventKind,
  pub route: &'static str,
  pub remote: Option<SocketAddr>,
  pub at: DateTime<Utc>,
}

/// Sink for rejected-authentication events. The broker only reports; what
/// happens next (alerting, blocking) belongs to the collector.
pub trait SecurityTelemetry: Send + Sync {
  fn record(&self, event: SecurityEvent);
}

#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl SecurityTelemetry for TracingTelemetry {
  fn record(&self, event: SecurityEvent) {
    let remote = event.remote.map(|addr| addr.to_string()).unwrap_or_else(|| "-".into());
    warn!(kind = ?event.kind, route = event.route, remote = %remote, "Rejected request");
  }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
  events: Mutex<Vec<SecurityEvent>>,
}

impl RecordingTelemetry {
  pub fn events(&self) -> Vec<SecurityEvent> {
    self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }
}

impl SecurityTelemetry for RecordingTelemetry {
  fn record(&self, event: SecurityEvent) {
    self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
  }
}
