//! Telemetry Sink
//!
//! Fire-and-forget event capture consumed by the audit logger and the
//! persistence paths. The trait seam lets tests swap in a recording sink.

use std::sync::{Arc, Mutex};
use tracing::debug;

/// Fire-and-forget telemetry collaborator
pub trait TelemetrySink: Send + Sync {
    /// Capture an event. Must never block or fail the caller.
    fn capture(&self, event: &str, properties: serde_json::Value);
}

/// Default sink: forwards event summaries to the tracing subscriber
#[derive(Debug, Default)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn capture(&self, event: &str, properties: serde_json::Value) {
        debug!(event, %properties, "telemetry");
    }
}

/// Recording sink for tests
#[derive(Debug, Default, Clone)]
pub struct MemoryTelemetry {
    events: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events captured so far
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().expect("telemetry lock").clone()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn capture(&self, event: &str, properties: serde_json::Value) {
        self.events
            .lock()
            .expect("telemetry lock")
            .push((event.to_string(), properties));
    }
}
