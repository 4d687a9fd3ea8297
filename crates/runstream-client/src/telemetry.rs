use serde_json::{Map, Value};
use tracing::info;

/// Fire-and-forget analytics sink.
pub trait TelemetrySink: Send + Sync {
    fn track(&self, event: &str, props: Map<String, Value>);
}

/// Emits every tracked event as a `tracing` record.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn track(&self, event: &str, props: Map<String, Value>) {
        let props = Value::Object(props);
        info!(telemetry_event = event, props = %props, "telemetry");
    }
}

/// Drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn track(&self, _event: &str, _props: Map<String, Value>) {}
}
