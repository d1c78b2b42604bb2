//! Metrics aggregation and structured event shipping.

use std::sync::Arc;

use ragdb_core::config::TelemetrySettings;

pub mod events;
pub mod metrics;
pub mod sink;

pub use events::{EventLogger, EventRecord, ShipperConfig, ShipperHandle};
pub use metrics::{MetricEvent, MetricKind, MetricsRegistry};
pub use sink::{build_sink, ElasticsearchSink, LogSink, MemorySink, TracingSink};

/// Metrics registry and event logger shared by every coordinator.
#[derive(Clone)]
pub struct Telemetry {
    pub metrics: Arc<MetricsRegistry>,
    pub events: EventLogger,
}

impl Telemetry {
    /// Build the registry and start shipping events to `sink`. Must be called
    /// inside a tokio runtime.
    pub fn start(settings: &TelemetrySettings, sink: Arc<dyn LogSink>) -> (Self, ShipperHandle) {
        let metrics = Arc::new(MetricsRegistry::with_rag_metrics(&settings.latency_buckets));
        let (events, handle) = EventLogger::spawn(sink, ShipperConfig::from_settings(settings), Arc::clone(&metrics));
        (Self { metrics, events }, handle)
    }

    /// Like [`Telemetry::start`] with the sink chosen from `settings`.
    pub fn from_settings(settings: &TelemetrySettings) -> anyhow::Result<(Self, ShipperHandle)> {
        let sink = build_sink(settings)?;
        Ok(Self::start(settings, sink))
    }
}
