use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use ragdb_core::config::TelemetrySettings;

use crate::metrics::{names, MetricsRegistry};
use crate::sink::LogSink;

/// One structured log-store record per ingestion, removal or query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    pub duration_ms: f64,
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventRecord {
    fn new(event_type: &str, status: &str, duration: Duration) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            document_id: None,
            query_id: None,
            duration_ms: duration.as_secs_f64() * 1000.0,
            status: status.to_string(),
            extra: Map::new(),
        }
    }

    pub fn ingest(document_id: &str, status: &str, duration: Duration) -> Self {
        Self { document_id: Some(document_id.to_string()), ..Self::new("ingest", status, duration) }
    }

    pub fn remove(document_id: &str, status: &str, duration: Duration) -> Self {
        Self { document_id: Some(document_id.to_string()), ..Self::new("remove", status, duration) }
    }

    pub fn query(query_id: &str, status: &str, duration: Duration) -> Self {
        Self { query_id: Some(query_id.to_string()), ..Self::new("query", status, duration) }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Batching and retry policy of the shipper task.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl ShipperConfig {
    pub fn from_settings(settings: &TelemetrySettings) -> Self {
        Self {
            queue_capacity: settings.log_queue_capacity.max(1),
            batch_size: settings.log_batch_size.max(1),
            flush_interval: Duration::from_millis(settings.log_flush_ms.max(1)),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Fire-and-forget handle for emitting event records. Cheap to clone.
#[derive(Clone)]
pub struct EventLogger {
    tx: mpsc::Sender<EventRecord>,
    metrics: Arc<MetricsRegistry>,
}

/// Completion handle of the shipper task. The task drains and exits once every
/// [`EventLogger`] clone has been dropped.
pub struct ShipperHandle(JoinHandle<()>);

impl ShipperHandle {
    pub async fn closed(self) {
        if let Err(e) = self.0.await {
            tracing::warn!(error = %e, "event shipper task ended abnormally");
        }
    }
}

impl EventLogger {
    /// Start the shipper on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn LogSink>, config: ShipperConfig, metrics: Arc<MetricsRegistry>) -> (Self, ShipperHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        tracing::info!(sink = sink.name(), capacity = config.queue_capacity, batch = config.batch_size, "starting event shipper");
        let handle = tokio::spawn(ship_loop(rx, sink, config, Arc::clone(&metrics)));
        (Self { tx, metrics }, ShipperHandle(handle))
    }

    /// Enqueue `record` without waiting. A full or closed queue drops it and
    /// counts the drop.
    pub fn emit(&self, record: EventRecord) {
        tracing::debug!(
            event_type = %record.event_type,
            document_id = record.document_id.as_deref().unwrap_or(""),
            query_id = record.query_id.as_deref().unwrap_or(""),
            status = %record.status,
            duration_ms = record.duration_ms,
            "event"
        );
        let reason = match self.tx.try_send(record) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => "queue_full",
            Err(TrySendError::Closed(_)) => "closed",
        };
        self.metrics.inc_counter(names::LOG_EVENTS_DROPPED_TOTAL, &[("reason", reason)], 1.0);
    }
}

async fn ship_loop(mut rx: mpsc::Receiver<EventRecord>, sink: Arc<dyn LogSink>, config: ShipperConfig, metrics: Arc<MetricsRegistry>) {
    let mut batch: Vec<EventRecord> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    batch.push(record);
                    if batch.len() >= config.batch_size {
                        flush(&mut batch, sink.as_ref(), &config, &metrics).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&mut batch, sink.as_ref(), &config, &metrics).await;
                }
            }
        }
    }
    if !batch.is_empty() {
        flush(&mut batch, sink.as_ref(), &config, &metrics).await;
    }
    tracing::debug!(sink = sink.name(), "event shipper stopped");
}

async fn flush(batch: &mut Vec<EventRecord>, sink: &dyn LogSink, config: &ShipperConfig, metrics: &MetricsRegistry) {
    let attempts = config.max_attempts.max(1);
    for attempt in 1..=attempts {
        match sink.ship(batch.as_slice()).await {
            Ok(()) => {
                batch.clear();
                return;
            }
            Err(e) if attempt < attempts => {
                tracing::warn!(sink = sink.name(), attempt, error = %e, "event batch delivery failed; retrying");
                tokio::time::sleep(config.backoff * attempt).await;
            }
            Err(e) => {
                tracing::error!(sink = sink.name(), records = batch.len(), error = %e, "dropping event batch");
            }
        }
    }
    metrics.inc_counter(names::LOG_EVENTS_DROPPED_TOTAL, &[("reason", "ship_failed")], batch.len() as f64);
    batch.clear();
}
