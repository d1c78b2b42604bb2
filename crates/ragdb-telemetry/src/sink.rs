use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use ragdb_core::config::TelemetrySettings;

use crate::events::EventRecord;

/// Destination for batches of event records.
///
/// Implementations make one delivery attempt per call; the shipper owns retries.
#[async_trait]
pub trait LogSink: Send + Sync {
    fn name(&self) -> &str;
    async fn ship(&self, batch: &[EventRecord]) -> Result<()>;
}

/// Elasticsearch/OpenSearch `_bulk` writer.
///
/// Each record goes to `{prefix}-{event_type}-{YYYY.MM.DD}`, dated by the
/// record's own timestamp, so an index pattern like `rag-events-query-*`
/// selects one event type over a time range.
pub struct ElasticsearchSink {
    client: Client,
    bulk_url: String,
    prefix: String,
}

impl ElasticsearchSink {
    pub fn new(base_url: &str, prefix: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "log store URL must be an http(s) URL"
        );
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build log store HTTP client")?;
        Ok(Self {
            client,
            bulk_url: format!("{}/_bulk", base_url.trim_end_matches('/')),
            prefix: prefix.to_string(),
        })
    }

    pub fn index_name(&self, record: &EventRecord) -> String {
        format!("{}-{}-{}", self.prefix, record.event_type, record.timestamp.format("%Y.%m.%d"))
    }

    /// NDJSON body: an `index` action line followed by the document, per record.
    pub fn bulk_body(&self, batch: &[EventRecord]) -> Result<String> {
        let mut body = String::new();
        for record in batch {
            let action = serde_json::json!({ "index": { "_index": self.index_name(record) } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl LogSink for ElasticsearchSink {
    fn name(&self) -> &str { "elasticsearch" }

    async fn ship(&self, batch: &[EventRecord]) -> Result<()> {
        if batch.is_empty() { return Ok(()); }
        let body = self.bulk_body(batch)?;
        let resp = self
            .client
            .post(&self.bulk_url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"))
            .body(body)
            .send()
            .await
            .context("bulk request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("bulk request rejected ({}): {}", status, text.chars().take(200).collect::<String>());
        }
        let payload: serde_json::Value = resp.json().await.context("failed to parse bulk response")?;
        if payload.get("errors").and_then(serde_json::Value::as_bool).unwrap_or(false) {
            bail!("bulk response reported item errors");
        }
        Ok(())
    }
}

/// Writes every record as one JSON `tracing` event under the `rag_events` target.
#[derive(Default)]
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    fn name(&self) -> &str { "tracing" }

    async fn ship(&self, batch: &[EventRecord]) -> Result<()> {
        for record in batch {
            let json = serde_json::to_string(record)?;
            tracing::info!(target: "rag_events", event_type = %record.event_type, record = %json);
        }
        Ok(())
    }
}

/// Keeps every shipped record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn records(&self) -> Vec<EventRecord> { self.records.lock().clone() }

    pub fn len(&self) -> usize { self.records.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait]
impl LogSink for MemorySink {
    fn name(&self) -> &str { "memory" }

    async fn ship(&self, batch: &[EventRecord]) -> Result<()> {
        self.records.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Elasticsearch when a log store URL is configured, tracing otherwise.
pub fn build_sink(settings: &TelemetrySettings) -> Result<Arc<dyn LogSink>> {
    match settings.log_store_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            tracing::info!(url, prefix = %settings.log_index_prefix, "shipping events to log store");
            Ok(Arc::new(ElasticsearchSink::new(url, &settings.log_index_prefix, Duration::from_secs(5))?))
        }
        _ => Ok(Arc::new(TracingSink)),
    }
}
