use std::sync::Arc;
use std::time::Duration;

use ragdb_core::chunking::Chunker;
use ragdb_core::config::Settings;
use ragdb_core::error::{Error, Result};
use ragdb_core::traits::Embedder;
use ragdb_index::VectorIndexManager;
use ragdb_telemetry::{MetricsRegistry, Telemetry};

pub mod health;
pub mod ingest;
pub mod query;

pub use health::{HealthReport, HealthState};
pub use ingest::{IngestCoordinator, IngestStage, RemoveReceipt};
pub use query::{QueryCoordinator, QueryResponse};

/// The retrieval pipeline: one index, one encoder, and the coordinators that share them.
pub struct Pipeline {
    pub ingest: IngestCoordinator,
    pub query: QueryCoordinator,
    index: Arc<VectorIndexManager>,
    telemetry: Telemetry,
    health: Arc<HealthState>,
}

impl Pipeline {
    pub fn new(settings: &Settings, embedder: Arc<dyn Embedder>, telemetry: Telemetry) -> Result<Self> {
        settings.validate()?;
        let dim = settings.index.dim.unwrap_or_else(|| embedder.dim());
        if dim != embedder.dim() {
            return Err(Error::InvalidConfig(format!(
                "index.dim ({dim}) does not match the {} embedder dimension ({})",
                embedder.embedder_id(),
                embedder.dim()
            )));
        }
        let index = Arc::new(VectorIndexManager::new(dim, settings.index.metric));
        let health = Arc::new(HealthState::new());
        let embed_timeout = Duration::from_millis(settings.embedder.timeout_ms.max(1));
        tracing::info!(dim, metric = %settings.index.metric, embedder = embedder.embedder_id(), "pipeline ready");

        let ingest = IngestCoordinator::new(
            Chunker::new(settings.chunking)?,
            Arc::clone(&embedder),
            Arc::clone(&index),
            telemetry.clone(),
            Arc::clone(&health),
            settings.ingest.max_inflight,
            embed_timeout,
        );
        let query = QueryCoordinator::new(
            embedder,
            Arc::clone(&index),
            telemetry.clone(),
            Arc::clone(&health),
            settings.query.clone(),
            embed_timeout,
        );
        Ok(Self { ingest, query, index, telemetry, health })
    }

    /// Build with the encoder selected by `settings.embedder`.
    pub fn from_settings(settings: &Settings, telemetry: Telemetry) -> anyhow::Result<Self> {
        let embedder = ragdb_embed::build_embedder(&settings.embedder)?;
        Ok(Self::new(settings, embedder, telemetry)?)
    }

    pub fn index(&self) -> &Arc<VectorIndexManager> { &self.index }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> { &self.telemetry.metrics }

    pub fn health(&self) -> &Arc<HealthState> { &self.health }

    pub fn health_report(&self) -> HealthReport { self.health.report(&self.index) }

    /// Prometheus exposition with the index gauges refreshed first.
    pub fn render_metrics(&self) -> String {
        self.ingest.refresh_index_gauges();
        self.telemetry.metrics.render()
    }
}

/// Run one embedding on the blocking pool, bounded by `timeout`. A timed-out
/// call keeps running in the background; its result is discarded.
pub(crate) async fn embed_with_timeout(embedder: Arc<dyn Embedder>, text: String, timeout: Duration) -> Result<Vec<f32>> {
    let task = tokio::task::spawn_blocking(move || embedder.embed(&text));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(Error::Encoding(format!("embedding task failed: {e}"))),
        Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
    }
}
