use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::Instrument;

use ragdb_core::chunking::Chunker;
use ragdb_core::data_processor::DataProcessor;
use ragdb_core::error::{Error, Result};
use ragdb_core::traits::Embedder;
use ragdb_core::types::{ChunkFailure, ChunkMetadata, DocumentChunk, IngestReceipt, IngestStatus, SourceDocument, VectorRecord};
use ragdb_index::VectorIndexManager;
use ragdb_telemetry::metrics::names;
use ragdb_telemetry::{EventRecord, Telemetry};

use crate::embed_with_timeout;
use crate::health::HealthState;

/// Lifecycle of one ingestion request. `Failed` is reachable from every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Chunked,
    Embedded,
    Indexed,
    Acknowledged,
    Failed,
}

/// Removal outcome for one document.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveReceipt {
    pub document_id: String,
    pub version: u64,
}

/// Chunk → embed → index, with bounded concurrency.
pub struct IngestCoordinator {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndexManager>,
    telemetry: Telemetry,
    health: Arc<HealthState>,
    permits: Arc<Semaphore>,
    max_inflight: usize,
    embed_timeout: Duration,
}

impl IngestCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndexManager>,
        telemetry: Telemetry,
        health: Arc<HealthState>,
        max_inflight: usize,
        embed_timeout: Duration,
    ) -> Self {
        let max_inflight = max_inflight.max(1);
        Self {
            chunker,
            embedder,
            index,
            telemetry,
            health,
            permits: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
            embed_timeout,
        }
    }

    /// Ingest one document, replacing any chunks previously indexed for its id.
    ///
    /// Chunk-level failures do not fail the call: they are listed in the
    /// receipt, whose status is `Partial` or `Failed`. `Err` is reserved for
    /// requests that were never admitted (backpressure, invalid id).
    pub async fn ingest(&self, doc: SourceDocument) -> Result<IngestReceipt> {
        let _permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            tracing::warn!(limit = self.max_inflight, "rejecting ingestion: too many in flight");
            Error::Backpressure(self.max_inflight)
        })?;
        if doc.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(Error::InvalidQuery("document id must not be blank".into()));
        }
        let document_id = doc.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!("ingest", document_id = %document_id);
        self.run(doc, document_id).instrument(span).await
    }

    async fn run(&self, doc: SourceDocument, document_id: String) -> Result<IngestReceipt> {
        let start = Instant::now();
        transition(&document_id, IngestStage::Received);

        let created_at = doc.timestamp.unwrap_or_else(Utc::now);
        let chunks = self.chunker.chunk(&document_id, &doc.text, created_at);
        if chunks.is_empty() {
            let receipt = self.fail(&document_id, 0, vec![ChunkFailure { chunk_id: document_id.clone(), reason: "document produced no chunks".into() }]);
            self.finish(&receipt, start);
            return Ok(receipt);
        }
        transition(&document_id, IngestStage::Chunked);
        let chunk_count = chunks.len();

        let (records, mut failures) = self.embed_chunks(&doc, chunks).await;
        transition(&document_id, IngestStage::Embedded);

        if records.is_empty() {
            let receipt = self.fail(&document_id, chunk_count, failures);
            self.finish(&receipt, start);
            return Ok(receipt);
        }

        let embedded = records.len();
        // The build runs to completion on the blocking pool even if this future is dropped.
        let index = Arc::clone(&self.index);
        let source_id = document_id.clone();
        let built = tokio::task::spawn_blocking(move || index.replace_source(&source_id, records))
            .await
            .map_err(|e| Error::SnapshotBuild(format!("index task failed: {e}")))
            .and_then(|r| r);

        let report = match built {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "indexing failed");
                self.count_chunks("failed", embedded);
                failures.push(ChunkFailure { chunk_id: document_id.clone(), reason: e.to_string() });
                let receipt = self.fail(&document_id, chunk_count, failures);
                self.finish(&receipt, start);
                return Ok(receipt);
            }
        };
        transition(&document_id, IngestStage::Indexed);
        self.publish_index_gauges();
        self.count_chunks("ok", report.accepted);
        self.count_chunks("failed", report.rejected.len());
        failures.extend(report.rejected);

        let status = if report.accepted == 0 {
            IngestStatus::Failed
        } else if failures.is_empty() {
            IngestStatus::Acknowledged
        } else {
            let partial = Error::PartialIngestion { document_id: document_id.clone(), failed: failures.len(), total: chunk_count };
            tracing::warn!(error = %partial, "partial ingestion");
            IngestStatus::Partial
        };
        transition(&document_id, if status == IngestStatus::Failed { IngestStage::Failed } else { IngestStage::Acknowledged });

        let receipt = IngestReceipt {
            document_id,
            chunk_count,
            indexed_count: report.accepted,
            status,
            version: report.version,
            failures,
        };
        self.finish(&receipt, start);
        Ok(receipt)
    }

    /// Embed every chunk concurrently; each chunk is bounded by the embed timeout.
    async fn embed_chunks(&self, doc: &SourceDocument, chunks: Vec<DocumentChunk>) -> (Vec<VectorRecord>, Vec<ChunkFailure>) {
        let metrics = &self.telemetry.metrics;
        let tasks = chunks.into_iter().map(|chunk| {
            let embedder = Arc::clone(&self.embedder);
            let timeout = self.embed_timeout;
            async move {
                let started = Instant::now();
                let result = embed_with_timeout(embedder, chunk.text.clone(), timeout).await;
                (chunk, result, started.elapsed())
            }
        });

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for (chunk, result, elapsed) in join_all(tasks).await {
            metrics.observe(names::INGEST_CHUNK_SECONDS, &[], elapsed.as_secs_f64());
            match result {
                Ok(vector) => {
                    let metadata = ChunkMetadata::for_chunk(&chunk, doc);
                    records.push(VectorRecord { chunk_id: chunk.id, vector, metadata });
                }
                Err(e) => {
                    self.count_chunks("failed", 1);
                    tracing::warn!(chunk_id = %chunk.id, error = %e, "chunk embedding failed");
                    failures.push(ChunkFailure { chunk_id: chunk.id, reason: e.to_string() });
                }
            }
        }
        (records, failures)
    }

    /// Chunks are counted `ok` only once the index has accepted them.
    fn count_chunks(&self, status: &str, n: usize) {
        if n > 0 {
            self.telemetry.metrics.inc_counter(names::INGESTED_CHUNKS_TOTAL, &[("status", status)], n as f64);
        }
    }

    fn fail(&self, document_id: &str, chunk_count: usize, failures: Vec<ChunkFailure>) -> IngestReceipt {
        transition(document_id, IngestStage::Failed);
        IngestReceipt {
            document_id: document_id.to_string(),
            chunk_count,
            indexed_count: 0,
            status: IngestStatus::Failed,
            version: self.index.current_version(),
            failures,
        }
    }

    fn finish(&self, receipt: &IngestReceipt, start: Instant) {
        let elapsed = start.elapsed();
        let metrics = &self.telemetry.metrics;
        metrics.inc_counter(names::INGEST_DOCUMENTS_TOTAL, &[("status", receipt.status.as_str())], 1.0);
        metrics.observe(names::INGEST_DURATION_SECONDS, &[], elapsed.as_secs_f64());
        if receipt.status != IngestStatus::Failed {
            self.health.record_ingest();
        }
        self.telemetry.events.emit(
            EventRecord::ingest(&receipt.document_id, receipt.status.as_str(), elapsed)
                .with("chunkCount", receipt.chunk_count)
                .with("indexedCount", receipt.indexed_count)
                .with("version", receipt.version),
        );
        tracing::info!(
            document_id = %receipt.document_id,
            status = receipt.status.as_str(),
            chunks = receipt.chunk_count,
            indexed = receipt.indexed_count,
            version = receipt.version,
            elapsed_ms = elapsed.as_millis() as u64,
            "ingestion finished"
        );
    }

    /// Drop every chunk of `document_id`.
    pub async fn remove_document(&self, document_id: &str) -> Result<RemoveReceipt> {
        let start = Instant::now();
        let known = match self.index.snapshot() {
            Ok(snapshot) => snapshot.records().any(|r| r.metadata.source_id == document_id),
            Err(Error::IndexUnavailable) => false,
            Err(e) => return Err(e),
        };
        if !known {
            self.telemetry.events.emit(EventRecord::remove(document_id, "not_found", start.elapsed()));
            return Err(Error::NotFound(format!("document '{document_id}'")));
        }
        let index = Arc::clone(&self.index);
        let source_id = document_id.to_string();
        let version = tokio::task::spawn_blocking(move || index.remove_source(&source_id))
            .await
            .map_err(|e| Error::SnapshotBuild(format!("index task failed: {e}")))??;
        self.publish_index_gauges();
        self.health.record_ingest();
        self.telemetry.events.emit(EventRecord::remove(document_id, "acknowledged", start.elapsed()).with("version", version));
        tracing::info!(document_id, version, "document removed");
        Ok(RemoveReceipt { document_id: document_id.to_string(), version })
    }

    /// Ingest every `.txt` file under `dir` (document id = file stem).
    pub async fn ingest_directory(&self, dir: &Path, limit: Option<usize>) -> anyhow::Result<Vec<IngestReceipt>> {
        let root = dir.to_path_buf();
        let docs = tokio::task::spawn_blocking(move || {
            let processor = DataProcessor::new();
            match limit {
                Some(limit) => processor.load_directory_limited(&root, limit),
                None => processor.load_directory(&root),
            }
        })
        .await
        .context("directory loader task failed")??;

        let pb = ProgressBar::new(docs.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} documents ({percent}%) {msg}")
                .context("invalid progress template")?
                .progress_chars("#>-"),
        );
        let mut receipts = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.id.clone().unwrap_or_default();
            let receipt = self.ingest(doc).await.with_context(|| format!("ingesting '{id}'"))?;
            pb.set_message(format!("{} {}", receipt.document_id, receipt.status.as_str()));
            pb.inc(1);
            receipts.push(receipt);
        }
        pb.finish_with_message("done");
        Ok(receipts)
    }

    pub(crate) fn refresh_index_gauges(&self) {
        let metrics = &self.telemetry.metrics;
        metrics.set_gauge(names::INDEX_SIZE, &[], self.index.len() as f64);
        metrics.set_gauge(names::INDEX_VERSION, &[], self.index.current_version() as f64);
    }

    fn publish_index_gauges(&self) {
        self.refresh_index_gauges();
        self.telemetry.metrics.set_gauge(names::LAST_INDEX_UNIX, &[], Utc::now().timestamp() as f64);
    }
}

fn transition(document_id: &str, stage: IngestStage) {
    tracing::debug!(document_id, stage = ?stage, "ingest stage");
}
