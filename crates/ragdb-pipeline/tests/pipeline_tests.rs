use std::sync::Arc;
use std::time::Duration;

use ragdb_core::chunking::ChunkingConfig;
use ragdb_core::config::Settings;
use ragdb_core::error::{Error, Result};
use ragdb_core::traits::Embedder;
use ragdb_core::types::{IngestStatus, MetadataFilter, MetaValue, QueryRequest, SourceDocument};
use ragdb_embed::HashingEmbedder;
use ragdb_pipeline::Pipeline;
use ragdb_telemetry::metrics::names;
use ragdb_telemetry::{MemorySink, ShipperHandle, Telemetry};

const DIM: usize = 64;

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.embedder.dim = DIM;
    settings.telemetry.log_flush_ms = 10;
    settings
}

fn hashing() -> Arc<dyn Embedder> {
    Arc::new(HashingEmbedder::new(DIM, 16_384))
}

fn pipeline_with(settings: &Settings, embedder: Arc<dyn Embedder>) -> (Pipeline, Arc<MemorySink>, ShipperHandle) {
    let sink = Arc::new(MemorySink::new());
    let (telemetry, handle) = Telemetry::start(&settings.telemetry, sink.clone());
    let pipeline = Pipeline::new(settings, embedder, telemetry).expect("pipeline");
    (pipeline, sink, handle)
}

/// Hashing encoder that fails on any text containing "poison".
struct PoisonEmbedder(HashingEmbedder);

impl Embedder for PoisonEmbedder {
    fn embedder_id(&self) -> &str { "poison" }
    fn dim(&self) -> usize { self.0.dim() }
    fn max_len(&self) -> usize { self.0.max_len() }
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains("poison") {
            return Err(Error::Encoding("poisoned chunk".into()));
        }
        self.0.embed(text)
    }
}

/// Hashing encoder that blocks for a fixed delay before answering.
struct SlowEmbedder(HashingEmbedder, Duration);

impl Embedder for SlowEmbedder {
    fn embedder_id(&self) -> &str { "slow" }
    fn dim(&self) -> usize { self.0.dim() }
    fn max_len(&self) -> usize { self.0.max_len() }
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        std::thread::sleep(self.1);
        self.0.embed(text)
    }
}

/// Hashing encoder whose output loses one component for text containing "skew".
struct SkewEmbedder(HashingEmbedder);

impl Embedder for SkewEmbedder {
    fn embedder_id(&self) -> &str { "skew" }
    fn dim(&self) -> usize { self.0.dim() }
    fn max_len(&self) -> usize { self.0.max_len() }
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = self.0.embed(text)?;
        if text.contains("skew") { v.pop(); }
        Ok(v)
    }
}

#[tokio::test]
async fn ingested_document_is_retrievable() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());

    let receipt = pipeline.ingest.ingest(SourceDocument::new("doc1", "the quick brown fox")).await.expect("ingest");
    assert_eq!(receipt.status, IngestStatus::Acknowledged);
    assert_eq!((receipt.chunk_count, receipt.indexed_count, receipt.version), (1, 1, 1));

    let response = pipeline.query.query(QueryRequest::new("quick fox", 1)).await.expect("query");
    assert_eq!(response.version, 1);
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].chunk_id, "doc1-0");
    assert!(response.hits[0].score > 0.0);
    assert_eq!(response.hits[0].metadata.source_id, "doc1");
}

#[tokio::test]
async fn query_against_empty_index_returns_nothing() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());
    let response = pipeline.query.query(QueryRequest::new("anything", 5)).await.expect("query");
    assert!(response.hits.is_empty());
    assert_eq!(response.version, 0);
}

#[tokio::test]
async fn invalid_queries_are_rejected_and_counted() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());
    let max_k = pipeline.query.settings().max_k;

    for request in [QueryRequest::new("fox", 0), QueryRequest::new("fox", max_k + 1), QueryRequest::new("  ", 3)] {
        let err = pipeline.query.query(request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)), "got {err:?}");
    }
    assert_eq!(pipeline.metrics().value(names::QUERIES_TOTAL, &[("status", "invalid")]), Some(3.0));
    assert_eq!(pipeline.metrics().value(names::QUERIES_TOTAL, &[("status", "success")]), None);
}

#[tokio::test]
async fn reingestion_replaces_previous_chunks() {
    let mut settings = test_settings();
    settings.chunking = ChunkingConfig { window_tokens: 4, overlap_tokens: 0 };
    let (pipeline, _sink, _handle) = pipeline_with(&settings, hashing());

    let long = "one two three four five six seven eight nine ten";
    let first = pipeline.ingest.ingest(SourceDocument::new("doc", long)).await.expect("ingest");
    assert_eq!(first.chunk_count, 3);
    let again = pipeline.ingest.ingest(SourceDocument::new("doc", long)).await.expect("ingest");
    assert_eq!(again.chunk_count, 3);
    assert_eq!(pipeline.index().len(), 3, "same document, same chunk ids");

    pipeline.ingest.ingest(SourceDocument::new("doc", "one two three")).await.expect("ingest");
    let snapshot = pipeline.index().pin().expect("published");
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains("doc-0"));
    assert!(!snapshot.contains("doc-2"), "stale chunks are gone");
}

#[tokio::test]
async fn failed_chunks_yield_partial_receipt() {
    let mut settings = test_settings();
    settings.chunking = ChunkingConfig { window_tokens: 2, overlap_tokens: 0 };
    let (pipeline, _sink, _handle) = pipeline_with(&settings, Arc::new(PoisonEmbedder(HashingEmbedder::new(DIM, 16_384))));

    let receipt = pipeline
        .ingest
        .ingest(SourceDocument::new("doc", "alpha beta poison gamma delta epsilon"))
        .await
        .expect("ingest");
    assert_eq!(receipt.status, IngestStatus::Partial);
    assert_eq!((receipt.chunk_count, receipt.indexed_count), (3, 2));
    assert_eq!(receipt.failures.len(), 1);
    assert_eq!(receipt.failures[0].chunk_id, "doc-1");
    assert_eq!(pipeline.metrics().value(names::INGESTED_CHUNKS_TOTAL, &[("status", "failed")]), Some(1.0));

    let failed = pipeline.ingest.ingest(SourceDocument::new("bad", "poison poison")).await.expect("ingest");
    assert_eq!(failed.status, IngestStatus::Failed);
    assert_eq!(failed.version, receipt.version, "nothing published");
}

#[tokio::test]
async fn blank_document_fails_without_publishing() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());
    let receipt = pipeline.ingest.ingest(SourceDocument::new("empty", "   ")).await.expect("ingest");
    assert_eq!(receipt.status, IngestStatus::Failed);
    assert_eq!(receipt.chunk_count, 0);
    assert_eq!(pipeline.index().current_version(), 0);

    let blank_id = SourceDocument::new(" ", "text");
    assert!(matches!(pipeline.ingest.ingest(blank_id).await, Err(Error::InvalidQuery(_))));
}

#[tokio::test]
async fn missing_document_id_is_generated() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());
    let doc = SourceDocument { text: "generated id".into(), ..SourceDocument::default() };
    let receipt = pipeline.ingest.ingest(doc).await.expect("ingest");
    assert!(!receipt.document_id.is_empty());
    assert_eq!(receipt.status, IngestStatus::Acknowledged);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn excess_ingestions_are_rejected_with_backpressure() {
    let mut settings = test_settings();
    settings.ingest.max_inflight = 1;
    let slow: Arc<dyn Embedder> = Arc::new(SlowEmbedder(HashingEmbedder::new(DIM, 16_384), Duration::from_millis(300)));
    let (pipeline, _sink, _handle) = pipeline_with(&settings, slow);
    let pipeline = Arc::new(pipeline);

    let busy = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.ingest.ingest(SourceDocument::new("a", "slow text")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rejected = pipeline.ingest.ingest(SourceDocument::new("b", "other text")).await;
    assert!(matches!(rejected, Err(Error::Backpressure(1))));
    let receipt = busy.await.expect("join").expect("ingest");
    assert_eq!(receipt.status, IngestStatus::Acknowledged);
}

#[tokio::test]
async fn embedding_timeout_fails_the_chunk() {
    let mut settings = test_settings();
    settings.embedder.timeout_ms = 20;
    let slow: Arc<dyn Embedder> = Arc::new(SlowEmbedder(HashingEmbedder::new(DIM, 16_384), Duration::from_millis(200)));
    let (pipeline, _sink, _handle) = pipeline_with(&settings, slow);

    let receipt = pipeline.ingest.ingest(SourceDocument::new("doc", "too slow")).await.expect("ingest");
    assert_eq!(receipt.status, IngestStatus::Failed);
    assert!(receipt.failures[0].reason.contains("Timed out"));
}

#[tokio::test]
async fn filtered_query_overfetches_until_k_hits() {
    let mut settings = test_settings();
    settings.query.overfetch_factor = 1;
    settings.query.max_overfetch_rounds = 3;
    let (pipeline, _sink, _handle) = pipeline_with(&settings, hashing());

    for i in 0..20 {
        let mut doc = SourceDocument::new(format!("doc{i:02}"), format!("shared words here item{i}"));
        doc.extra.insert("lang".into(), MetaValue::from(if i % 2 == 0 { "de" } else { "en" }));
        pipeline.ingest.ingest(doc).await.expect("ingest");
    }

    let mut filter = MetadataFilter::default();
    filter.extra.insert("lang".into(), "de".into());
    let response = pipeline.query.query(QueryRequest::new("shared words", 3).with_filter(filter)).await.expect("query");
    assert_eq!(response.hits.len(), 3);
    assert!(response.hits.iter().all(|h| h.metadata.extra.get("lang") == Some(&MetaValue::from("de"))));
    assert!(response.hits.windows(2).all(|w| w[0].score >= w[1].score));

    let nobody = MetadataFilter { source_id: Some("missing".into()), ..MetadataFilter::default() };
    let response = pipeline.query.query(QueryRequest::new("shared words", 3).with_filter(nobody)).await.expect("query");
    assert!(response.hits.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queries_total_matches_completed_invocations() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());
    let pipeline = Arc::new(pipeline);
    pipeline.ingest.ingest(SourceDocument::new("doc1", "the quick brown fox")).await.expect("ingest");

    let tasks: Vec<_> = (0..60)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                let k = if i % 3 == 0 { 0 } else { 2 };
                pipeline.query.query(QueryRequest::new("quick", k)).await.is_ok()
            })
        })
        .collect();
    let mut ok = 0;
    for task in tasks {
        if task.await.expect("join") { ok += 1; }
    }

    let metrics = pipeline.metrics();
    assert_eq!(ok, 40);
    assert_eq!(metrics.value(names::QUERIES_TOTAL, &[("status", "success")]), Some(40.0));
    assert_eq!(metrics.value(names::QUERIES_TOTAL, &[("status", "invalid")]), Some(20.0));
    assert_eq!(metrics.histogram_count(names::QUERY_DURATION_SECONDS, &[]), Some(60));
}

#[tokio::test]
async fn remove_document_drops_its_chunks() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());
    pipeline.ingest.ingest(SourceDocument::new("doc1", "the quick brown fox")).await.expect("ingest");
    pipeline.ingest.ingest(SourceDocument::new("doc2", "lazy dog")).await.expect("ingest");

    let removed = pipeline.ingest.remove_document("doc1").await.expect("remove");
    assert_eq!(removed.version, 3);
    assert_eq!(pipeline.index().len(), 1);
    assert!(matches!(pipeline.ingest.remove_document("doc1").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn ingestion_and_query_events_reach_the_sink() {
    let (pipeline, sink, handle) = pipeline_with(&test_settings(), hashing());
    pipeline.ingest.ingest(SourceDocument::new("doc1", "the quick brown fox")).await.expect("ingest");
    let response = pipeline.query.query(QueryRequest::new("fox", 1)).await.expect("query");
    drop(pipeline);
    handle.closed().await;

    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].event_type, "ingest");
    assert_eq!(records[0].document_id.as_deref(), Some("doc1"));
    assert_eq!(records[0].status, "acknowledged");
    assert_eq!(records[1].event_type, "query");
    assert_eq!(records[1].query_id.as_deref(), Some(response.query_id.as_str()));
    assert_eq!(records[1].extra.get("hits"), Some(&serde_json::json!(1)));
}

#[tokio::test]
async fn metrics_exposition_reflects_ingestion() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());
    pipeline.ingest.ingest(SourceDocument::new("doc1", "the quick brown fox")).await.expect("ingest");
    let text = pipeline.render_metrics();
    assert!(text.contains("rag_ingested_chunks_total{status=\"ok\"} 1\n"));
    assert!(text.contains("rag_ingest_documents_total{status=\"acknowledged\"} 1\n"));
    assert!(text.contains("rag_index_size 1\n"));
    assert!(text.contains("rag_index_version 1\n"));
}

#[tokio::test]
async fn directory_bootstrap_ingests_text_files() {
    let tmp = tempfile::tempdir().expect("tempdir");
    std::fs::write(tmp.path().join("fire.txt"), "how to build a fire").expect("write");
    std::fs::write(tmp.path().join("water.txt"), "how to filter water").expect("write");
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());

    assert!(!pipeline.health().is_ready());
    let receipts = pipeline.ingest.ingest_directory(tmp.path(), None).await.expect("bootstrap");
    pipeline.health().set_ready(true);

    assert_eq!(receipts.len(), 2);
    assert!(receipts.iter().all(|r| r.status == IngestStatus::Acknowledged));
    let report = pipeline.health_report();
    assert!(report.ready);
    assert_eq!((report.index_version, report.index_size), (2, 2));
    assert!(report.last_ingest_at.is_some());
    assert!(report.last_query_at.is_none());
}

#[tokio::test]
async fn index_dim_must_match_embedder() {
    let mut settings = test_settings();
    settings.index.dim = Some(DIM + 1);
    let (telemetry, _handle) = Telemetry::start(&settings.telemetry, Arc::new(MemorySink::new()));
    assert!(matches!(Pipeline::new(&settings, hashing(), telemetry), Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn symbol_only_query_is_a_client_error() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());
    pipeline.ingest.ingest(SourceDocument::new("doc1", "the quick brown fox")).await.expect("ingest");

    let err = pipeline.query.query(QueryRequest::new("???", 3)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)), "got {err:?}");
    assert_eq!(pipeline.metrics().value(names::QUERIES_TOTAL, &[("status", "invalid")]), Some(1.0));
    assert_eq!(pipeline.metrics().value(names::QUERIES_TOTAL, &[("status", "error")]), None);
}

#[tokio::test]
async fn health_stamps_only_successful_operations() {
    let (pipeline, _sink, _handle) = pipeline_with(&test_settings(), hashing());

    let failed = pipeline.ingest.ingest(SourceDocument::new("x", "   ")).await.expect("ingest");
    assert_eq!(failed.status, IngestStatus::Failed);
    assert!(pipeline.query.query(QueryRequest::new("fox", 0)).await.is_err());
    assert!(pipeline.query.query(QueryRequest::new("???", 3)).await.is_err());

    let report = pipeline.health_report();
    assert!(report.last_ingest_at.is_none(), "failed ingestion is not a successful ingest");
    assert!(report.last_query_at.is_none(), "rejected queries are not successful queries");

    pipeline.ingest.ingest(SourceDocument::new("doc1", "the quick brown fox")).await.expect("ingest");
    pipeline.query.query(QueryRequest::new("fox", 1)).await.expect("query");
    let report = pipeline.health_report();
    assert!(report.last_ingest_at.is_some());
    assert!(report.last_query_at.is_some());
}

#[tokio::test]
async fn chunks_rejected_by_the_index_are_not_counted_as_ingested() {
    let mut settings = test_settings();
    settings.chunking = ChunkingConfig { window_tokens: 2, overlap_tokens: 0 };
    let (pipeline, _sink, _handle) = pipeline_with(&settings, Arc::new(SkewEmbedder(HashingEmbedder::new(DIM, 16_384))));

    let receipt = pipeline.ingest.ingest(SourceDocument::new("doc", "alpha beta skew gamma")).await.expect("ingest");
    assert_eq!(receipt.status, IngestStatus::Partial);
    assert_eq!((receipt.chunk_count, receipt.indexed_count), (2, 1));
    assert_eq!(receipt.failures[0].chunk_id, "doc-1");

    let metrics = pipeline.metrics();
    assert_eq!(metrics.value(names::INGESTED_CHUNKS_TOTAL, &[("status", "ok")]), Some(1.0));
    assert_eq!(metrics.value(names::INGESTED_CHUNKS_TOTAL, &[("status", "failed")]), Some(1.0));
}
