use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use ragdb_core::config::QuerySettings;
use ragdb_core::error::{Error, Result};
use ragdb_core::traits::Embedder;
use ragdb_core::types::{MetadataFilter, QueryRequest, QueryResult, SearchHit};
use ragdb_index::{IndexSnapshot, VectorIndexManager};
use ragdb_telemetry::metrics::names;
use ragdb_telemetry::{EventRecord, Telemetry};

use crate::embed_with_timeout;
use crate::health::HealthState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub query_id: String,
    pub version: u64,
    #[serde(rename = "results")]
    pub hits: Vec<SearchHit>,
}

pub struct QueryCoordinator {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndexManager>,
    telemetry: Telemetry,
    health: Arc<HealthState>,
    settings: QuerySettings,
    embed_timeout: Duration,
}

impl QueryCoordinator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndexManager>,
        telemetry: Telemetry,
        health: Arc<HealthState>,
        settings: QuerySettings,
        embed_timeout: Duration,
    ) -> Self {
        Self { embedder, index, telemetry, health, settings, embed_timeout }
    }

    pub fn settings(&self) -> &QuerySettings { &self.settings }

    /// Validate, embed, search one pinned snapshot. Every call that returns is
    /// counted once in `rag_queries_total` under `success`, `invalid` or `error`.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let query_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("query", query_id = %query_id, k = request.k);
        let start = Instant::now();
        let outcome = self.run(&request).instrument(span).await;
        let elapsed = start.elapsed();

        let metrics = &self.telemetry.metrics;
        let status = match &outcome {
            Ok(_) => "success",
            Err(Error::InvalidQuery(_)) => "invalid",
            Err(_) => "error",
        };
        metrics.inc_counter(names::QUERIES_TOTAL, &[("status", status)], 1.0);
        metrics.observe(names::QUERY_DURATION_SECONDS, &[], elapsed.as_secs_f64());

        let mut event = EventRecord::query(&query_id, status, elapsed).with("k", request.k);
        match &outcome {
            Ok(result) => {
                self.health.record_query();
                metrics.observe(names::QUERY_HITS, &[], result.len() as f64);
                event = event.with("hits", result.len()).with("version", result.version);
                tracing::info!(query_id = %query_id, hits = result.len(), version = result.version, elapsed_ms = elapsed.as_millis() as u64, "query served");
            }
            Err(e) => {
                event = event.with("error", e.to_string());
                tracing::warn!(query_id = %query_id, error = %e, "query failed");
            }
        }
        self.telemetry.events.emit(event);

        outcome.map(|result| QueryResponse { query_id, version: result.version, hits: result.hits })
    }

    async fn run(&self, request: &QueryRequest) -> Result<QueryResult> {
        self.validate(request)?;
        let vector = embed_with_timeout(Arc::clone(&self.embedder), request.text.clone(), self.embed_timeout)
            .await
            .map_err(|e| match e {
                Error::InputRejected(reason) => Error::InvalidQuery(reason),
                other => other,
            })?;

        // Every over-fetch round reads this one snapshot.
        let snapshot = match self.index.snapshot() {
            Ok(snapshot) => snapshot,
            Err(Error::IndexUnavailable) => return Ok(QueryResult::empty(0)),
            Err(e) => return Err(e),
        };
        let started = Instant::now();
        let filter = request.filters.as_ref().filter(|f| !f.is_empty());
        let result = self.search(&snapshot, &vector, request.k, filter);
        self.telemetry.metrics.observe(names::RETRIEVAL_TIME_SECONDS, &[], started.elapsed().as_secs_f64());
        result
    }

    fn validate(&self, request: &QueryRequest) -> Result<()> {
        if request.k == 0 {
            return Err(Error::InvalidQuery("k must be greater than 0".into()));
        }
        if request.k > self.settings.max_k {
            return Err(Error::InvalidQuery(format!("k = {} exceeds the maximum of {}", request.k, self.settings.max_k)));
        }
        if request.text.trim().is_empty() {
            return Err(Error::InvalidQuery("query text must not be empty".into()));
        }
        let max_len = self.embedder.max_len();
        if request.text.chars().count() > max_len {
            return Err(Error::InvalidQuery(format!("query text exceeds {max_len} characters")));
        }
        Ok(())
    }

    /// Top-`k` with an optional post-filter. With a filter the candidate count
    /// starts at `k * overfetch_factor` and doubles while fewer than `k` hits
    /// survive, for at most `max_overfetch_rounds` extra rounds.
    fn search(&self, snapshot: &IndexSnapshot, vector: &[f32], k: usize, filter: Option<&MetadataFilter>) -> Result<QueryResult> {
        let Some(filter) = filter else {
            return snapshot.search(vector, k, None);
        };
        let total = snapshot.len();
        let mut fetch = k.saturating_mul(self.settings.overfetch_factor.max(1)).min(total.max(1));
        let mut round = 0usize;
        loop {
            let mut result = snapshot.search(vector, fetch, Some(filter))?;
            let exhausted = fetch >= total || round >= self.settings.max_overfetch_rounds;
            if result.len() >= k || exhausted {
                tracing::debug!(fetch, round, hits = result.len(), "filtered search finished");
                result.hits.truncate(k);
                return Ok(result);
            }
            fetch = fetch.saturating_mul(2).min(total);
            round += 1;
        }
    }
}
