use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use ragdb_core::error::{Error, Result};
use ragdb_core::types::{ChunkId, MetadataFilter, Metric, QueryResult, SearchHit, VectorRecord};

use crate::metric;

/// Immutable, versioned searchable state.
///
/// Records are kept sorted by chunk id, so a row index doubles as the
/// tie-break key. `rows` is a flat `len * dim` matrix of prepared vectors.
pub struct IndexSnapshot {
    version: u64,
    dim: usize,
    metric: Metric,
    records: Vec<Arc<VectorRecord>>,
    rows: Vec<f32>,
}

impl IndexSnapshot {
    /// Build a snapshot from a chunk-id keyed record set. Every record must
    /// already have `dim` components.
    pub fn build(version: u64, dim: usize, metric: Metric, records: BTreeMap<ChunkId, Arc<VectorRecord>>) -> Result<Self> {
        let n = records.len();
        let mut rows: Vec<f32> = Vec::new();
        rows.try_reserve_exact(n.saturating_mul(dim))
            .map_err(|e| Error::SnapshotBuild(format!("cannot allocate {n} x {dim} rows: {e}")))?;
        let mut sorted: Vec<Arc<VectorRecord>> = Vec::new();
        sorted.try_reserve_exact(n).map_err(|e| Error::SnapshotBuild(e.to_string()))?;

        for (chunk_id, record) in records {
            if record.vector.len() != dim {
                return Err(Error::DimensionMismatch { chunk_id, expected: dim, actual: record.vector.len() });
            }
            rows.extend(metric::prepare(metric, &record.vector));
            sorted.push(record);
        }
        Ok(Self { version, dim, metric, records: sorted, rows })
    }

    pub fn version(&self) -> u64 { self.version }
    pub fn dim(&self) -> usize { self.dim }
    pub fn metric(&self) -> Metric { self.metric }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    pub fn get(&self, chunk_id: &str) -> Option<&VectorRecord> {
        self.records
            .binary_search_by(|r| r.chunk_id.as_str().cmp(chunk_id))
            .ok()
            .map(|i| self.records[i].as_ref())
    }

    pub fn contains(&self, chunk_id: &str) -> bool { self.get(chunk_id).is_some() }

    pub fn records(&self) -> impl Iterator<Item = &Arc<VectorRecord>> { self.records.iter() }

    /// Copy-on-write starting point for the next build.
    pub(crate) fn record_map(&self) -> BTreeMap<ChunkId, Arc<VectorRecord>> {
        self.records.iter().map(|r| (r.chunk_id.clone(), Arc::clone(r))).collect()
    }

    fn row(&self, i: usize) -> &[f32] { &self.rows[i * self.dim..(i + 1) * self.dim] }

    /// Top-`k` rows by score, then `filter` applied to those candidates.
    ///
    /// At most `k` hits come back; fewer when the filter rejects candidates.
    /// Callers that need `k` filtered hits over-fetch.
    pub fn search(&self, query: &[f32], k: usize, filter: Option<&MetadataFilter>) -> Result<QueryResult> {
        if query.len() != self.dim {
            return Err(Error::InvalidQuery(format!("query has {} dimensions, index has {}", query.len(), self.dim)));
        }
        if k == 0 || self.is_empty() {
            return Ok(QueryResult::empty(self.version));
        }
        let q = metric::prepare(self.metric, query);

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k.min(self.len()) + 1);
        for idx in 0..self.len() {
            let candidate = Candidate { score: metric::score(self.metric, &q, self.row(idx)), idx };
            if heap.len() < k {
                heap.push(candidate);
            } else if let Some(worst) = heap.peek() {
                if candidate < *worst {
                    heap.pop();
                    heap.push(candidate);
                }
            }
        }

        // Ascending `Candidate` order is best-first.
        let hits = heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| (&self.records[c.idx], c.score))
            .filter(|(record, _)| filter.map_or(true, |f| f.matches(&record.metadata)))
            .map(|(record, score)| SearchHit { chunk_id: record.chunk_id.clone(), score, metadata: record.metadata.clone() })
            .collect();
        Ok(QueryResult { version: self.version, hits })
    }
}

/// Heap entry. `Ord` ranks better candidates lower, so the max-heap top is
/// the current worst: lowest score, then highest chunk id.
#[derive(Clone, Copy)]
struct Candidate {
    score: f32,
    idx: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other.score.total_cmp(&self.score).then_with(|| self.idx.cmp(&other.idx))
    }
}
