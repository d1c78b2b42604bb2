use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use ragdb_core::error::{Error, Result};
use ragdb_core::types::{ChunkFailure, ChunkId, MetadataFilter, Metric, QueryResult, VectorRecord};

use crate::snapshot::IndexSnapshot;

/// Outcome of an `add`/`replace_source` call.
#[derive(Debug, Clone, PartialEq)]
pub struct AddReport {
    /// Version active after the call.
    pub version: u64,
    pub accepted: usize,
    /// Records dropped for having the wrong dimension.
    pub rejected: Vec<ChunkFailure>,
}

/// Owns the active snapshot and serializes every mutation.
///
/// Readers `load` the snapshot pointer and never wait. Writers take `writer`,
/// which also holds the last published version, rebuild the full record set
/// copy-on-write and swap the pointer in one store.
pub struct VectorIndexManager {
    dim: usize,
    metric: Metric,
    active: ArcSwapOption<IndexSnapshot>,
    writer: Mutex<u64>,
}

impl VectorIndexManager {
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self { dim, metric, active: ArcSwapOption::empty(), writer: Mutex::new(0) }
    }

    pub fn dim(&self) -> usize { self.dim }
    pub fn metric(&self) -> Metric { self.metric }

    /// The snapshot active right now. `None` until the first publish.
    pub fn pin(&self) -> Option<Arc<IndexSnapshot>> {
        self.active.load_full()
    }

    /// Like [`pin`](Self::pin), failing with `IndexUnavailable` before the first publish.
    pub fn snapshot(&self) -> Result<Arc<IndexSnapshot>> {
        self.pin().ok_or(Error::IndexUnavailable)
    }

    pub fn current_version(&self) -> u64 {
        self.active.load().as_ref().map_or(0, |s| s.version())
    }

    pub fn len(&self) -> usize {
        self.active.load().as_ref().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Upsert `records` by chunk id; within a batch the last record for an id wins.
    pub fn add(&self, records: Vec<VectorRecord>) -> Result<AddReport> {
        if records.is_empty() {
            return Ok(AddReport { version: self.current_version(), accepted: 0, rejected: Vec::new() });
        }
        let (accepted, rejected) = self.check_dims(records)?;
        let count = accepted.len();
        let version = self.publish_with(|map| {
            for record in accepted {
                map.insert(record.chunk_id.clone(), Arc::new(record));
            }
            true
        })?;
        Ok(AddReport { version, accepted: count, rejected })
    }

    /// Drop `chunk_ids`. Unknown ids are ignored; nothing is published when none match.
    pub fn remove(&self, chunk_ids: &[ChunkId]) -> Result<u64> {
        self.publish_with(|map| {
            let before = map.len();
            for id in chunk_ids { map.remove(id); }
            map.len() != before
        })
    }

    /// Replace every chunk of `source_id` with `records` in a single snapshot.
    pub fn replace_source(&self, source_id: &str, records: Vec<VectorRecord>) -> Result<AddReport> {
        let (accepted, rejected) = if records.is_empty() { (Vec::new(), Vec::new()) } else { self.check_dims(records)? };
        let count = accepted.len();
        let version = self.publish_with(|map| {
            let before = map.len();
            map.retain(|_, r| r.metadata.source_id != source_id);
            let removed = map.len() != before;
            for record in accepted {
                map.insert(record.chunk_id.clone(), Arc::new(record));
            }
            removed || count > 0
        })?;
        Ok(AddReport { version, accepted: count, rejected })
    }

    pub fn remove_source(&self, source_id: &str) -> Result<u64> {
        self.publish_with(|map| {
            let before = map.len();
            map.retain(|_, r| r.metadata.source_id != source_id);
            map.len() != before
        })
    }

    /// Search the snapshot active at entry. An unpublished index yields an empty result.
    pub fn search(&self, query: &[f32], k: usize, filter: Option<&MetadataFilter>) -> Result<QueryResult> {
        match self.snapshot() {
            Ok(snapshot) => snapshot.search(query, k, filter),
            Err(Error::IndexUnavailable) if query.len() != self.dim => Err(Error::InvalidQuery(format!(
                "query has {} dimensions, index has {}",
                query.len(),
                self.dim
            ))),
            Err(Error::IndexUnavailable) => Ok(QueryResult::empty(0)),
            Err(e) => Err(e),
        }
    }

    fn check_dims(&self, records: Vec<VectorRecord>) -> Result<(Vec<VectorRecord>, Vec<ChunkFailure>)> {
        let mut accepted = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        let mut first_err = None;
        for record in records {
            if record.vector.len() == self.dim {
                accepted.push(record);
                continue;
            }
            let err = Error::DimensionMismatch { chunk_id: record.chunk_id.clone(), expected: self.dim, actual: record.vector.len() };
            tracing::warn!(chunk_id = %record.chunk_id, expected = self.dim, actual = record.vector.len(), "rejecting record");
            rejected.push(ChunkFailure { chunk_id: record.chunk_id, reason: err.to_string() });
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) if accepted.is_empty() => Err(err),
            _ => Ok((accepted, rejected)),
        }
    }

    /// Apply `mutator` to a copy of the active record set and publish the
    /// result as the next version. `mutator` returns whether anything changed;
    /// when it did not, the current version is returned and nothing is built.
    fn publish_with<F>(&self, mutator: F) -> Result<u64>
    where
        F: FnOnce(&mut BTreeMap<ChunkId, Arc<VectorRecord>>) -> bool,
    {
        let mut version = self.writer.lock();
        let start = Instant::now();
        let current = self.active.load_full();
        let next_version = *version + 1;
        let (dim, metric) = (self.dim, self.metric);

        let built = catch_unwind(AssertUnwindSafe(|| {
            let mut map = current.as_deref().map(IndexSnapshot::record_map).unwrap_or_default();
            if !mutator(&mut map) {
                return Ok(None);
            }
            IndexSnapshot::build(next_version, dim, metric, map).map(Some)
        }))
        .map_err(|payload| Error::SnapshotBuild(panic_message(payload.as_ref())))?;

        match built {
            Ok(Some(snapshot)) => {
                let size = snapshot.len();
                self.active.store(Some(Arc::new(snapshot)));
                *version = next_version;
                tracing::debug!(version = next_version, size, elapsed_ms = start.elapsed().as_millis() as u64, "published snapshot");
                Ok(next_version)
            }
            Ok(None) => Ok(*version),
            Err(e) => {
                tracing::error!(version = next_version, error = %e, "snapshot build failed; keeping previous snapshot");
                Err(e)
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic while building snapshot".to_string()
    }
}
