use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

use ragdb_index::VectorIndexManager;

/// Liveness/readiness bookkeeping shared by the coordinators.
pub struct HealthState {
    started: Instant,
    ready: AtomicBool,
    /// Unix milliseconds, 0 when never.
    last_ingest_ms: AtomicI64,
    last_query_ms: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub ready: bool,
    pub index_version: u64,
    pub index_size: usize,
    pub last_ingest_at: Option<DateTime<Utc>>,
    pub last_query_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

impl Default for HealthState {
    fn default() -> Self { Self::new() }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ready: AtomicBool::new(false),
            last_ingest_ms: AtomicI64::new(0),
            last_query_ms: AtomicI64::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        tracing::info!(ready, "readiness changed");
    }

    pub fn is_ready(&self) -> bool { self.ready.load(Ordering::SeqCst) }

    pub(crate) fn record_ingest(&self) {
        self.last_ingest_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self) {
        self.last_query_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn report(&self, index: &VectorIndexManager) -> HealthReport {
        let ready = self.is_ready();
        HealthReport {
            status: if ready { "ok" } else { "starting" },
            ready,
            index_version: index.current_version(),
            index_size: index.len(),
            last_ingest_at: to_datetime(self.last_ingest_ms.load(Ordering::Relaxed)),
            last_query_at: to_datetime(self.last_query_ms.load(Ordering::Relaxed)),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

fn to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 { return None; }
    Utc.timestamp_millis_opt(ms).single()
}
