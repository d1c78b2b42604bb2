//! In-process metric aggregation with Prometheus text exposition.
//!
//! Counters and gauges update a single atomic. A histogram series keeps its
//! buckets and sum behind one short mutex so a scrape never sees an
//! observation in `_count` that is missing from `_sum`. The family map is
//! read-locked on the update path and write-locked only the first time a
//! (name, label set) pair is seen.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metric names emitted by the pipeline.
pub mod names {
    pub const INGESTED_CHUNKS_TOTAL: &str = "rag_ingested_chunks_total";
    pub const INGEST_CHUNK_SECONDS: &str = "rag_ingest_chunk_seconds";
    pub const INGEST_DOCUMENTS_TOTAL: &str = "rag_ingest_documents_total";
    pub const INGEST_DURATION_SECONDS: &str = "rag_ingest_duration_seconds";
    pub const INDEX_SIZE: &str = "rag_index_size";
    pub const INDEX_VERSION: &str = "rag_index_version";
    pub const LAST_INDEX_UNIX: &str = "rag_last_index_unix";
    pub const QUERIES_TOTAL: &str = "rag_queries_total";
    pub const QUERY_DURATION_SECONDS: &str = "rag_query_duration_seconds";
    pub const RETRIEVAL_TIME_SECONDS: &str = "rag_retrieval_time_seconds";
    pub const QUERY_HITS: &str = "rag_query_hits";
    pub const LOG_EVENTS_DROPPED_TOTAL: &str = "rag_log_events_dropped_total";
}

const HIT_BUCKETS: &[f64] = &[0.0, 1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// A single observation, folded into the aggregates by [`MetricsRegistry::record`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Vec<(String, String)>,
}

impl MetricEvent {
    pub fn counter(name: &str, labels: &[(&str, &str)], value: f64) -> Self {
        Self::new(name, MetricKind::Counter, labels, value)
    }

    pub fn gauge(name: &str, labels: &[(&str, &str)], value: f64) -> Self {
        Self::new(name, MetricKind::Gauge, labels, value)
    }

    pub fn histogram(name: &str, labels: &[(&str, &str)], value: f64) -> Self {
        Self::new(name, MetricKind::Histogram, labels, value)
    }

    fn new(name: &str, kind: MetricKind, labels: &[(&str, &str)], value: f64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            value,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }
}

type LabelSet = Vec<(String, String)>;

/// `f64` stored as bits, updated with a CAS loop.
#[derive(Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 { f64::from_bits(self.0.load(Ordering::Relaxed)) }

    fn store(&self, v: f64) { self.0.store(v.to_bits(), Ordering::Relaxed) }

    fn add(&self, v: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + v).to_bits();
            match self.0.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

struct Histogram {
    bounds: Arc<[f64]>,
    state: Mutex<HistogramState>,
}

struct HistogramState {
    /// One slot per bound plus a final `+Inf` overflow slot; non-cumulative.
    counts: Vec<u64>,
    sum: f64,
}

/// Consistent read of one histogram series.
struct HistogramSnapshot {
    /// Cumulative counts; the last entry is the `+Inf` bucket and the total count.
    cumulative: Vec<u64>,
    sum: f64,
}

impl HistogramSnapshot {
    fn count(&self) -> u64 { self.cumulative.last().copied().unwrap_or(0) }
}

impl Histogram {
    fn new(bounds: Arc<[f64]>) -> Self {
        let counts = vec![0; bounds.len() + 1];
        Self { bounds, state: Mutex::new(HistogramState { counts, sum: 0.0 }) }
    }

    fn observe(&self, v: f64) {
        let slot = self.bounds.iter().position(|b| v <= *b).unwrap_or(self.bounds.len());
        let mut state = self.state.lock();
        state.counts[slot] += 1;
        state.sum += v;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let state = self.state.lock();
        let mut acc = 0u64;
        let cumulative = state
            .counts
            .iter()
            .map(|c| {
                acc += c;
                acc
            })
            .collect();
        HistogramSnapshot { cumulative, sum: state.sum }
    }
}

enum Series {
    Counter(AtomicF64),
    Gauge(AtomicF64),
    Histogram(Histogram),
}

struct Family {
    kind: MetricKind,
    help: String,
    buckets: Arc<[f64]>,
    series: BTreeMap<LabelSet, Arc<Series>>,
}

impl Family {
    fn new_series(&self) -> Series {
        match self.kind {
            MetricKind::Counter => Series::Counter(AtomicF64::default()),
            MetricKind::Gauge => Series::Gauge(AtomicF64::default()),
            MetricKind::Histogram => Series::Histogram(Histogram::new(Arc::clone(&self.buckets))),
        }
    }
}

/// Process-wide metric store. Values are never reset.
pub struct MetricsRegistry {
    default_buckets: Arc<[f64]>,
    families: RwLock<BTreeMap<String, Family>>,
}

impl MetricsRegistry {
    pub fn new(latency_buckets: &[f64]) -> Self {
        Self { default_buckets: Arc::from(latency_buckets), families: RwLock::new(BTreeMap::new()) }
    }

    /// Registry with every pipeline metric described up front.
    pub fn with_rag_metrics(latency_buckets: &[f64]) -> Self {
        use names::*;
        let registry = Self::new(latency_buckets);
        registry.describe(INGESTED_CHUNKS_TOTAL, MetricKind::Counter, "Document chunks processed by ingestion, by outcome");
        registry.describe(INGEST_CHUNK_SECONDS, MetricKind::Histogram, "Time to embed one chunk");
        registry.describe(INGEST_DOCUMENTS_TOTAL, MetricKind::Counter, "Ingestion requests, by outcome");
        registry.describe(INGEST_DURATION_SECONDS, MetricKind::Histogram, "End-to-end ingestion latency");
        registry.describe(INDEX_SIZE, MetricKind::Gauge, "Number of vectors in the active snapshot");
        registry.describe(INDEX_VERSION, MetricKind::Gauge, "Version of the active snapshot");
        registry.describe(LAST_INDEX_UNIX, MetricKind::Gauge, "Unix timestamp of the last index update");
        registry.describe(QUERIES_TOTAL, MetricKind::Counter, "Query invocations, by outcome");
        registry.describe(QUERY_DURATION_SECONDS, MetricKind::Histogram, "End-to-end query latency");
        registry.describe(RETRIEVAL_TIME_SECONDS, MetricKind::Histogram, "Time spent searching the index");
        registry.describe_with_buckets(QUERY_HITS, MetricKind::Histogram, "Hits returned per query", HIT_BUCKETS);
        registry.describe(LOG_EVENTS_DROPPED_TOTAL, MetricKind::Counter, "Event records dropped before reaching the log store");
        registry
    }

    pub fn describe(&self, name: &str, kind: MetricKind, help: &str) {
        let buckets = Arc::clone(&self.default_buckets);
        self.insert_family(name, kind, help, buckets);
    }

    pub fn describe_with_buckets(&self, name: &str, kind: MetricKind, help: &str, buckets: &[f64]) {
        self.insert_family(name, kind, help, Arc::from(buckets));
    }

    fn insert_family(&self, name: &str, kind: MetricKind, help: &str, buckets: Arc<[f64]>) {
        self.families.write().entry(name.to_string()).or_insert_with(|| Family {
            kind,
            help: help.to_string(),
            buckets,
            series: BTreeMap::new(),
        });
    }

    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)], by: f64) {
        if by.is_nan() || by < 0.0 {
            tracing::warn!(metric = name, value = by, "ignoring negative counter increment");
            return;
        }
        if let Series::Counter(c) = self.series(name, MetricKind::Counter, labels).as_ref() {
            c.add(by);
        }
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if let Series::Gauge(g) = self.series(name, MetricKind::Gauge, labels).as_ref() {
            g.store(value);
        }
    }

    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if let Series::Histogram(h) = self.series(name, MetricKind::Histogram, labels).as_ref() {
            h.observe(value);
        }
    }

    pub fn record(&self, event: &MetricEvent) {
        let labels: Vec<(&str, &str)> = event.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        match event.kind {
            MetricKind::Counter => self.inc_counter(&event.name, &labels, event.value),
            MetricKind::Gauge => self.set_gauge(&event.name, &labels, event.value),
            MetricKind::Histogram => self.observe(&event.name, &labels, event.value),
        }
    }

    /// Current counter or gauge value of one series.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = label_set(labels);
        let families = self.families.read();
        match families.get(name)?.series.get(&key)?.as_ref() {
            Series::Counter(v) | Series::Gauge(v) => Some(v.load()),
            Series::Histogram(_) => None,
        }
    }

    /// Observation count of one histogram series.
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        let key = label_set(labels);
        let families = self.families.read();
        match families.get(name)?.series.get(&key)?.as_ref() {
            Series::Histogram(h) => Some(h.snapshot().count()),
            _ => None,
        }
    }

    /// Look up a series, creating it (and its family) on first use. A name
    /// registered with a different kind keeps its original kind; the caller's
    /// update is then dropped by the kind check at the call site.
    fn series(&self, name: &str, kind: MetricKind, labels: &[(&str, &str)]) -> Arc<Series> {
        let key = label_set(labels);
        {
            let families = self.families.read();
            if let Some(series) = families.get(name).and_then(|f| f.series.get(&key)) {
                return Arc::clone(series);
            }
        }
        let mut families = self.families.write();
        let family = families.entry(name.to_string()).or_insert_with(|| Family {
            kind,
            help: String::new(),
            buckets: Arc::clone(&self.default_buckets),
            series: BTreeMap::new(),
        });
        if family.kind != kind {
            tracing::warn!(metric = name, registered = family.kind.as_str(), requested = kind.as_str(), "metric kind mismatch");
        }
        let fresh = family.new_series();
        Arc::clone(family.series.entry(key).or_insert_with(|| Arc::new(fresh)))
    }

    /// Prometheus text exposition (format 0.0.4). Families and series are
    /// emitted in lexical order; families with no series are skipped.
    pub fn render(&self) -> String {
        let families = self.families.read();
        let mut out = String::new();
        for (name, family) in families.iter() {
            if family.series.is_empty() { continue; }
            if !family.help.is_empty() {
                let _ = writeln!(out, "# HELP {} {}", name, family.help);
            }
            let _ = writeln!(out, "# TYPE {} {}", name, family.kind.as_str());
            for (labels, series) in &family.series {
                match series.as_ref() {
                    Series::Counter(v) | Series::Gauge(v) => {
                        let _ = writeln!(out, "{}{} {}", name, format_labels(labels, None), format_value(v.load()));
                    }
                    Series::Histogram(h) => {
                        let snapshot = h.snapshot();
                        for (bound, count) in h.bounds.iter().zip(&snapshot.cumulative) {
                            let le = format_value(*bound);
                            let _ = writeln!(out, "{}_bucket{} {}", name, format_labels(labels, Some(&le)), count);
                        }
                        let total = snapshot.count();
                        let _ = writeln!(out, "{}_bucket{} {}", name, format_labels(labels, Some("+Inf")), total);
                        let _ = writeln!(out, "{}_sum{} {}", name, format_labels(labels, None), format_value(snapshot.sum));
                        let _ = writeln!(out, "{}_count{} {}", name, format_labels(labels, None), total);
                    }
                }
            }
        }
        out
    }
}

fn label_set(labels: &[(&str, &str)]) -> LabelSet {
    let mut set: LabelSet = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    set.sort();
    set
}

fn format_labels(labels: &LabelSet, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels.iter().map(|(k, v)| format!("{}=\"{}\"", k, escape(v))).collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{le}\""));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "+Inf".to_string() } else { "-Inf".to_string() }
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(Arc::from(&[1.0, 2.0][..]));
        for v in [0.5, 1.0, 1.5, 9.0] { h.observe(v); }
        let snapshot = h.snapshot();
        assert_eq!(snapshot.cumulative, vec![2, 3, 4]);
        assert_eq!(snapshot.sum, 12.0);
    }

    #[test]
    fn histogram_reads_never_split_an_observation() {
        let h = Histogram::new(Arc::from(&[0.5, 2.0][..]));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..5_000 { h.observe(1.0); }
                });
            }
            scope.spawn(|| {
                for _ in 0..2_000 {
                    let snapshot = h.snapshot();
                    assert_eq!(snapshot.sum, snapshot.count() as f64, "sum and count come from one read");
                }
            });
        });
        assert_eq!(h.snapshot().count(), 20_000);
    }

    #[test]
    fn label_values_are_escaped() {
        let labels = label_set(&[("path", "a\"b\\c")]);
        assert_eq!(format_labels(&labels, None), r#"{path="a\"b\\c"}"#);
    }
}
