//! Domain types shared by the index, the coordinators and the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub type ChunkId = String;

/// A typed scalar attached to a chunk through the open `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self { MetaValue::Str(s.to_string()) }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self { MetaValue::Str(s) }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self { MetaValue::Int(v) }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self { MetaValue::Float(v) }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self { MetaValue::Bool(v) }
}

pub type Extra = BTreeMap<String, MetaValue>;

/// Byte range of a chunk inside its source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOffset {
    pub start: usize,
    pub end: usize,
}

/// A document submitted for ingestion.
///
/// `id` is optional; the ingestion coordinator assigns one when absent.
/// Re-submitting a document with the same id replaces its chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: Extra,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: Some(id.into()), text: text.into(), ..Self::default() }
    }
}

/// A chunk of a source document that is independently indexed.
///
/// - `id`: `"{source_id}-{sequence_number}"`
/// - `source_offset`: byte range of `text` inside the source document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: ChunkId,
    pub source_id: String,
    pub text: String,
    pub sequence_number: usize,
    pub source_offset: SourceOffset,
    pub created_at: DateTime<Utc>,
}

impl DocumentChunk {
    pub fn chunk_id(source_id: &str, sequence_number: usize) -> ChunkId {
        format!("{source_id}-{sequence_number}")
    }
}

/// Metadata carried next to every vector: known fields plus one typed extension map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub sequence_number: usize,
    pub source_offset: SourceOffset,
    /// Unix milliseconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Extra,
}

impl ChunkMetadata {
    pub fn for_chunk(chunk: &DocumentChunk, doc: &SourceDocument) -> Self {
        Self {
            source_id: chunk.source_id.clone(),
            title: doc.title.clone(),
            source: doc.source.clone(),
            sequence_number: chunk.sequence_number,
            source_offset: chunk.source_offset,
            created_at: chunk.created_at.timestamp_millis(),
            extra: doc.extra.clone(),
        }
    }
}

/// One embedded chunk as stored by the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: ChunkId,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Predicate over [`ChunkMetadata`]. Every clause that is set must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataFilter {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Inclusive lower bound on `created_at` (unix ms).
    #[serde(default)]
    pub created_after: Option<i64>,
    /// Exclusive upper bound on `created_at` (unix ms).
    #[serde(default)]
    pub created_before: Option<i64>,
    #[serde(default)]
    pub extra: Extra,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.source_id.is_none()
            && self.title.is_none()
            && self.created_after.is_none()
            && self.created_before.is_none()
            && self.extra.is_empty()
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        if let Some(source_id) = &self.source_id {
            if &meta.source_id != source_id { return false; }
        }
        if let Some(title) = &self.title {
            if meta.title.as_ref() != Some(title) { return false; }
        }
        if let Some(after) = self.created_after {
            if meta.created_at < after { return false; }
        }
        if let Some(before) = self.created_before {
            if meta.created_at >= before { return false; }
        }
        self.extra.iter().all(|(key, want)| meta.extra.get(key) == Some(want))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub text: String,
    pub k: usize,
    #[serde(default)]
    pub filters: Option<MetadataFilter>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self { text: text.into(), k, filters: None }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filters = Some(filter);
        self
    }
}

/// A ranked result. `score` is metric-normalized: higher is always better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Ordering used for every result list: descending score, then ascending chunk id.
pub fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Hits drawn from exactly one snapshot `version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub version: u64,
    pub hits: Vec<SearchHit>,
}

impl QueryResult {
    pub fn empty(version: u64) -> Self { Self { version, hits: Vec::new() } }

    pub fn is_empty(&self) -> bool { self.hits.is_empty() }

    pub fn len(&self) -> usize { self.hits.len() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestStatus {
    Acknowledged,
    Partial,
    Failed,
}

impl IngestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestStatus::Acknowledged => "acknowledged",
            IngestStatus::Partial => "partial",
            IngestStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFailure {
    pub chunk_id: ChunkId,
    pub reason: String,
}

/// Outcome of one ingestion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub document_id: String,
    pub chunk_count: usize,
    pub indexed_count: usize,
    pub status: IngestStatus,
    /// Index version after this ingestion (unchanged when nothing was published).
    pub version: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ChunkFailure>,
}

/// Similarity metric of an index instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Dot,
    Euclidean,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
            Metric::Euclidean => "euclidean",
        })
    }
}
