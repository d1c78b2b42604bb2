//! In-memory vector index with atomically published, versioned snapshots.

pub mod manager;
pub mod metric;
pub mod snapshot;

pub use manager::{AddReport, VectorIndexManager};
pub use snapshot::IndexSnapshot;
