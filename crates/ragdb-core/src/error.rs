use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// The encoder refused the text itself; retrying the same input cannot succeed.
    #[error("Input rejected: {0}")]
    InputRejected(String),

    #[error("Dimension mismatch for chunk '{chunk_id}': expected {expected}, got {actual}")]
    DimensionMismatch { chunk_id: String, expected: usize, actual: usize },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Index unavailable: no snapshot has been published yet")]
    IndexUnavailable,

    #[error("Partial ingestion of '{document_id}': {failed} of {total} chunks failed")]
    PartialIngestion { document_id: String, failed: usize, total: usize },

    #[error("Snapshot build failed: {0}")]
    SnapshotBuild(String),

    #[error("Too many in-flight ingestions (limit {0})")]
    Backpressure(usize),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure was caused by the caller's input rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidQuery(_) | Error::InputRejected(_) | Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
