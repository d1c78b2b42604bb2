use crate::error::Result;

/// Text → fixed-dimension vector.
///
/// Implementations must be deterministic for identical input and must not retry
/// internally. Text the encoder cannot accept fails with
/// [`crate::error::Error::InputRejected`]; backend failures surface as
/// [`crate::error::Error::Encoding`] and callers decide whether to try again.
pub trait Embedder: Send + Sync {
    /// Stable identifier for the model and its dimension (e.g. `hashing:d384`).
    fn embedder_id(&self) -> &str;
    fn dim(&self) -> usize;
    /// Largest accepted input, in characters.
    fn max_len(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}
