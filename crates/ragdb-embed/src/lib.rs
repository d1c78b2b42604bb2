use anyhow::Result;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

use ragdb_core::config::{EmbedderKind, EmbedderSettings};
use ragdb_core::error::Error;
use ragdb_core::traits::Embedder;

pub mod cache;
#[cfg(feature = "bge")]
pub mod bge;
#[cfg(feature = "bge")]
pub mod device;
#[cfg(feature = "bge")]
pub mod pool;
#[cfg(feature = "bge")]
mod tokenize;

pub use cache::CachedEmbedder;
#[cfg(feature = "bge")]
pub use bge::BgeM3Embedder;
#[cfg(feature = "bge")]
pub use device::select_device;
#[cfg(feature = "bge")]
pub use pool::masked_mean_l2;

/// Feature-hashing bag-of-words encoder.
///
/// Tokens are lower-cased alphanumeric runs, each hashed with xxHash64 into one of
/// `dim` buckets; the term-frequency vector is L2-normalized. Fully deterministic,
/// no model files, so it backs tests and development setups.
pub struct HashingEmbedder {
    dim: usize,
    max_input_chars: usize,
    id: String,
}

impl HashingEmbedder {
    pub fn new(dim: usize, max_input_chars: usize) -> Self {
        Self { dim, max_input_chars, id: format!("hashing:d{dim}") }
    }
}

impl Embedder for HashingEmbedder {
    fn embedder_id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { self.dim }
    fn max_len(&self) -> usize { self.max_input_chars }

    fn embed(&self, text: &str) -> ragdb_core::error::Result<Vec<f32>> {
        check_input(text, self.max_input_chars)?;
        let mut v = vec![0f32; self.dim];
        let mut tokens = 0usize;
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let mut hasher = XxHash64::with_seed(0);
            hasher.write(token.to_lowercase().as_bytes());
            let idx = (hasher.finish() % self.dim as u64) as usize;
            v[idx] += 1.0;
            tokens += 1;
        }
        if tokens == 0 {
            return Err(Error::InputRejected("input contains no alphanumeric tokens".into()));
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        for x in &mut v { *x /= norm; }
        Ok(v)
    }
}

/// Shared input contract: non-blank and at most `max_chars` characters.
pub(crate) fn check_input(text: &str, max_chars: usize) -> ragdb_core::error::Result<()> {
    if text.trim().is_empty() {
        return Err(Error::InputRejected("empty input".into()));
    }
    let chars = text.chars().count();
    if chars > max_chars {
        return Err(Error::InputRejected(format!("input of {chars} chars exceeds the {max_chars} char limit")));
    }
    Ok(())
}

/// Build the configured encoder, wrapped in the content-hash cache when enabled.
///
/// `APP_USE_FAKE_EMBEDDINGS=1` forces the hashing encoder regardless of `kind`.
pub fn build_embedder(settings: &EmbedderSettings) -> Result<Arc<dyn Embedder>> {
    let use_fake = std::env::var("APP_USE_FAKE_EMBEDDINGS").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    let kind = if use_fake { EmbedderKind::Hashing } else { settings.kind };
    let inner: Arc<dyn Embedder> = match kind {
        EmbedderKind::Hashing => {
            tracing::info!(dim = settings.dim, "using hashing embedder");
            Arc::new(HashingEmbedder::new(settings.dim, settings.max_input_chars))
        }
        EmbedderKind::Bge => load_bge(settings)?,
    };
    if settings.cache_capacity == 0 { return Ok(inner); }
    Ok(Arc::new(CachedEmbedder::new(inner, settings.cache_capacity)))
}

#[cfg(feature = "bge")]
fn load_bge(settings: &EmbedderSettings) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(BgeM3Embedder::new(settings)?))
}

#[cfg(not(feature = "bge"))]
fn load_bge(_settings: &EmbedderSettings) -> Result<Arc<dyn Embedder>> {
    Err(anyhow::anyhow!("embedder.kind = \"bge\" requires building ragdb-embed with the `bge` feature"))
}
