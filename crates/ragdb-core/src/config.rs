//! Configuration loader and path helpers.
//!
//! Uses Figment to merge built-in defaults + `config.toml` + `config.<env>.toml`
//! + `APP_*` env vars (`__` separates nested keys, e.g. `APP_QUERY__MAX_K=50`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::chunking::ChunkingConfig;
use crate::error::{Error, Result};
use crate::types::Metric;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    /// Merge `base` + `config.<env>.toml` next to it + `APP_*` env vars over built-in defaults.
    pub fn load_from(base: &Path) -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let dir = base.parent().unwrap_or_else(|| Path::new(""));

        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file(base));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.validate_for_env(&env_name)?;
        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> Self { Self { figment } }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    pub fn settings(&self) -> anyhow::Result<Settings> {
        let settings: Settings = self.figment.extract().map_err(|e| anyhow::anyhow!("Failed to extract settings: {}", e))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate_for_env(&self, env: &str) -> anyhow::Result<()> {
        if matches!(env, "prod" | "production") {
            let kind: Option<String> = self.get("embedder.kind").ok();
            if kind.as_deref() == Some("hashing") {
                tracing::warn!("production environment is using the hashing embedder");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub index: IndexSettings,
    pub chunking: ChunkingConfig,
    pub query: QuerySettings,
    pub embedder: EmbedderSettings,
    pub ingest: IngestSettings,
    pub telemetry: TelemetrySettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.embedder.dim == 0 {
            return Err(Error::InvalidConfig("embedder.dim must be > 0".into()));
        }
        if self.index.dim == Some(0) {
            return Err(Error::InvalidConfig("index.dim must be > 0".into()));
        }
        if self.query.max_k == 0 || self.query.default_k == 0 || self.query.default_k > self.query.max_k {
            return Err(Error::InvalidConfig(format!(
                "query.default_k ({}) must be in 1..=query.max_k ({})",
                self.query.default_k, self.query.max_k
            )));
        }
        if self.query.overfetch_factor < 1 {
            return Err(Error::InvalidConfig("query.overfetch_factor must be >= 1".into()));
        }
        if self.ingest.max_inflight == 0 {
            return Err(Error::InvalidConfig("ingest.max_inflight must be > 0".into()));
        }
        if self.telemetry.log_queue_capacity == 0 || self.telemetry.log_batch_size == 0 {
            return Err(Error::InvalidConfig("telemetry queue capacity and batch size must be > 0".into()));
        }
        let buckets = &self.telemetry.latency_buckets;
        if buckets.is_empty() || buckets.windows(2).any(|w| w[0] >= w[1]) || buckets.iter().any(|b| !b.is_finite()) {
            return Err(Error::InvalidConfig("telemetry.latency_buckets must be finite and strictly increasing".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self { Self { bind: "0.0.0.0:8011".to_string() } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Fixed vector dimension; defaults to the embedder's dimension.
    pub dim: Option<usize>,
    pub metric: Metric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub default_k: usize,
    pub max_k: usize,
    /// `k' = k * overfetch_factor` when a metadata filter is present.
    pub overfetch_factor: usize,
    pub max_overfetch_rounds: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self { default_k: 3, max_k: 100, overfetch_factor: 4, max_overfetch_rounds: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    #[default]
    Hashing,
    Bge,
}

/// Where the model encoder runs. `auto` prefers Metal when built with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedDevice {
    #[default]
    Auto,
    Cpu,
    Metal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    pub kind: EmbedderKind,
    /// Output dimension of the hashing embedder.
    pub dim: usize,
    pub max_input_chars: usize,
    pub timeout_ms: u64,
    /// Entries kept by the content-hash embedding cache (0 disables it).
    pub cache_capacity: usize,
    pub model_dir: Option<String>,
    pub device: EmbedDevice,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            kind: EmbedderKind::Hashing,
            dim: 384,
            max_input_chars: 16_384,
            timeout_ms: 5_000,
            cache_capacity: 4_096,
            model_dir: None,
            device: EmbedDevice::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub max_inflight: usize,
    /// Directory of `.txt` files ingested at startup.
    pub docs_dir: Option<String>,
}

impl Default for IngestSettings {
    fn default() -> Self { Self { max_inflight: 64, docs_dir: None } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Base URL of the log store (e.g. `http://localhost:9200`). Unset: events go to tracing.
    pub log_store_url: Option<String>,
    pub log_index_prefix: String,
    pub log_queue_capacity: usize,
    pub log_batch_size: usize,
    pub log_flush_ms: u64,
    /// Histogram upper bounds in seconds.
    pub latency_buckets: Vec<f64>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_store_url: None,
            log_index_prefix: "rag-events".to_string(),
            log_queue_capacity: 4_096,
            log_batch_size: 256,
            log_flush_ms: 1_000,
            latency_buckets: vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        }
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
