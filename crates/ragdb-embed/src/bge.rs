use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::xlm_roberta::{Config as XLMRobertaConfig, XLMRobertaModel};
use tokenizers::Tokenizer;

use ragdb_core::config::{expand_path, EmbedderSettings};
use ragdb_core::error::Error;
use ragdb_core::traits::Embedder;

use crate::device::select_device;
use crate::pool::masked_mean_l2;
use crate::tokenize::{encoding, tokenize_on_device};

const BGE_M3_DIM: usize = 1024;
const MAX_TOKENS: usize = 256;

/// Local BGE-M3 (XLM-RoBERTa) encoder with masked-mean pooling.
pub struct BgeM3Embedder {
    model: XLMRobertaModel,
    tokenizer: Tokenizer,
    device: Device,
    max_input_chars: usize,
    id: String,
}

impl BgeM3Embedder {
    pub fn new(settings: &EmbedderSettings) -> Result<Self> {
        let device = select_device(settings.device)?;
        let model_dir = resolve_model_dir(settings.model_dir.as_deref())?;
        let max_input_chars = settings.max_input_chars;
        tracing::info!(dir = %model_dir.display(), device = ?device, "loading BGE-M3 model");
        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;
        let config_path = model_dir.join("config.json");
        let config: XLMRobertaConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let weights_path = model_dir.join("pytorch_model.bin");
        let weights = candle_core::pickle::read_all(&weights_path)?;
        let weights_map: std::collections::HashMap<String, Tensor> = weights.into_iter().collect();
        let vb = VarBuilder::from_tensors(weights_map, DType::F32, &device);
        let model = XLMRobertaModel::new(&config, vb)?;
        tracing::info!("BGE-M3 model loaded");
        Ok(Self { model, tokenizer, device, max_input_chars, id: format!("bge-m3:d{BGE_M3_DIM}") })
    }

    fn forward(&self, text: &str) -> ragdb_core::error::Result<Vec<f32>> {
        let (input_ids, attention_mask) = tokenize_on_device(&self.tokenizer, text, MAX_TOKENS, &self.device)?;
        let token_type_ids = Tensor::zeros((1, MAX_TOKENS), DType::I64, &self.device).map_err(encoding)?;
        let hidden = self
            .model
            .forward(&input_ids, &attention_mask, &token_type_ids, None, None, None)
            .map_err(encoding)?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        let emb = pooled
            .to_device(&Device::Cpu)
            .and_then(|t| t.squeeze(0))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(encoding)?;
        if emb.len() != BGE_M3_DIM {
            return Err(Error::Encoding(format!("model produced {} dims, expected {}", emb.len(), BGE_M3_DIM)));
        }
        Ok(emb)
    }
}

impl Embedder for BgeM3Embedder {
    fn embedder_id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { BGE_M3_DIM }
    fn max_len(&self) -> usize { self.max_input_chars }

    fn embed(&self, text: &str) -> ragdb_core::error::Result<Vec<f32>> {
        crate::check_input(text, self.max_input_chars)?;
        let start = Instant::now();
        let emb = self.forward(text)?;
        if start.elapsed().as_millis() > 100 {
            tracing::warn!(elapsed_ms = start.elapsed().as_millis() as u64, "slow embedding");
        }
        Ok(emb)
    }
}

fn resolve_model_dir(configured: Option<&str>) -> Result<PathBuf> {
    let candidates = configured
        .map(expand_path)
        .into_iter()
        .chain(std::env::var("APP_MODEL_DIR").ok().map(PathBuf::from))
        .chain(std::env::var("MODEL_DIR").ok().map(PathBuf::from))
        .chain([Path::new("../models/bge-m3").to_path_buf(), Path::new("models/bge-m3").to_path_buf()]);
    for dir in candidates {
        if dir.exists() { return Ok(dir); }
    }
    Err(anyhow!("Could not locate BGE-M3 model directory"))
}
