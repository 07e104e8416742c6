//! Pure-Rust local embeddings via tract (for musl and Intel Mac builds).
//!
//! The ONNX graph and its `tokenizer.json` are fetched from Hugging Face into
//! `~/.cache/docchat/models` on first use, loaded once, and reused for every
//! later batch. Inference runs on the blocking pool.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tract_onnx::prelude::*;

use super::{normalize_l2, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

const MAX_SEQ_LEN: usize = 256;

type Runnable = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

struct LoadedModel {
    plan: Runnable,
    tokenizer: tokenizers::Tokenizer,
}

/// Hugging Face source for a supported model.
struct ModelSource {
    repo: &'static str,
    onnx: &'static str,
    tokenizer: &'static str,
    dims: usize,
}

fn model_source(model_name: &str) -> Result<ModelSource> {
    match model_name {
        "all-minilm-l6-v2" => Ok(ModelSource {
            repo: "sentence-transformers/all-MiniLM-L6-v2",
            onnx: "onnx/model.onnx",
            tokenizer: "tokenizer.json",
            dims: 384,
        }),
        other => Err(Error::Configuration(format!(
            "tract backend only supports all-minilm-l6-v2, got '{}'",
            other
        ))),
    }
}

pub struct TractProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    loaded: Arc<Mutex<Option<LoadedModel>>>,
}

impl TractProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| super::DEFAULT_LOCAL_MODEL.to_string());
        let source = model_source(&model_name)?;
        Ok(Self {
            model_name,
            dims: source.dims,
            batch_size: config.batch_size,
            loaded: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for TractProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let slot = Arc::clone(&self.loaded);
        let model_name = self.model_name.clone();
        let dims = self.dims;
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| Error::Embedding("tract model lock poisoned".to_string()))?;
            if guard.is_none() {
                *guard = Some(load_model(&model_name)?);
            }
            let model = guard
                .as_ref()
                .ok_or_else(|| Error::Embedding("tract model not loaded".to_string()))?;
            texts
                .chunks(batch_size.max(1))
                .map(|batch| embed_chunk(model, dims, batch))
                .try_fold(Vec::with_capacity(texts.len()), |mut acc, r| {
                    acc.extend(r?);
                    Ok::<_, Error>(acc)
                })
        })
        .await
        .map_err(Error::embedding)?
    }
}

fn cache_dir() -> Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base)
        .join(".cache")
        .join("docchat")
        .join("models");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn fetch(repo: &str, file: &str, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Ok(());
    }
    let url = format!("https://huggingface.co/{}/resolve/main/{}", repo, file);
    tracing::info!(%url, "downloading embedding model file");
    let bytes = reqwest::blocking::get(&url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .map_err(|e| Error::Embedding(format!("download {}: {}", url, e)))?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, &bytes)?;
    Ok(())
}

fn load_model(model_name: &str) -> Result<LoadedModel> {
    let source = model_source(model_name)?;
    let model_dir = cache_dir()?.join(model_name);
    let onnx_path = model_dir.join(source.onnx);
    let tokenizer_path = model_dir.join(source.tokenizer);
    fetch(source.repo, source.onnx, &onnx_path)?;
    fetch(source.repo, source.tokenizer, &tokenizer_path)?;

    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| Error::Embedding(format!("load tokenizer: {}", e)))?;
    let plan = tract_onnx::onnx()
        .model_for_path(&onnx_path)
        .and_then(|m| m.into_optimized())
        .and_then(|m| m.into_runnable())
        .map_err(|e| Error::Embedding(format!("load ONNX model: {}", e)))?;

    Ok(LoadedModel { plan, tokenizer })
}

fn embed_chunk(model: &LoadedModel, dims: usize, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let encodings = texts
        .iter()
        .map(|s| {
            model
                .tokenizer
                .encode(s.as_str(), true)
                .map_err(|e| Error::Embedding(format!("tokenize: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;

    let seq_len = encodings
        .iter()
        .map(|e| e.get_ids().len())
        .max()
        .unwrap_or(1)
        .clamp(1, MAX_SEQ_LEN);
    let rows = encodings.len();

    let mut input_ids = vec![0i64; rows * seq_len];
    let mut attention = vec![0i64; rows * seq_len];
    let mut lengths = Vec::with_capacity(rows);
    for (i, enc) in encodings.iter().enumerate() {
        let ids = enc.get_ids();
        let len = ids.len().min(seq_len);
        for (j, &id) in ids.iter().take(len).enumerate() {
            input_ids[i * seq_len + j] = id as i64;
            attention[i * seq_len + j] = 1;
        }
        lengths.push(len);
    }

    let ids_tensor: Tensor = ndarray::Array2::from_shape_vec((rows, seq_len), input_ids)
        .map_err(Error::embedding)?
        .into();
    let mask_tensor: Tensor = ndarray::Array2::from_shape_vec((rows, seq_len), attention)
        .map_err(Error::embedding)?
        .into();

    let outputs = model
        .plan
        .run(tvec!(ids_tensor.into(), mask_tensor.into()))
        .map_err(|e| Error::Embedding(format!("tract inference: {}", e)))?;
    let output = outputs
        .into_iter()
        .next()
        .ok_or_else(|| Error::Embedding("model produced no output".to_string()))?;
    let view = output.to_array_view::<f32>().map_err(Error::embedding)?;

    // [batch, dims] is already pooled; [batch, seq, dims] needs mean pooling over real tokens.
    let shape = view.shape().to_vec();
    match shape.len() {
        2 => Ok((0..shape[0])
            .map(|i| normalize_l2(view.slice(ndarray::s![i, ..]).iter().copied().collect()))
            .collect()),
        3 => Ok(lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let mut pooled = vec![0f32; dims];
                for j in 0..len.min(shape[1]) {
                    for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().take(dims).enumerate() {
                        pooled[k] += v;
                    }
                }
                if len > 0 {
                    pooled.iter_mut().for_each(|x| *x /= len as f32);
                }
                normalize_l2(pooled)
            })
            .collect()),
        _ => Err(Error::Embedding(format!(
            "unexpected output shape {:?}",
            shape
        ))),
    }
}
