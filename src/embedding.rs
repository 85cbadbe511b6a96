//! # Embedding model adapter
//!
//! Turns batches of text into fixed-dimension vectors.
//!
//! - [`EmbeddingModel`] is the seam the rest of the crate talks to.
//! - [`SentenceEmbeddingsModel`] runs `sentence-transformers/all-MiniLM-L6-v2`
//!   (or any BERT sentence model on the Hugging Face Hub) through Candle, with
//!   mean pooling and L2 normalization.
//! - [`LazyEmbedder`] defers loading the model until the first call that
//!   needs it and loads it at most once, even under concurrent first use. A
//!   failed load is remembered: every later call reports
//!   [`EmbeddingError::ModelUnavailable`] instead of retrying the download.
//!
//! ```no_run
//! use hubspot_mcp::embedding::{EmbeddingModel, LazyEmbedder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let embedder = LazyEmbedder::sentence_transformer("sentence-transformers/all-MiniLM-L6-v2", "main");
//! // Nothing has been downloaded yet.
//! let batch = embedder.embed_batch(&["John Doe john@x.com".to_string()])?;
//! assert_eq!(batch.dimension(), 384);
//! # Ok(()) }
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use once_cell::sync::OnceCell;
use std::error::Error;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::error::{EmbeddingError, Result};

/// A sentence embedding backend.
pub trait EmbeddingModel: Send + Sync {
    /// Identifier recorded in index stats and persisted metadata.
    fn model_name(&self) -> &str;

    /// Width of the vectors this model produces.
    fn dimension(&self) -> Result<usize>;

    /// Embed `texts`, one row per input, in input order. An empty batch
    /// yields a zero-row matrix of the model's dimension.
    fn embed_batch(&self, texts: &[String]) -> Result<Embeddings>;
}

/// A row-major `len x dimension` matrix of embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    dimension: usize,
    rows: Vec<Vec<f32>>,
}

impl Embeddings {
    /// Wrap `rows`, checking every row is `dimension` wide.
    pub fn new(dimension: usize, rows: Vec<Vec<f32>>) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|r| r.len() != dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }
        Ok(Self { dimension, rows })
    }

    pub fn empty(dimension: usize) -> Self {
        Self {
            dimension,
            rows: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<f32>> {
        self.rows
    }
}

/// Sentence embeddings model using Candle (pure Rust)
pub struct SentenceEmbeddingsModel {
    name: String,
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    hidden_size: usize,
}

impl SentenceEmbeddingsModel {
    /// Download (or reuse from the local hub cache) and load `model_id`.
    pub fn load(model_id: &str, revision: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let device = Device::Cpu;

        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
        let api = Api::new()?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo.get("config.json")?;
        let tokenizer_filename = api_repo.get("tokenizer.json")?;
        let weights_filename = api_repo.get("model.safetensors")?;

        let config = std::fs::read_to_string(config_filename)?;
        let raw: serde_json::Value = serde_json::from_str(&config)?;
        let hidden_size = raw
            .get("hidden_size")
            .and_then(serde_json::Value::as_u64)
            .ok_or("config.json has no hidden_size")? as usize;
        let config: Config = serde_json::from_str(&config)?;

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| format!("Failed to load tokenizer: {e}"))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;

        Ok(Self {
            name: model_id.to_string(),
            model,
            tokenizer,
            device,
            hidden_size,
        })
    }

    /// Encode a single text. Inputs past 512 tokens are truncated by the tokenizer.
    pub fn encode(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| format!("Tokenization error: {e}"))?;

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)?.unsqueeze(0)?;

        let output = self.model.forward(&token_ids, &token_type_ids, None)?;
        let embedding = self.mean_pooling(&output, tokens.get_attention_mask())?;
        let embedding = self.normalize(&embedding)?;

        Ok(embedding.to_vec1::<f32>()?)
    }

    /// Mean over token embeddings, weighted by the attention mask.
    fn mean_pooling(
        &self,
        embeddings: &Tensor,
        attention_mask: &[u32],
    ) -> Result<Tensor, Box<dyn Error + Send + Sync>> {
        // [1, seq_len, 1] so it broadcasts over [1, seq_len, hidden]
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let sum = embeddings.broadcast_mul(&mask)?.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        Ok(sum.broadcast_div(&count)?.squeeze(0)?)
    }

    fn normalize(&self, tensor: &Tensor) -> Result<Tensor, Box<dyn Error + Send + Sync>> {
        let norm = tensor.sqr()?.sum_all()?.sqrt()?;
        Ok(tensor.broadcast_div(&norm)?)
    }
}

impl EmbeddingModel for SentenceEmbeddingsModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> Result<usize> {
        Ok(self.hidden_size)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Embeddings> {
        let rows = texts
            .iter()
            .map(|t| self.encode(t))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;
        Embeddings::new(self.hidden_size, rows)
    }
}

type Loader = Box<dyn Fn() -> Result<Arc<dyn EmbeddingModel>, String> + Send + Sync>;

/// Loads its model on first use, exactly once.
pub struct LazyEmbedder {
    model_name: String,
    loader: Loader,
    model: OnceCell<Result<Arc<dyn EmbeddingModel>, String>>,
}

impl LazyEmbedder {
    pub fn new<F>(model_name: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn EmbeddingModel>, String> + Send + Sync + 'static,
    {
        Self {
            model_name: model_name.into(),
            loader: Box::new(loader),
            model: OnceCell::new(),
        }
    }

    /// A lazily loaded Candle BERT sentence model from the Hugging Face Hub.
    pub fn sentence_transformer(model_id: &str, revision: &str) -> Self {
        let (id, rev) = (model_id.to_string(), revision.to_string());
        Self::new(model_id, move || {
            SentenceEmbeddingsModel::load(&id, &rev)
                .map(|m| Arc::new(m) as Arc<dyn EmbeddingModel>)
                .map_err(|e| e.to_string())
        })
    }

    /// An embedder that never loads; every call reports `reason`.
    pub fn disabled(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new("disabled", move || Err(reason.clone()))
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.model.get(), Some(Ok(_)))
    }

    fn model(&self) -> Result<&Arc<dyn EmbeddingModel>> {
        let loaded = self.model.get_or_init(|| {
            info!(model = %self.model_name, "loading embedding model");
            let result = (self.loader)();
            match &result {
                Ok(m) => debug!(model = %self.model_name, dimension = ?m.dimension().ok(), "embedding model ready"),
                Err(reason) => warn!(model = %self.model_name, %reason, "embedding model failed to load; semantic search disabled"),
            }
            result
        });
        loaded
            .as_ref()
            .map_err(|reason| EmbeddingError::ModelUnavailable(reason.clone()))
    }
}

impl EmbeddingModel for LazyEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> Result<usize> {
        self.model()?.dimension()
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Embeddings> {
        let model = self.model()?;
        if texts.is_empty() {
            return Ok(Embeddings::empty(model.dimension()?));
        }
        model.embed_batch(texts)
    }
}

/// Deterministic bag-of-words embedder for tests.
///
/// Each lowercase alphanumeric token is hashed into one of `dimension`
/// buckets and the counts are L2-normalized, so texts sharing words land
/// close together and identical texts map to identical vectors.
#[cfg(test)]
pub struct MockEmbedder {
    dimension: usize,
    embedded: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            embedded: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Total number of texts embedded so far.
    pub fn texts_embedded(&self) -> usize {
        self.embedded.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = sha256::digest(token.to_lowercase());
            let bucket = u64::from_str_radix(&digest[..12], 16).unwrap_or(0) as usize % self.dimension;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[cfg(test)]
impl EmbeddingModel for MockEmbedder {
    fn model_name(&self) -> &str {
        "mock-bag-of-words"
    }

    fn dimension(&self) -> Result<usize> {
        Ok(self.dimension)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Embeddings> {
        self.embedded
            .fetch_add(texts.len(), std::sync::atomic::Ordering::SeqCst);
        Embeddings::new(self.dimension, texts.iter().map(|t| self.vector_for(t)).collect())
    }
}
