//! # Errors
//!
//! Typed failures surfaced by the embedding core. Everything below the
//! [`EmbeddingManager`](crate::manager::EmbeddingManager) reports through
//! [`EmbeddingError`]; the manager passes them on untouched so the calling
//! tools can decide how to degrade (see [`crate::tools`]).

use std::path::PathBuf;

use thiserror::Error;

use crate::clustering::ClusteringError;

/// Convenience alias used throughout the library.
pub type Result<T, E = EmbeddingError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// The sentence embedding model could not be loaded. Semantic search is
    /// disabled for the lifetime of the adapter.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("unsupported index type `{0}` (expected `flat` or `ivf`)")]
    UnsupportedIndexType(String),

    #[error("no index to save; build the index first")]
    NoIndexToSave,

    #[error("index file not found: {}", .0.display())]
    IndexFileNotFound(PathBuf),

    #[error("index file {} is corrupt: {reason}", path.display())]
    IndexFileCorrupt { path: PathBuf, reason: String },

    #[error("dimension mismatch: index holds {expected}-d vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An IVF index was asked to add vectors before its clusters were trained.
    #[error("ivf index must be trained before vectors are added")]
    IndexNotTrained,

    /// The underlying ANN library rejected an operation.
    #[error("vector index error: {0}")]
    Index(String),

    #[error("embedding inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Clustering(#[from] ClusteringError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EmbeddingError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::IndexFileCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// `true` when the failure means embeddings are switched off rather than
    /// that a single request went wrong.
    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_))
    }
}
