//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the [`HubSpotMcpConfig`] struct, which holds the configuration parameters,
//! and a [`load_config`] function to load the configuration from a YAML file. Every field
//! has a default, so a partial (or empty) file is valid.
//!
//! # Examples
//!
//! ```no_run
//! use hubspot_mcp::config::load_config;
//!
//! let config = load_config("/path/to/config.yaml").unwrap();
//! println!("index type: {}", config.embeddings.index_type);
//! ```
//!
//! A complete file:
//!
//! ```yaml
//! embeddings:
//!   enabled: true
//!   model_id: sentence-transformers/all-MiniLM-L6-v2
//!   revision: main
//!   index_type: ivf
//!   ivf_probes: 8
//!   index_path: /var/lib/hsmcp/hubspot
//!   default_limit: 10
//!   default_threshold: 0.5
//! ```

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::PathBuf};
use tracing::debug;

use crate::index::DEFAULT_IVF_PROBES;

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct HubSpotMcpConfig {
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
}

/// Settings for the semantic search engine.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// When false the embedder never loads and semantic search reports itself disabled.
    pub enabled: bool,

    /// Hugging Face Hub id of the BERT sentence model.
    pub model_id: String,

    pub revision: String,

    /// `flat` or `ivf`. Validated when the manager is built.
    pub index_type: String,

    /// IVF lists scanned per query.
    pub ivf_probes: usize,

    /// Base path of the persisted index files. Defaults to `<config_dir>/index/hubspot`.
    pub index_path: Option<PathBuf>,

    pub default_limit: usize,

    pub default_threshold: f32,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_id: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            revision: "main".to_string(),
            index_type: "flat".to_string(),
            ivf_probes: DEFAULT_IVF_PROBES,
            index_path: None,
            default_limit: 10,
            default_threshold: 0.5,
        }
    }
}

impl EmbeddingsConfig {
    /// The configured index path, or `<config_dir>/index/hubspot`.
    pub fn resolved_index_path(&self) -> Result<PathBuf, Box<dyn Error>> {
        match &self.index_path {
            Some(path) => Ok(path.clone()),
            None => Ok(crate::config_dir()?.join("index").join("hubspot")),
        }
    }
}

/// Loads the application's configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid YAML for
/// [`HubSpotMcpConfig`].
pub fn load_config(file: &str) -> Result<HubSpotMcpConfig, Box<dyn Error>> {
    debug!("Loading config from {}", file);
    let content = fs::read_to_string(file)?;
    if content.trim().is_empty() {
        return Ok(HubSpotMcpConfig::default());
    }
    let config: HubSpotMcpConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
