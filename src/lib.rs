//! # HubSpot MCP embeddings (library root)
//!
//! The semantic-search engine behind the HubSpot MCP server: it turns CRM
//! entities (contacts, companies, deals, engagements) into sentence
//! embeddings, keeps them in a nearest-neighbor index, caches vectors by
//! content hash, and answers similarity queries with score thresholds.
//!
//! ## Layers
//! - Entity model & text projection: [`entity`], [`projector`].
//! - Embedding cache & model adapter: [`cache`], [`embedding`].
//! - Vector index (flat or IVF over [`clustering`]): [`index`].
//! - Index lifecycle & ranking: [`manager`], [`search`].
//! - Protocol-facing tools: [`tools`].
//! - CLI & configuration: [`commands`], [`config`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use hubspot_mcp::config::EmbeddingsConfig;
//! use hubspot_mcp::manager::EmbeddingManager;
//! use hubspot_mcp::tools::{SearchRequest, SemanticSearchTool};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Arc::new(EmbeddingManager::from_config(&EmbeddingsConfig::default())?);
//! let search = SemanticSearchTool::new(manager);
//! println!("{}", search.call(SearchRequest::new("fintech startups in Berlin")).await);
//! # Ok(()) }
//! ```

use directories::ProjectDirs;
use std::error::Error;
use std::path::PathBuf;

pub mod cache;
pub mod clustering;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod entity;
pub mod error;
pub mod index;
pub mod manager;
pub mod projector;
pub mod search;
pub mod tools;

pub use entity::{EntityRecord, EntityType};
pub use error::{EmbeddingError, Result};
pub use manager::{BuildReport, EmbeddingManager, IndexStats, IndexStatus};
pub use search::SearchHit;

/// Return the per-platform configuration directory used by `hsmcp`.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "hubspot-mcp", "hsmcp")`, e.g. `~/.config/hsmcp` on Linux.
/// The directory is **not** created here.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined.
pub fn config_dir() -> Result<PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "hubspot-mcp", "hsmcp")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
