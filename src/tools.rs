//! # Protocol-facing tools
//!
//! Thin async wrappers the protocol handler layer calls. Both tools share one
//! [`EmbeddingManager`] by `Arc`, run the blocking manager work on tokio's
//! blocking pool, and always answer with text: a model that failed to load
//! reads as "Semantic search is disabled: …", anything else as "Error: …".
//! Neither tool ever returns an error to its caller.

use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, warn};

use crate::entity::{EntityRecord, EntityType};
use crate::error::EmbeddingError;
use crate::manager::{EmbeddingManager, IndexStatus};
use crate::projector::project;

const DEFAULT_LIMIT: usize = 10;
const DEFAULT_THRESHOLD: f32 = 0.5;

fn describe(err: EmbeddingError) -> String {
    match err {
        EmbeddingError::ModelUnavailable(reason) => {
            warn!(%reason, "semantic search disabled");
            format!("Semantic search is disabled: {reason}")
        }
        other => {
            error!(error = %other, "embedding operation failed");
            format!("Error: {other}")
        }
    }
}

/// Run `f` on the blocking pool and render its outcome.
async fn blocking<T, F>(f: F, render: impl FnOnce(T) -> String) -> String
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EmbeddingError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => render(value),
        Ok(Err(err)) => describe(err),
        Err(join) => {
            error!(error = %join, "embedding task panicked");
            format!("Error: embedding task failed: {join}")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagementAction {
    Build,
    Rebuild,
    Clear,
    Stats,
}

/// Arguments of the embedding management tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagementRequest {
    pub action: ManagementAction,
    /// Required for `build` and `rebuild`.
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
}

impl ManagementRequest {
    pub fn action(action: ManagementAction) -> Self {
        Self {
            action,
            entity_type: None,
            entities: Vec::new(),
        }
    }

    pub fn build(entity_type: EntityType, entities: Vec<EntityRecord>) -> Self {
        Self {
            action: ManagementAction::Build,
            entity_type: Some(entity_type),
            entities,
        }
    }

    pub fn rebuild(entity_type: EntityType, entities: Vec<EntityRecord>) -> Self {
        Self {
            action: ManagementAction::Rebuild,
            ..Self::build(entity_type, entities)
        }
    }
}

/// Builds, rebuilds, clears and reports on the embedding index.
#[derive(Clone)]
pub struct EmbeddingManagementTool {
    manager: Arc<EmbeddingManager>,
}

impl EmbeddingManagementTool {
    pub fn new(manager: Arc<EmbeddingManager>) -> Self {
        Self { manager }
    }

    /// Entry point for raw protocol arguments.
    pub async fn call_json(&self, args: serde_json::Value) -> String {
        match serde_json::from_value::<ManagementRequest>(args) {
            Ok(request) => self.call(request).await,
            Err(e) => format!("Error: invalid arguments: {e}"),
        }
    }

    pub async fn call(&self, request: ManagementRequest) -> String {
        let manager = Arc::clone(&self.manager);
        match request.action {
            ManagementAction::Build | ManagementAction::Rebuild => {
                let Some(entity_type) = request.entity_type else {
                    return "Error: entity_type is required to build the index".to_string();
                };
                let rebuild = request.action == ManagementAction::Rebuild;
                let count = request.entities.len();
                blocking(
                    move || {
                        if rebuild {
                            manager.rebuild_index(&request.entities, entity_type)
                        } else {
                            manager.build_index(&request.entities, entity_type)
                        }
                    },
                    move |report| {
                        let mut text = if rebuild {
                            format!(
                                "Rebuilt the {entity_type} embeddings from {count} entities, keeping {} of other types.",
                                report.retained
                            )
                        } else {
                            format!("Indexed {} {entity_type}.", report.added)
                        };
                        let _ = write!(
                            text,
                            " {} embedded, {} from cache. The index now holds {} entities.",
                            report.embedded, report.cache_hits, report.total
                        );
                        text
                    },
                )
                .await
            }
            ManagementAction::Clear => {
                blocking(
                    move || {
                        manager.clear_cache();
                        Ok(())
                    },
                    |()| "Embedding index and cache cleared.".to_string(),
                )
                .await
            }
            ManagementAction::Stats => {
                blocking(move || Ok(manager.get_index_stats()), |stats| {
                    let mut text = format!("Status: {}\n", stats.status);
                    if stats.status == IndexStatus::NotInitialized {
                        let _ = writeln!(text, "Index type: {}", stats.index_type);
                        text.push_str("No entities have been indexed yet.");
                        return text;
                    }
                    let _ = writeln!(text, "Total entities: {}", stats.total_entities);
                    for (entity_type, count) in &stats.entities_by_type {
                        let _ = writeln!(text, "  {entity_type}: {count}");
                    }
                    if let Some(dimension) = stats.dimension {
                        let _ = writeln!(text, "Dimension: {dimension}");
                    }
                    let _ = writeln!(text, "Index type: {}", stats.index_type);
                    let _ = writeln!(text, "Cached embeddings: {}", stats.cache_size);
                    let _ = write!(
                        text,
                        "Model: {}",
                        stats.model_name.as_deref().unwrap_or("unknown")
                    );
                    text
                })
                .await
            }
        }
    }
}

/// Arguments of the semantic search tool.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub threshold: Option<f32>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            entity_type: None,
            limit: None,
            threshold: None,
        }
    }
}

/// Answers natural-language queries against the embedding index.
#[derive(Clone)]
pub struct SemanticSearchTool {
    manager: Arc<EmbeddingManager>,
    default_limit: usize,
    default_threshold: f32,
}

impl SemanticSearchTool {
    pub fn new(manager: Arc<EmbeddingManager>) -> Self {
        Self {
            manager,
            default_limit: DEFAULT_LIMIT,
            default_threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Limit and threshold applied when a request leaves them out.
    pub fn with_defaults(mut self, limit: usize, threshold: f32) -> Self {
        self.default_limit = limit;
        self.default_threshold = threshold;
        self
    }

    pub async fn call_json(&self, args: serde_json::Value) -> String {
        match serde_json::from_value::<SearchRequest>(args) {
            Ok(request) => self.call(request).await,
            Err(e) => format!("Error: invalid arguments: {e}"),
        }
    }

    pub async fn call(&self, request: SearchRequest) -> String {
        if request.query.trim().is_empty() {
            return "Error: query must not be empty".to_string();
        }
        let manager = Arc::clone(&self.manager);
        let limit = request.limit.unwrap_or(self.default_limit);
        let threshold = request.threshold.unwrap_or(self.default_threshold);
        let SearchRequest {
            query, entity_type, ..
        } = request;
        let shown = query.clone();

        blocking(
            move || manager.search_similar_filtered(&query, limit, threshold, entity_type),
            move |hits| {
                if hits.is_empty() {
                    return format!(
                        "No entities matched \"{shown}\" with a score of at least {threshold:.2}."
                    );
                }
                let mut text = format!("Found {} entities similar to \"{shown}\":\n", hits.len());
                for (rank, hit) in hits.iter().enumerate() {
                    let summary = project(&hit.entity, hit.entity_type);
                    let summary = if summary.is_empty() {
                        "(no properties)"
                    } else {
                        summary.as_str()
                    };
                    let _ = write!(
                        text,
                        "\n{}. [{}] {} (id {}), score {:.3}",
                        rank + 1,
                        hit.entity_type,
                        summary,
                        hit.entity.id,
                        hit.score
                    );
                }
                text
            },
        )
        .await
    }
}
