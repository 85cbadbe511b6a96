//! # Index lifecycle
//!
//! [`EmbeddingManager`] owns the vector index, the row → entity metadata and
//! the embedding cache, and guards the three with a single `RwLock` so no
//! reader ever sees one updated without the others. Mutations (`build_index`,
//! `rebuild_index`, `clear_cache`, `load_index`, `save_index`) take the write
//! lock for their whole duration; `search_similar` and `get_index_stats` share
//! the read lock.
//!
//! ```text
//!   UNINITIALIZED --build_index(≥1 entity)--> READY --build_index--> READY (rows appended)
//!        ^                                      |
//!        +------------- clear_cache ------------+
//! ```
//!
//! The index is one global structure. `rebuild_index(entities, t)` replaces
//! only the rows of entity type `t`; rows of every other type are carried
//! into the fresh index from the cache.
//!
//! ## Persistence
//! [`EmbeddingManager::save_index`] writes three siblings of the given path:
//! `<path>.index` (vector index), `<path>.meta.yaml` (metadata) and
//! `<path>.cache.bin` (embedding cache). A missing cache file is tolerated on
//! load; a missing index or metadata file is not.
//!
//! ```no_run
//! use hubspot_mcp::entity::{EntityRecord, EntityType};
//! use hubspot_mcp::config::EmbeddingsConfig;
//! use hubspot_mcp::manager::EmbeddingManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = EmbeddingManager::from_config(&EmbeddingsConfig::default())?;
//! let john = EntityRecord::new("1")
//!     .with_property("firstname", "John")
//!     .with_property("lastname", "Doe");
//! manager.build_index(&[john], EntityType::Contacts)?;
//! for hit in manager.search_similar("John Doe", 5, 0.3)? {
//!     println!("{} {:.3}", hit.entity.id, hit.score);
//! }
//! manager.save_index("/tmp/hubspot")?;
//! # Ok(()) }
//! ```

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::EmbeddingCache;
use crate::config::EmbeddingsConfig;
use crate::embedding::{EmbeddingModel, LazyEmbedder};
use crate::entity::{EntityRecord, EntityType, IndexedEntityMetadata};
use crate::error::{EmbeddingError, Result};
use crate::index::{DEFAULT_IVF_PROBES, IndexType, VectorIndex};
use crate::projector::project;
use crate::search::{self, SearchHit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    NotInitialized,
    Ready,
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexStatus::NotInitialized => "not_initialized",
            IndexStatus::Ready => "ready",
        })
    }
}

/// Read-only snapshot of the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub status: IndexStatus,
    pub total_entities: usize,
    pub dimension: Option<usize>,
    pub index_type: IndexType,
    pub cache_size: usize,
    pub model_name: Option<String>,
    pub entities_by_type: BTreeMap<EntityType, usize>,
}

/// What a build or rebuild did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BuildReport {
    /// Rows appended to the index.
    pub added: usize,
    /// Of those, rows whose vector came from the cache.
    pub cache_hits: usize,
    /// Distinct texts sent to the model.
    pub embedded: usize,
    /// Rows of other entity types carried over by a rebuild.
    pub retained: usize,
    /// Rows in the index once this build finished, read before the lock was released.
    pub total: usize,
}

/// The three files a saved index is spread over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    pub index: PathBuf,
    pub metadata: PathBuf,
    pub cache: PathBuf,
}

impl IndexPaths {
    pub fn new(base: impl AsRef<Path>) -> Self {
        let sibling = |suffix: &str| {
            let mut name = OsString::from(base.as_ref().as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            index: sibling(".index"),
            metadata: sibling(".meta.yaml"),
            cache: sibling(".cache.bin"),
        }
    }

    pub fn exists(&self) -> bool {
        self.index.exists()
    }

    /// Delete whichever of the three files exist.
    pub fn remove(&self) -> std::io::Result<()> {
        for path in [&self.index, &self.metadata, &self.cache] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedMetadata {
    model_name: String,
    index_type: IndexType,
    dimension: usize,
    total_vectors: usize,
    entities: Vec<IndexedEntityMetadata>,
}

#[derive(Default)]
struct IndexState {
    index: Option<VectorIndex>,
    metadata: BTreeMap<usize, IndexedEntityMetadata>,
    cache: EmbeddingCache,
    model_name: Option<String>,
}

impl IndexState {
    /// An absent index means no metadata and no cache either.
    fn settle(&mut self) {
        if self.index.as_ref().is_none_or(VectorIndex::is_empty) {
            *self = IndexState::default();
        }
    }

    fn total(&self) -> usize {
        self.index.as_ref().map_or(0, VectorIndex::len)
    }
}

pub struct EmbeddingManager {
    embedder: Arc<dyn EmbeddingModel>,
    index_type: IndexType,
    ivf_probes: usize,
    state: RwLock<IndexState>,
}

impl EmbeddingManager {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, index_type: IndexType) -> Self {
        Self {
            embedder,
            index_type,
            ivf_probes: DEFAULT_IVF_PROBES,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Construct with the strategy given by name, failing with
    /// [`EmbeddingError::UnsupportedIndexType`] before anything is embedded.
    pub fn with_named_index(embedder: Arc<dyn EmbeddingModel>, index_type: &str) -> Result<Self> {
        Ok(Self::new(embedder, index_type.parse()?))
    }

    /// Build a manager over a lazily loaded sentence model as configured.
    pub fn from_config(config: &EmbeddingsConfig) -> Result<Self> {
        let index_type: IndexType = config.index_type.parse()?;
        let embedder: Arc<dyn EmbeddingModel> = if config.enabled {
            Arc::new(LazyEmbedder::sentence_transformer(
                &config.model_id,
                &config.revision,
            ))
        } else {
            Arc::new(LazyEmbedder::disabled("embeddings disabled in configuration"))
        };
        Ok(Self::new(embedder, index_type).with_ivf_probes(config.ivf_probes))
    }

    pub fn with_ivf_probes(mut self, ivf_probes: usize) -> Self {
        self.ivf_probes = ivf_probes.max(1);
        self
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Embed and append `entities` as rows of `entity_type`.
    ///
    /// Texts already in the cache are not re-embedded, but the rows are
    /// appended regardless: building the same entities twice stores them
    /// twice. An empty batch is a no-op.
    pub fn build_index(
        &self,
        entities: &[EntityRecord],
        entity_type: EntityType,
    ) -> Result<BuildReport> {
        if entities.is_empty() {
            debug!(%entity_type, "empty batch, nothing to index");
            return Ok(BuildReport {
                total: self.state.read().total(),
                ..BuildReport::default()
            });
        }
        let batch: Vec<(EntityRecord, EntityType)> =
            entities.iter().map(|e| (e.clone(), entity_type)).collect();

        let mut state = self.state.write();
        let result = self.append(&mut state, batch);
        state.settle();
        let result = result.map(|report| BuildReport {
            total: state.total(),
            ..report
        });

        if let Ok(report) = &result {
            info!(
                %entity_type,
                added = report.added,
                cache_hits = report.cache_hits,
                embedded = report.embedded,
                "indexed entities"
            );
        }
        result
    }

    /// Replace every row of `entity_type` with `entities`, keeping the rows
    /// of all other types. Row indices are reassigned. On failure the
    /// previous index is left in place.
    pub fn rebuild_index(
        &self,
        entities: &[EntityRecord],
        entity_type: EntityType,
    ) -> Result<BuildReport> {
        let mut state = self.state.write();

        let mut batch: Vec<(EntityRecord, EntityType)> = state
            .metadata
            .values()
            .filter(|m| m.entity_type != entity_type)
            .map(|m| (m.entity.clone(), m.entity_type))
            .collect();
        let retained = batch.len();
        batch.extend(entities.iter().map(|e| (e.clone(), entity_type)));

        let mut scratch = IndexState {
            cache: std::mem::take(&mut state.cache),
            ..IndexState::default()
        };
        match self.append(&mut scratch, batch) {
            Ok(mut report) => {
                scratch.settle();
                *state = scratch;
                report.retained = retained;
                report.total = state.total();
                info!(
                    %entity_type,
                    rebuilt = entities.len(),
                    retained,
                    embedded = report.embedded,
                    "rebuilt index"
                );
                Ok(report)
            }
            Err(e) => {
                state.cache = scratch.cache;
                state.settle();
                Err(e)
            }
        }
    }

    /// Drop the index, the metadata and the cache together.
    pub fn clear_cache(&self) {
        *self.state.write() = IndexState::default();
        info!("cleared embedding index and cache");
    }

    /// The `k` entities nearest to `query_text` scoring at least `threshold`.
    pub fn search_similar(&self, query_text: &str, k: usize, threshold: f32) -> Result<Vec<SearchHit>> {
        self.search_similar_filtered(query_text, k, threshold, None)
    }

    /// [`search_similar`](Self::search_similar), optionally restricted to one entity type.
    pub fn search_similar_filtered(
        &self,
        query_text: &str,
        k: usize,
        threshold: f32,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<SearchHit>> {
        let state = self.state.read();
        let Some(index) = state.index.as_ref().filter(|i| !i.is_empty()) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        // the query is free text, not an entity, so it skips projection
        let embedded = self.embedder.embed_batch(&[query_text.to_string()])?;
        let query = embedded
            .rows()
            .first()
            .ok_or_else(|| EmbeddingError::Inference("model returned no vector for the query".into()))?;

        let fetch = if entity_type.is_some() { index.len() } else { k };
        let neighbors = index.search(query, fetch)?;
        Ok(search::rank(neighbors, &state.metadata, k, threshold, entity_type))
    }

    pub fn get_index_stats(&self) -> IndexStats {
        let state = self.state.read();
        match &state.index {
            Some(index) => {
                let mut entities_by_type = BTreeMap::new();
                for meta in state.metadata.values() {
                    *entities_by_type.entry(meta.entity_type).or_insert(0) += 1;
                }
                IndexStats {
                    status: IndexStatus::Ready,
                    total_entities: index.len(),
                    dimension: Some(index.dimension()),
                    index_type: index.index_type(),
                    cache_size: state.cache.len(),
                    model_name: state.model_name.clone(),
                    entities_by_type,
                }
            }
            None => IndexStats {
                status: IndexStatus::NotInitialized,
                total_entities: 0,
                dimension: None,
                index_type: self.index_type,
                cache_size: 0,
                model_name: None,
                entities_by_type: BTreeMap::new(),
            },
        }
    }

    /// Persist index, metadata and cache next to `path`.
    pub fn save_index(&self, path: impl AsRef<Path>) -> Result<()> {
        let paths = IndexPaths::new(path);
        let mut state = self.state.write();
        let IndexState {
            index,
            metadata,
            cache,
            model_name,
        } = &mut *state;
        let index = index.as_mut().ok_or(EmbeddingError::NoIndexToSave)?;

        if let Some(parent) = paths.index.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        index.save(&paths.index)?;

        let persisted = PersistedMetadata {
            model_name: model_name
                .clone()
                .unwrap_or_else(|| self.embedder.model_name().to_string()),
            index_type: index.index_type(),
            dimension: index.dimension(),
            total_vectors: index.len(),
            entities: metadata.values().cloned().collect(),
        };
        let yaml = serde_yaml::to_string(&persisted).map_err(std::io::Error::other)?;
        fs::write(&paths.metadata, yaml)?;

        cache.save(&paths.cache)?;

        info!(
            path = %paths.index.display(),
            vectors = index.len(),
            cached = cache.len(),
            "saved embedding index"
        );
        Ok(())
    }

    /// Save when the index is ready; otherwise leave any files at `path`
    /// untouched. Returns whether anything was written.
    pub fn save_if_ready(&self, path: impl AsRef<Path>) -> Result<bool> {
        match self.save_index(path) {
            Ok(()) => Ok(true),
            Err(EmbeddingError::NoIndexToSave) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replace the in-memory state with the files written by
    /// [`save_index`](Self::save_index). Nothing changes unless every
    /// required file loads and validates.
    pub fn load_index(&self, path: impl AsRef<Path>) -> Result<()> {
        let paths = IndexPaths::new(path);
        let mut state = self.state.write();

        for required in [&paths.index, &paths.metadata] {
            if !required.exists() {
                return Err(EmbeddingError::IndexFileNotFound(required.clone()));
            }
        }

        let yaml = fs::read_to_string(&paths.metadata)?;
        let persisted: PersistedMetadata = serde_yaml::from_str(&yaml)
            .map_err(|e| EmbeddingError::corrupt(&paths.metadata, e))?;
        if persisted.total_vectors == 0 {
            return Err(EmbeddingError::corrupt(&paths.metadata, "metadata describes an empty index"));
        }

        let mut index = VectorIndex::load(
            &paths.index,
            persisted.index_type,
            persisted.dimension,
            persisted.total_vectors,
        )?;
        if index.index_type() == IndexType::Ivf {
            index = index.with_probes(self.ivf_probes);
        }

        let mut metadata = BTreeMap::new();
        for entry in persisted.entities {
            let row = entry.row_index;
            if row >= persisted.total_vectors || metadata.insert(row, entry).is_some() {
                return Err(EmbeddingError::corrupt(
                    &paths.metadata,
                    format!("bad or duplicate row index {row}"),
                ));
            }
        }

        let cache = match EmbeddingCache::load(&paths.cache)? {
            Some(cache) => cache,
            None => {
                warn!(path = %paths.cache.display(), "embedding cache file missing, starting with an empty cache");
                EmbeddingCache::new()
            }
        };

        if persisted.model_name != self.embedder.model_name() {
            warn!(
                saved = %persisted.model_name,
                current = %self.embedder.model_name(),
                "index was built with a different embedding model"
            );
        }

        info!(
            path = %paths.index.display(),
            vectors = index.len(),
            index_type = %index.index_type(),
            "loaded embedding index"
        );
        *state = IndexState {
            index: Some(index),
            metadata,
            cache,
            model_name: Some(persisted.model_name),
        };
        Ok(())
    }

    /// Project, embed (through the cache) and append `batch` to `state`.
    fn append(
        &self,
        state: &mut IndexState,
        batch: Vec<(EntityRecord, EntityType)>,
    ) -> Result<BuildReport> {
        if batch.is_empty() {
            return Ok(BuildReport::default());
        }

        let keyed: Vec<(String, String)> = batch
            .par_iter()
            .map(|(entity, entity_type)| {
                let text = project(entity, *entity_type);
                (EmbeddingCache::key_for(&text), text)
            })
            .collect();

        // distinct cache misses, first occurrence wins
        let mut missing: HashSet<&str> = HashSet::new();
        let mut miss_keys = Vec::new();
        let mut miss_texts = Vec::new();
        for (key, text) in &keyed {
            if !state.cache.contains(key) && missing.insert(key.as_str()) {
                miss_keys.push(key.clone());
                miss_texts.push(text.clone());
            }
        }
        let cache_hits = keyed
            .iter()
            .filter(|(key, _)| !missing.contains(key.as_str()))
            .count();

        if !miss_texts.is_empty() {
            let embeddings = self.embedder.embed_batch(&miss_texts)?;
            if embeddings.len() != miss_texts.len() {
                return Err(EmbeddingError::Inference(format!(
                    "model returned {} vectors for {} texts",
                    embeddings.len(),
                    miss_texts.len()
                )));
            }
            if let Some(index) = &state.index
                && index.dimension() != embeddings.dimension()
            {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: index.dimension(),
                    actual: embeddings.dimension(),
                });
            }
            for (key, vector) in miss_keys.into_iter().zip(embeddings.into_rows()) {
                state.cache.put(key, vector);
            }
        }

        let vectors = keyed
            .iter()
            .map(|(key, _)| {
                state
                    .cache
                    .get(key)
                    .map(<[f32]>::to_vec)
                    .ok_or_else(|| EmbeddingError::Inference(format!("no embedding cached for {key}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let start = match state.index.as_mut() {
            Some(index) => {
                let start = index.len();
                index.train(&vectors)?;
                index.add(&vectors)?;
                start
            }
            None => {
                let mut index =
                    VectorIndex::create(self.index_type, vectors[0].len()).with_probes(self.ivf_probes);
                index.train(&vectors)?;
                index.add(&vectors)?;
                state.index = Some(index);
                0
            }
        };

        for (offset, (entity, entity_type)) in batch.into_iter().enumerate() {
            let row_index = start + offset;
            state.metadata.insert(
                row_index,
                IndexedEntityMetadata {
                    row_index,
                    entity_type,
                    entity,
                },
            );
        }
        state.model_name = Some(self.embedder.model_name().to_string());

        Ok(BuildReport {
            added: keyed.len(),
            cache_hits,
            embedded: miss_texts.len(),
            retained: 0,
            total: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;

    const DIM: usize = 64;

    fn manager(index_type: IndexType) -> (EmbeddingManager, Arc<MockEmbedder>) {
        let mock = Arc::new(MockEmbedder::new(DIM));
        let embedder: Arc<dyn EmbeddingModel> = mock.clone();
        (EmbeddingManager::new(embedder, index_type), mock)
    }

    fn contact(id: &str, first: &str, last: &str, email: &str) -> EntityRecord {
        EntityRecord::new(id)
            .with_property("firstname", first)
            .with_property("lastname", last)
            .with_property("email", email)
    }

    fn john_and_jane() -> Vec<EntityRecord> {
        vec![
            contact("1", "John", "Doe", "john@x.com"),
            contact("2", "Jane", "Smith", "jane@x.com"),
        ]
    }

    fn companies() -> Vec<EntityRecord> {
        vec![
            EntityRecord::new("c1")
                .with_property("name", "Acme Rockets")
                .with_property("industry", "Aerospace"),
            EntityRecord::new("c2")
                .with_property("name", "Blue Lagoon Spa")
                .with_property("industry", "Wellness"),
            EntityRecord::new("c3")
                .with_property("name", "Quantum Ledger")
                .with_property("industry", "Fintech"),
        ]
    }

    #[test]
    fn fresh_manager_is_uninitialized_and_search_is_empty() {
        let (manager, mock) = manager(IndexType::Flat);
        let stats = manager.get_index_stats();
        assert_eq!(stats.status, IndexStatus::NotInitialized);
        assert_eq!(stats.total_entities, 0);
        assert_eq!(stats.dimension, None);
        assert_eq!(stats.cache_size, 0);
        assert_eq!(stats.model_name, None);

        assert!(manager.search_similar("anything", 5, 0.0).unwrap().is_empty());
        assert_eq!(mock.texts_embedded(), 0);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let (manager, mock) = manager(IndexType::Flat);
        let report = manager.build_index(&[], EntityType::Contacts).unwrap();
        assert_eq!(report, BuildReport::default());
        assert_eq!(manager.get_index_stats().status, IndexStatus::NotInitialized);
        assert_eq!(mock.texts_embedded(), 0);
    }

    #[test]
    fn john_doe_query_finds_john_first() {
        for index_type in [IndexType::Flat, IndexType::Ivf] {
            let (manager, _) = manager(index_type);
            manager
                .build_index(&john_and_jane(), EntityType::Contacts)
                .unwrap();

            let hits = manager.search_similar("John Doe", 1, 0.0).unwrap();
            assert_eq!(hits.len(), 1, "{index_type}");
            assert_eq!(hits[0].entity.id, "1");
            assert_eq!(hits[0].entity_type, EntityType::Contacts);
        }
    }

    #[test]
    fn build_fixes_dimension_and_reports_ready() {
        let (manager, _) = manager(IndexType::Flat);
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();

        let stats = manager.get_index_stats();
        assert_eq!(stats.status, IndexStatus::Ready);
        assert_eq!(stats.total_entities, 2);
        assert_eq!(stats.dimension, Some(DIM));
        assert_eq!(stats.index_type, IndexType::Flat);
        assert_eq!(stats.cache_size, 2);
        assert_eq!(stats.model_name.as_deref(), Some("mock-bag-of-words"));
        assert_eq!(stats.entities_by_type.get(&EntityType::Contacts), Some(&2));
    }

    #[test]
    fn threshold_keeps_only_the_exact_match() {
        let (manager, _) = manager(IndexType::Flat);
        manager.build_index(&companies(), EntityType::Companies).unwrap();

        let hits = manager
            .search_similar("Blue Lagoon Spa Wellness", 3, 0.99)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.id, "c2");
        assert!(hits[0].score >= 0.99);

        let all = manager.search_similar("Blue Lagoon Spa Wellness", 3, 0.0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].entity.id, "c2");
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn repeated_build_appends_duplicates_but_hits_cache() {
        let (manager, mock) = manager(IndexType::Flat);
        let first = manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        assert_eq!(first.embedded, 2);
        assert_eq!(first.cache_hits, 0);

        let second = manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        assert_eq!(second.embedded, 0);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(second.total, 4);
        assert_eq!(mock.texts_embedded(), 2);

        let stats = manager.get_index_stats();
        assert_eq!(stats.total_entities, 4);
        assert_eq!(stats.cache_size, 2);

        let hits = manager.search_similar("John Doe john@x.com", 2, 0.99).unwrap();
        let rows: Vec<usize> = hits.iter().map(|h| h.row_index).collect();
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn identical_texts_in_one_batch_embed_once() {
        let (manager, mock) = manager(IndexType::Flat);
        let twins = vec![
            contact("1", "Sam", "Lee", "sam@x.com"),
            contact("2", "Sam", "Lee", "sam@x.com"),
        ];
        let report = manager.build_index(&twins, EntityType::Contacts).unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.embedded, 1);
        assert_eq!(mock.texts_embedded(), 1);
    }

    #[test]
    fn clear_resets_everything() {
        let (manager, _) = manager(IndexType::Ivf);
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        manager.clear_cache();

        let stats = manager.get_index_stats();
        assert_eq!(stats.status, IndexStatus::NotInitialized);
        assert_eq!(stats.cache_size, 0);
        assert_eq!(stats.total_entities, 0);
        assert!(manager.search_similar("John", 5, 0.0).unwrap().is_empty());
    }

    #[test]
    fn rebuild_replaces_only_its_entity_type() {
        let (manager, mock) = manager(IndexType::Flat);
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        manager.build_index(&companies(), EntityType::Companies).unwrap();
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        assert_eq!(manager.get_index_stats().total_entities, 7);

        let report = manager
            .rebuild_index(&john_and_jane()[..1], EntityType::Contacts)
            .unwrap();
        assert_eq!(report.retained, 3);
        assert_eq!(report.added, 4);
        assert_eq!(report.embedded, 0);
        assert_eq!(mock.texts_embedded(), 5);

        let stats = manager.get_index_stats();
        assert_eq!(stats.total_entities, 4);
        assert_eq!(stats.entities_by_type.get(&EntityType::Contacts), Some(&1));
        assert_eq!(stats.entities_by_type.get(&EntityType::Companies), Some(&3));

        let hits = manager
            .search_similar_filtered("Jane Smith", 5, 0.0, Some(EntityType::Contacts))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.id, "1");
    }

    #[test]
    fn rebuild_with_nothing_left_is_uninitialized() {
        let (manager, _) = manager(IndexType::Flat);
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        manager.rebuild_index(&[], EntityType::Contacts).unwrap();

        let stats = manager.get_index_stats();
        assert_eq!(stats.status, IndexStatus::NotInitialized);
        assert_eq!(stats.cache_size, 0);
    }

    #[test]
    fn type_filter_restricts_hits() {
        let (manager, _) = manager(IndexType::Flat);
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        manager.build_index(&companies(), EntityType::Companies).unwrap();

        let hits = manager
            .search_similar_filtered("John Doe", 10, 0.0, Some(EntityType::Companies))
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.entity_type == EntityType::Companies));
    }

    #[test]
    fn unsupported_index_type_fails_before_embedding() {
        let mock = Arc::new(MockEmbedder::new(DIM));
        let embedder: Arc<dyn EmbeddingModel> = mock.clone();
        let err = EmbeddingManager::with_named_index(embedder, "bogus").err();
        assert!(matches!(err, Some(EmbeddingError::UnsupportedIndexType(name)) if name == "bogus"));
        assert_eq!(mock.texts_embedded(), 0);

        let config = EmbeddingsConfig {
            index_type: "hnsw".to_string(),
            ..EmbeddingsConfig::default()
        };
        assert!(matches!(
            EmbeddingManager::from_config(&config),
            Err(EmbeddingError::UnsupportedIndexType(_))
        ));
    }

    #[test]
    fn unavailable_model_surfaces_typed_error_and_keeps_state() {
        let embedder: Arc<dyn EmbeddingModel> =
            Arc::new(LazyEmbedder::disabled("embeddings disabled in configuration"));
        let manager = EmbeddingManager::new(embedder, IndexType::Flat);

        let err = manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap_err();
        assert!(err.is_model_unavailable());
        assert_eq!(manager.get_index_stats().status, IndexStatus::NotInitialized);
        assert!(manager.search_similar("John", 3, 0.0).unwrap().is_empty());
    }

    #[test]
    fn save_without_index_fails() {
        let (manager, _) = manager(IndexType::Flat);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            manager.save_index(dir.path().join("idx")),
            Err(EmbeddingError::NoIndexToSave)
        ));
    }

    #[test]
    fn save_and_load_reproduce_stats_and_results() {
        for index_type in [IndexType::Flat, IndexType::Ivf] {
            let dir = tempfile::tempdir().unwrap();
            let base = dir.path().join("nested").join("hubspot");

            let (original, _) = manager(index_type);
            original
                .build_index(&john_and_jane(), EntityType::Contacts)
                .unwrap();
            original.build_index(&companies(), EntityType::Companies).unwrap();
            original.save_index(&base).unwrap();

            let paths = IndexPaths::new(&base);
            assert!(paths.index.exists() && paths.metadata.exists() && paths.cache.exists());

            // the fresh manager is configured flat; the saved type wins
            let (restored, mock) = manager(IndexType::Flat);
            restored.load_index(&base).unwrap();
            assert_eq!(restored.get_index_stats(), original.get_index_stats());

            let before = original.search_similar("Acme Rockets", 3, 0.0).unwrap();
            let after = restored.search_similar("Acme Rockets", 3, 0.0).unwrap();
            assert_eq!(before, after);

            // only the query was embedded; the cached vectors came along
            restored
                .rebuild_index(&companies(), EntityType::Companies)
                .unwrap();
            assert_eq!(mock.texts_embedded(), 1);
        }
    }

    #[test]
    fn load_without_cache_file_starts_with_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("hubspot");
        let (original, _) = manager(IndexType::Flat);
        original
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        original.save_index(&base).unwrap();
        fs::remove_file(IndexPaths::new(&base).cache).unwrap();

        let (restored, _) = manager(IndexType::Flat);
        restored.load_index(&base).unwrap();
        let stats = restored.get_index_stats();
        assert_eq!(stats.status, IndexStatus::Ready);
        assert_eq!(stats.total_entities, 2);
        assert_eq!(stats.cache_size, 0);
    }

    #[test]
    fn failed_load_leaves_current_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(IndexType::Flat);
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        let before = manager.get_index_stats();

        let missing = dir.path().join("missing");
        assert!(matches!(
            manager.load_index(&missing),
            Err(EmbeddingError::IndexFileNotFound(p)) if p == IndexPaths::new(&missing).index
        ));

        let base = dir.path().join("broken");
        manager.save_index(&base).unwrap();
        fs::write(IndexPaths::new(&base).metadata, "entities: [not, a, mapping").unwrap();
        assert!(matches!(
            manager.load_index(&base),
            Err(EmbeddingError::IndexFileCorrupt { .. })
        ));

        assert_eq!(manager.get_index_stats(), before);
    }

    #[test]
    fn garbage_index_file_is_corrupt_and_keeps_state() {
        for index_type in [IndexType::Flat, IndexType::Ivf] {
            let dir = tempfile::tempdir().unwrap();
            let base = dir.path().join("hubspot");
            let (manager, _) = manager(index_type);
            manager
                .build_index(&john_and_jane(), EntityType::Contacts)
                .unwrap();
            manager.save_index(&base).unwrap();
            let before = manager.get_index_stats();

            fs::write(IndexPaths::new(&base).index, [0xff; 5]).unwrap();
            assert!(matches!(
                manager.load_index(&base),
                Err(EmbeddingError::IndexFileCorrupt { .. })
            ));
            assert_eq!(manager.get_index_stats(), before);
            assert_eq!(
                manager.search_similar("John Doe", 1, 0.0).unwrap()[0].entity.id,
                "1"
            );
        }
    }

    #[test]
    fn save_if_ready_never_touches_files_of_an_empty_manager() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("hubspot");
        let (original, _) = manager(IndexType::Flat);
        original
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        assert!(original.save_if_ready(&base).unwrap());

        let embedder: Arc<dyn EmbeddingModel> =
            Arc::new(LazyEmbedder::disabled("embeddings disabled in configuration"));
        let offline = EmbeddingManager::new(embedder, IndexType::Flat);
        assert!(
            offline
                .build_index(&companies(), EntityType::Companies)
                .unwrap_err()
                .is_model_unavailable()
        );
        assert!(!offline.save_if_ready(&base).unwrap());

        let paths = IndexPaths::new(&base);
        assert!(paths.index.exists() && paths.metadata.exists() && paths.cache.exists());
        let (restored, _) = manager(IndexType::Flat);
        restored.load_index(&base).unwrap();
        assert_eq!(restored.get_index_stats().total_entities, 2);
    }

    #[test]
    fn concurrent_builds_report_the_total_they_produced() {
        let (manager, _) = manager(IndexType::Flat);
        let manager = Arc::new(manager);
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    manager
                        .build_index(&john_and_jane(), EntityType::Contacts)
                        .unwrap()
                        .total
                })
            })
            .collect();

        let mut totals: Vec<usize> = writers.into_iter().map(|w| w.join().unwrap()).collect();
        totals.sort_unstable();
        assert_eq!(totals, (1..=8).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(manager.get_index_stats().total_entities, 16);

        let empty = manager.build_index(&[], EntityType::Deals).unwrap();
        assert_eq!(empty.added, 0);
        assert_eq!(empty.total, 16);
    }

    #[test]
    fn ivf_lists_follow_the_first_batch_until_rebuild() {
        let n_lists = |manager: &EmbeddingManager| match &manager.state.read().index {
            Some(VectorIndex::Ivf(ivf)) => ivf.n_lists(),
            _ => 0,
        };
        let vendors: Vec<EntityRecord> = (0..23)
            .map(|i| {
                EntityRecord::new(format!("v{i}"))
                    .with_property("name", format!("Vendor{i}"))
                    .with_property("city", format!("City{}", i % 7))
            })
            .collect();

        let (manager, _) = manager(IndexType::Ivf);
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();
        assert_eq!(n_lists(&manager), 2);

        manager.build_index(&vendors, EntityType::Companies).unwrap();
        assert_eq!(n_lists(&manager), 2);

        let report = manager.rebuild_index(&vendors, EntityType::Companies).unwrap();
        assert_eq!(report.total, 25);
        assert_eq!(n_lists(&manager), 5);
        let hits = manager.search_similar("Vendor7 City0", 1, 0.0).unwrap();
        assert_eq!(hits[0].entity.id, "v7");
    }

    #[test]
    fn mixing_models_is_a_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("hubspot");
        let (wide, _) = manager(IndexType::Flat);
        wide.build_index(&john_and_jane(), EntityType::Contacts).unwrap();
        wide.save_index(&base).unwrap();

        let narrow: Arc<dyn EmbeddingModel> = Arc::new(MockEmbedder::new(8));
        let manager = EmbeddingManager::new(narrow, IndexType::Flat);
        manager.load_index(&base).unwrap();

        let err = manager
            .build_index(&companies(), EntityType::Companies)
            .unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: DIM,
                actual: 8
            }
        ));
        let stats = manager.get_index_stats();
        assert_eq!(stats.total_entities, 2);
        assert_eq!(stats.cache_size, 2);
        assert!(manager.search_similar("John", 1, 0.0).is_err());
    }

    #[test]
    fn readers_never_see_rows_without_metadata() {
        let (manager, _) = manager(IndexType::Flat);
        let manager = Arc::new(manager);
        manager
            .build_index(&john_and_jane(), EntityType::Contacts)
            .unwrap();

        let writer = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for round in 0..20 {
                    if round % 5 == 4 {
                        manager.rebuild_index(&companies(), EntityType::Companies).unwrap();
                    } else {
                        manager.build_index(&companies(), EntityType::Companies).unwrap();
                    }
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let hits = manager.search_similar("Acme", 100, 0.0).unwrap();
                        assert!(!hits.is_empty());
                        assert!(hits.iter().all(|h| !h.entity.id.is_empty()));
                        let stats = manager.get_index_stats();
                        assert_eq!(
                            stats.entities_by_type.values().sum::<usize>(),
                            stats.total_entities
                        );
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
