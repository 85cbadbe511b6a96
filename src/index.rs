//! # Vector index
//!
//! Nearest-neighbor search over the stored entity vectors, by Euclidean
//! distance. Two strategies, fixed when the index is created:
//!
//! - [`IndexType::Flat`]: exact brute-force search backed by `hora`'s
//!   `BruteForceIndex`. The rows are kept alongside and persisted as
//!   bincode; loading replays them into a fresh hora index.
//! - [`IndexType::Ivf`]: inverted-file index. [`VectorIndex::train`] runs
//!   k-means over the first batch to carve the space into lists; each added
//!   vector joins the list of its nearest centroid, and a query scans only the
//!   `n_probe` closest lists. Persists as bincode.
//!
//!   The lists are fixed by that first training batch. Rows appended later
//!   join the existing lists, so an index first trained on a handful of
//!   vectors keeps only a handful of lists and each query scans more rows.
//!   `EmbeddingManager::rebuild_index` builds a fresh index and retrains on
//!   the whole set; run it after large appends.
//!
//! The index is append-only: rows are numbered in insertion order starting at
//! the current size, and nothing is ever removed.

use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::bruteforce_idx::BruteForceIndex;
use hora::index::bruteforce_params::BruteForceParams;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::clustering::{kmeans, nearest_centroid, squared_l2};
use crate::error::{EmbeddingError, Result};

/// Lists scanned per IVF query unless configured otherwise.
pub const DEFAULT_IVF_PROBES: usize = 8;

/// Upper bound on IVF lists regardless of corpus size.
const MAX_IVF_LISTS: usize = 1024;

const KMEANS_SEED: u64 = 0x4855_4253;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    #[default]
    Flat,
    Ivf,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Flat => "flat",
            IndexType::Ivf => "ivf",
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexType {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(IndexType::Flat),
            "ivf" => Ok(IndexType::Ivf),
            _ => Err(EmbeddingError::UnsupportedIndexType(s.to_string())),
        }
    }
}

/// One search result: a row of the index and its L2 distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row: usize,
    pub distance: f32,
}

fn l2(a: &[f32], b: &[f32]) -> f32 {
    squared_l2(a, b).sqrt()
}

/// Nearest first; equal distances keep row order.
fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.row.cmp(&b.row)));
}

/// Exact search over every stored vector.
pub struct FlatIndex {
    inner: BruteForceIndex<f32, usize>,
    dimension: usize,
    /// Row-ordered copy of what `inner` holds; this is what gets persisted.
    vectors: Vec<Vec<f32>>,
}

/// On-disk form of a [`FlatIndex`].
#[derive(Serialize, Deserialize)]
struct FlatSnapshot {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: BruteForceIndex::new(dimension, &BruteForceParams::default()),
            dimension,
            vectors: Vec::new(),
        }
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        for vector in vectors {
            self.inner
                .add(vector, self.vectors.len())
                .map_err(|e| EmbeddingError::Index(e.to_string()))?;
            self.vectors.push(vector.clone());
        }
        // hora needs the metric set before it will answer queries
        self.inner
            .build(Metric::Euclidean)
            .map_err(|e| EmbeddingError::Index(e.to_string()))
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut neighbors: Vec<Neighbor> = self
            .inner
            .search_nodes(query, k)
            .into_iter()
            .filter_map(|(node, _)| {
                (*node.idx()).map(|row| Neighbor {
                    row,
                    distance: l2(query, node.vectors()),
                })
            })
            .collect();
        sort_neighbors(&mut neighbors);
        neighbors.truncate(k);
        neighbors
    }

    fn save(&self, path: &Path) -> Result<()> {
        let snapshot = FlatSnapshot {
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        };
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serde::encode_into_std_write(&snapshot, &mut writer, bincode::config::standard())
            .map_err(|e| EmbeddingError::Index(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    /// Decode the stored rows and replay them into a fresh hora index.
    fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let snapshot: FlatSnapshot =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| EmbeddingError::corrupt(path, e))?;
        if snapshot.vectors.iter().any(|v| v.len() != snapshot.dimension) {
            return Err(EmbeddingError::corrupt(path, "stored vectors have mixed dimensions"));
        }
        let mut index = FlatIndex::new(snapshot.dimension);
        if !snapshot.vectors.is_empty() {
            index
                .add(&snapshot.vectors)
                .map_err(|e| EmbeddingError::corrupt(path, e))?;
        }
        Ok(index)
    }
}

/// Inverted-file index over k-means lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dimension: usize,
    n_probe: usize,
    centroids: Vec<Vec<f32>>,
    /// Rows belonging to each centroid's list.
    lists: Vec<Vec<usize>>,
    vectors: Vec<Vec<f32>>,
}

impl IvfIndex {
    pub fn new(dimension: usize, n_probe: usize) -> Self {
        Self {
            dimension,
            n_probe: n_probe.max(1),
            centroids: Vec::new(),
            lists: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn n_lists(&self) -> usize {
        self.centroids.len()
    }

    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if self.is_trained() || vectors.is_empty() {
            return Ok(());
        }
        let n_lists = ((vectors.len() as f64).sqrt().ceil() as usize).clamp(1, MAX_IVF_LISTS);
        let clusters = kmeans(vectors, n_lists.min(vectors.len()), KMEANS_SEED)?;
        self.lists = vec![Vec::new(); clusters.centroids.len()];
        self.centroids = clusters.centroids;
        Ok(())
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if !self.is_trained() {
            return Err(EmbeddingError::IndexNotTrained);
        }
        for vector in vectors {
            let list = nearest_centroid(vector, &self.centroids);
            self.lists[list].push(self.vectors.len());
            self.vectors.push(vector.clone());
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut by_centroid: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, squared_l2(query, c)))
            .collect();
        by_centroid.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut neighbors: Vec<Neighbor> = by_centroid
            .iter()
            .take(self.n_probe)
            .flat_map(|(list, _)| self.lists[*list].iter())
            .map(|&row| Neighbor {
                row,
                distance: l2(query, &self.vectors[row]),
            })
            .collect();
        sort_neighbors(&mut neighbors);
        neighbors.truncate(k);
        neighbors
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| EmbeddingError::Index(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let index: IvfIndex =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| EmbeddingError::corrupt(path, e))?;
        if index.lists.len() != index.centroids.len()
            || index.lists.iter().flatten().any(|&row| row >= index.vectors.len())
        {
            return Err(EmbeddingError::corrupt(path, "ivf lists reference missing rows"));
        }
        Ok(index)
    }
}

/// The vector index, in one of its two strategies.
pub enum VectorIndex {
    Flat(FlatIndex),
    Ivf(IvfIndex),
}

impl VectorIndex {
    pub fn create(index_type: IndexType, dimension: usize) -> Self {
        match index_type {
            IndexType::Flat => VectorIndex::Flat(FlatIndex::new(dimension)),
            IndexType::Ivf => VectorIndex::Ivf(IvfIndex::new(dimension, DEFAULT_IVF_PROBES)),
        }
    }

    /// Like [`VectorIndex::create`], parsing the strategy name first.
    pub fn create_named(index_type: &str, dimension: usize) -> Result<Self> {
        Ok(Self::create(index_type.parse()?, dimension))
    }

    /// Number of IVF lists scanned per query. Ignored by the flat strategy.
    pub fn with_probes(mut self, n_probe: usize) -> Self {
        if let VectorIndex::Ivf(ivf) = &mut self {
            ivf.n_probe = n_probe.max(1);
        }
        self
    }

    pub fn index_type(&self) -> IndexType {
        match self {
            VectorIndex::Flat(_) => IndexType::Flat,
            VectorIndex::Ivf(_) => IndexType::Ivf,
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            VectorIndex::Flat(flat) => flat.dimension,
            VectorIndex::Ivf(ivf) => ivf.dimension,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VectorIndex::Flat(flat) => flat.vectors.len(),
            VectorIndex::Ivf(ivf) => ivf.vectors.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_trained(&self) -> bool {
        match self {
            VectorIndex::Flat(_) => true,
            VectorIndex::Ivf(ivf) => ivf.is_trained(),
        }
    }

    fn check_dimensions(&self, vectors: &[Vec<f32>]) -> Result<()> {
        let expected = self.dimension();
        match vectors.iter().find(|v| v.len() != expected) {
            Some(bad) => Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: bad.len(),
            }),
            None => Ok(()),
        }
    }

    /// Learn the IVF partition from `vectors`. A no-op for flat indexes and
    /// for an IVF index that is already trained.
    pub fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        self.check_dimensions(vectors)?;
        match self {
            VectorIndex::Flat(_) => Ok(()),
            VectorIndex::Ivf(ivf) => ivf.train(vectors),
        }
    }

    /// Append `vectors` as rows `len()..len() + vectors.len()`.
    ///
    /// Every vector is checked before any is stored, so a mismatched batch
    /// leaves the index unchanged.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        self.check_dimensions(vectors)?;
        if vectors.is_empty() {
            return Ok(());
        }
        match self {
            VectorIndex::Flat(flat) => flat.add(vectors),
            VectorIndex::Ivf(ivf) => ivf.add(vectors),
        }
    }

    /// The `k` rows nearest to `query`, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension(),
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        Ok(match self {
            VectorIndex::Flat(flat) => flat.search(query, k),
            VectorIndex::Ivf(ivf) => ivf.search(query, k),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        match self {
            VectorIndex::Flat(flat) => flat.save(path),
            VectorIndex::Ivf(ivf) => ivf.save(path),
        }
    }

    /// Restore an index written by [`VectorIndex::save`]. `dimension` and
    /// `len` come from the sibling metadata file.
    pub fn load(path: &Path, index_type: IndexType, dimension: usize, len: usize) -> Result<Self> {
        if !path.exists() {
            return Err(EmbeddingError::IndexFileNotFound(path.to_path_buf()));
        }
        let index = match index_type {
            IndexType::Flat => VectorIndex::Flat(FlatIndex::load(path)?),
            IndexType::Ivf => VectorIndex::Ivf(IvfIndex::load(path)?),
        };
        if index.dimension() != dimension || index.len() != len {
            return Err(EmbeddingError::corrupt(
                path,
                format!(
                    "index holds {} vectors of dimension {}, metadata expects {len} of dimension {dimension}",
                    index.len(),
                    index.dimension()
                ),
            ));
        }
        Ok(index)
    }
}
