//! # Embedding cache
//!
//! Memoizes embeddings by the SHA-256 of the projected text, so re-indexing an
//! unchanged entity never reaches the model. A hit is interchangeable with a
//! fresh embedding. There is no eviction; [`EmbeddingCache::clear`] is the only
//! way entries leave.
//!
//! The cache persists as a bincode blob next to the index files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{EmbeddingError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingCache {
    entries: HashMap<String, Vec<f32>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content hash used as the cache key: lowercase hex SHA-256 of `text`.
    pub fn key_for(text: &str) -> String {
        sha256::digest(text)
    }

    pub fn get(&self, key: &str) -> Option<&[f32]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn put(&mut self, key: String, vector: Vec<f32>) {
        self.entries.insert(key, vector);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Write the whole cache to `path` as a bincode blob.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serde::encode_into_std_write(&self.entries, &mut writer, bincode::config::standard())
            .map_err(|e| EmbeddingError::corrupt(path, e))?;
        writer.flush()?;
        Ok(())
    }

    /// Read a blob written by [`EmbeddingCache::save`].
    ///
    /// Returns `Ok(None)` when the file does not exist; the cache is an
    /// optimization and its absence is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = BufReader::new(File::open(path)?);
        let entries: HashMap<String, Vec<f32>> =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| EmbeddingError::corrupt(path, e))?;
        Ok(Some(Self { entries }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn put_then_get_returns_same_vector() {
        let mut cache = EmbeddingCache::new();
        let key = EmbeddingCache::key_for("John Doe john@x.com");
        cache.put(key.clone(), vec![0.25, -1.0, 3.5]);

        assert_eq!(cache.get(&key), Some(&[0.25, -1.0, 3.5][..]));
        assert_eq!(cache.get(&EmbeddingCache::key_for("Jane")), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn key_is_stable_hex_sha256() {
        let key = EmbeddingCache::key_for("");
        assert_eq!(
            key,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(EmbeddingCache::key_for("abc"), EmbeddingCache::key_for("abc"));
    }

    #[test]
    fn distinct_texts_never_collide() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut texts = HashSet::new();
        while texts.len() < 2000 {
            let len = rng.random_range(1..40);
            let text: String = (0..len)
                .map(|_| char::from(rng.random_range(b' '..=b'~')))
                .collect();
            texts.insert(text);
        }

        let keys: HashSet<String> = texts.iter().map(|t| EmbeddingCache::key_for(t)).collect();
        assert_eq!(keys.len(), texts.len());
    }

    #[test]
    fn blob_round_trips_and_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        assert!(EmbeddingCache::load(&path).unwrap().is_none());

        let mut cache = EmbeddingCache::new();
        cache.put(EmbeddingCache::key_for("a"), vec![1.0, 2.0]);
        cache.put(EmbeddingCache::key_for("b"), vec![3.0, 4.0]);
        cache.save(&path).unwrap();

        let loaded = EmbeddingCache::load(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&EmbeddingCache::key_for("b")), Some(&[3.0, 4.0][..]));
    }

    #[test]
    fn garbage_blob_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, [0xff, 0xff, 0xff, 0xff, 0xff]).unwrap();
        assert!(matches!(
            EmbeddingCache::load(&path),
            Err(EmbeddingError::IndexFileCorrupt { .. })
        ));
    }
}
