//! HNSW vector index
//!
//! Thin wrapper around USearch keyed by memory id. Distances are cosine;
//! scores returned to callers are similarities (`1 - distance`). The
//! index is rebuilt from the store at startup, so no on-disk persistence
//! is kept here.

use std::collections::HashMap;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::embeddings::EMBEDDING_DIMENSIONS;

// ============================================================================
// CONSTANTS
// ============================================================================

/// HNSW connectivity parameter (higher = better recall, more memory)
const DEFAULT_CONNECTIVITY: usize = 16;

/// Expansion factor while building the graph
const DEFAULT_EXPANSION_ADD: usize = 128;

/// Expansion factor while searching (higher = better recall, slower)
const DEFAULT_EXPANSION_SEARCH: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    #[error("Index creation failed: {0}")]
    IndexCreation(String),
    #[error("Failed to add vector: {0}")]
    IndexAdd(String),
    #[error("Search failed: {0}")]
    IndexSearch(String),
    #[error("Invalid dimensions: expected {expected}, got {got}")]
    InvalidDimensions { expected: usize, got: usize },
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vector index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSIONS,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW index keyed by memory id
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl VectorIndex {
    /// Create an index with default configuration
    pub fn new() -> Result<Self, VectorSearchError> {
        Self::with_config(VectorIndexConfig::default())
    }

    /// Create an index with custom configuration
    pub fn with_config(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            // Full-precision floats: consolidation and evolution compare
            // similarities against tight thresholds (0.95, 0.98, 0.92)
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };

        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;

        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    /// Number of vectors currently indexed
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_dims(&self, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Add or replace the vector for a memory id.
    ///
    /// USearch requires reserved capacity before every add.
    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        self.check_dims(vector)?;

        if let Some(&existing) = self.key_to_id.get(key) {
            self.index
                .remove(existing)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            return Ok(());
        }

        if self.index.size() >= self.index.capacity() {
            let new_capacity = std::cmp::max(self.index.capacity() * 2, 16);
            self.reserve(new_capacity)?;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;

        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    /// Remove a memory's vector; returns whether it was present
    pub fn remove(&mut self, key: &str) -> Result<bool, VectorSearchError> {
        match self.key_to_id.remove(key) {
            Some(id) => {
                self.id_to_key.remove(&id);
                self.index
                    .remove(id)
                    .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether a memory id is indexed
    pub fn contains(&self, key: &str) -> bool {
        self.key_to_id.contains_key(key)
    }

    /// Nearest neighbours as `(memory_id, similarity)`, best first
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        self.check_dims(query)?;

        if self.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let results = self
            .index
            .search(query, limit)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        let mut out = Vec::with_capacity(results.keys.len());
        for (key, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(id) = self.id_to_key.get(key) {
                out.push((id.clone(), 1.0 - distance));
            }
        }
        Ok(out)
    }

    /// Nearest neighbours at or above a similarity floor
    pub fn search_with_threshold(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        let results = self.search(query, limit)?;
        Ok(results
            .into_iter()
            .filter(|(_, score)| *score >= min_similarity)
            .collect())
    }

    fn reserve(&self, capacity: usize) -> Result<(), VectorSearchError> {
        self.index
            .reserve(capacity)
            .map_err(|e| VectorSearchError::IndexCreation(format!("reserve failed: {}", e)))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::{basis, blend};

    #[test]
    fn test_add_search_remove() {
        let mut index = VectorIndex::new().unwrap();
        index.add("m1", &basis(0)).unwrap();
        index.add("m2", &basis(1)).unwrap();
        index.add("m3", &blend(&basis(0), &basis(1), 0.9)).unwrap();

        let hits = index.search(&basis(0), 3).unwrap();
        assert_eq!(hits[0].0, "m1");
        assert!((hits[0].1 - 1.0).abs() < 1e-3);
        assert_eq!(hits[1].0, "m3");

        assert!(index.remove("m1").unwrap());
        assert!(!index.remove("m1").unwrap());
        let hits = index.search(&basis(0), 3).unwrap();
        assert_eq!(hits[0].0, "m3");
    }

    #[test]
    fn test_replace_updates_vector() {
        let mut index = VectorIndex::new().unwrap();
        index.add("m1", &basis(0)).unwrap();
        index.add("m1", &basis(5)).unwrap();
        assert_eq!(index.len(), 1);

        let hits = index.search(&basis(5), 1).unwrap();
        assert_eq!(hits[0].0, "m1");
        assert!((hits[0].1 - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_threshold_filters() {
        let mut index = VectorIndex::new().unwrap();
        index.add("near", &blend(&basis(0), &basis(1), 0.95)).unwrap();
        index.add("far", &basis(2)).unwrap();

        let hits = index.search_with_threshold(&basis(0), 10, 0.5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "near");
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new().unwrap();
        assert!(matches!(
            index.add("bad", &[1.0, 2.0]),
            Err(VectorSearchError::InvalidDimensions { .. })
        ));
    }
}
