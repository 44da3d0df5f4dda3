//! Deterministic embedding providers for tests.
//!
//! Hidden from docs; exists so integration tests (and downstream crates
//! wiring the engine in CI) can exercise the full pipeline without model
//! downloads or network access.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use super::{EMBEDDING_DIMENSIONS, EmbeddingError, EmbeddingProvider};

/// Normalize a vector to unit length in place
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Unit vector along a single axis
pub fn basis(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIMENSIONS];
    v[axis % EMBEDDING_DIMENSIONS] = 1.0;
    v
}

/// Normalized weighted blend of two vectors.
///
/// `blend(a, b, w)` leans towards `a` as `w` approaches 1.0, which gives
/// tests precise control over cosine similarity between seeded texts.
pub fn blend(a: &[f32], b: &[f32], weight: f32) -> Vec<f32> {
    let mut out: Vec<f32> = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| x * weight + y * (1.0 - weight))
        .collect();
    normalize(&mut out);
    out
}

/// Unit vector with an exact cosine to `anchor`, built from an
/// orthogonal unit vector. Both inputs must be orthonormal (e.g. two
/// distinct [`basis`] vectors).
pub fn with_similarity(anchor: &[f32], orthogonal: &[f32], cosine: f32) -> Vec<f32> {
    let residual = (1.0 - cosine * cosine).max(0.0).sqrt();
    anchor
        .iter()
        .zip(orthogonal.iter())
        .map(|(a, o)| a * cosine + o * residual)
        .collect()
}

/// Deterministic provider: seeded texts return their seeded vector,
/// everything else gets a content-hash-derived pseudo-random unit vector
/// (in 768 dimensions, distinct texts land nearly orthogonal).
#[derive(Default)]
pub struct FakeEmbedder {
    seeded: Mutex<HashMap<String, Vec<f32>>>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the vector returned for a specific text
    pub fn seed(&self, text: &str, vector: Vec<f32>) {
        self.seeded
            .lock()
            .expect("fake embedder lock")
            .insert(text.to_string(), vector);
    }

    fn derive(text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(EMBEDDING_DIMENSIONS);
        let mut counter = 0u32;
        while vector.len() < EMBEDDING_DIMENSIONS {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if vector.len() == EMBEDDING_DIMENSIONS {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map into [-1, 1]
                vector.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        normalize(&mut vector);
        vector
    }
}

impl EmbeddingProvider for FakeEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(v) = self.seeded.lock().expect("fake embedder lock").get(text) {
            return Ok(v.clone());
        }
        Ok(Self::derive(text))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Provider that always fails; drives fallback and substrate-unavailable paths
pub struct FailingEmbedder;

impl EmbeddingProvider for FailingEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::GenerationFailed("provider offline".into()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::cosine_similarity;

    #[test]
    fn test_derived_vectors_are_stable_and_distinct() {
        let fake = FakeEmbedder::new();
        let a1 = fake.embed("alpha").unwrap();
        let a2 = fake.embed("alpha").unwrap();
        let b = fake.embed("beta").unwrap();
        assert_eq!(a1, a2);
        assert!(cosine_similarity(&a1, &b).abs() < 0.2);
    }

    #[test]
    fn test_blend_controls_similarity() {
        let a = basis(0);
        let b = basis(1);
        let near_a = blend(&a, &b, 0.97);
        assert!(cosine_similarity(&a, &near_a) > 0.95);
        assert!(cosine_similarity(&b, &near_a) < 0.5);
    }

    #[test]
    fn test_with_similarity_is_exact() {
        let a = basis(0);
        let o = basis(1);
        for target in [0.3f32, 0.82, 0.96, 0.99] {
            let v = with_similarity(&a, &o, target);
            assert!((cosine_similarity(&a, &v) - target).abs() < 1e-5);
        }
    }
}
