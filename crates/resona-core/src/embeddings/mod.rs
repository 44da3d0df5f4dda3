//! Semantic embeddings
//!
//! The engine never generates vectors itself; it talks to an
//! [`EmbeddingProvider`] through [`EmbeddingPort`], which fronts the
//! providers with a TTL-gated cache and a fallback chain.

mod cache;
mod port;

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
mod local;

pub use cache::{CacheStats, EmbeddingCache};
pub use port::{EmbeddingPort, EmbeddingProvider, EmbedOutcome, Provenance};

#[cfg(feature = "embeddings")]
pub use local::LocalEmbedder;

#[doc(hidden)]
pub mod testing;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Embedding dimensions (nomic-embed-text-v1.5 native width)
pub const EMBEDDING_DIMENSIONS: usize = 768;

/// Maximum text length accepted for embedding, in codepoints
pub const MAX_TEXT_LENGTH: usize = 50_000;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// Failed to initialize a provider
    #[error("Provider initialization failed: {0}")]
    ProviderInit(String),
    /// A provider failed to generate a vector
    #[error("Embedding generation failed: {0}")]
    GenerationFailed(String),
    /// Provider returned a vector of the wrong width
    #[error("Invalid dimensions: expected {expected}, got {got}")]
    InvalidDimensions { expected: usize, got: usize },
    /// Invalid input (empty, too long)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Primary and secondary providers both failed
    #[error("All providers failed: {0}")]
    AllProvidersFailed(String),
}

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched dimensions or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

/// Harmonic mean of similarity scores.
///
/// Zero entries are discarded; an empty input yields `None`; a single
/// surviving value returns itself. Used as the consonance gate for
/// synthesized memories, where one dissonant member should drag the
/// aggregate down hard.
pub fn harmonic_mean(values: &[f32]) -> Option<f32> {
    let nonzero: Vec<f32> = values.iter().copied().filter(|v| *v > 0.0).collect();
    match nonzero.len() {
        0 => None,
        1 => Some(nonzero[0]),
        n => {
            let reciprocal_sum: f32 = nonzero.iter().map(|v| 1.0 / v).sum();
            Some(n as f32 / reciprocal_sum)
        }
    }
}

/// SHA-256 digest of content, hex-encoded.
///
/// The deterministic identity used for exact deduplication and as the
/// embedding cache key.
pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Serialize a vector to little-endian bytes for BLOB storage
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize a vector from little-endian BLOB bytes
pub fn vector_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatched_dims() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_harmonic_mean_penalizes_outlier() {
        // One member far off the others drags the aggregate well below
        // the arithmetic mean
        let psi = harmonic_mean(&[0.9, 0.9, 0.1]).unwrap();
        assert!((psi - 0.2455).abs() < 0.01);
        assert!(psi < 0.40);
    }

    #[test]
    fn test_harmonic_mean_edges() {
        assert_eq!(harmonic_mean(&[]), None);
        assert_eq!(harmonic_mean(&[0.0, 0.0]), None);
        assert_eq!(harmonic_mean(&[0.7]), Some(0.7));
        // Zero entries are discarded, not averaged in
        assert_eq!(harmonic_mean(&[0.5, 0.0]), Some(0.5));
    }

    #[test]
    fn test_content_hash_deterministic() {
        let a = content_hash("patterns persist");
        let b = content_hash("patterns persist");
        let c = content_hash("patterns persist.");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_vector_bytes_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.75];
        let bytes = vector_to_bytes(&v);
        assert_eq!(vector_from_bytes(&bytes), Some(v));
        assert_eq!(vector_from_bytes(&bytes[..5]), None);
    }
}
