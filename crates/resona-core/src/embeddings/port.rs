//! Embedding port
//!
//! The engine's only route to vectors: cache first, then the primary
//! provider with bounded retries, then the secondary provider when one
//! is configured. Provenance is reported so callers can observe which
//! substrate answered, but downstream semantics never depend on it.

use std::sync::Arc;

use super::cache::EmbeddingCache;
use super::{EMBEDDING_DIMENSIONS, EmbeddingError, MAX_TEXT_LENGTH};

/// Attempts against the primary provider before falling back
const PRIMARY_RETRIES: usize = 2;

/// Contract to an external text-to-vector provider
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for the given text
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Short provider name for logs
    fn name(&self) -> &str;
}

/// Which substrate produced a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Cache,
    Primary,
    Secondary,
}

/// An embedding together with its provenance
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    pub vector: Vec<f32>,
    pub provenance: Provenance,
}

/// Cache-fronted provider chain
pub struct EmbeddingPort {
    cache: EmbeddingCache,
    primary: Arc<dyn EmbeddingProvider>,
    secondary: Option<Arc<dyn EmbeddingProvider>>,
}

impl EmbeddingPort {
    /// Create a port with a single provider
    pub fn new(primary: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            cache: EmbeddingCache::default(),
            primary,
            secondary: None,
        }
    }

    /// Configure a fallback provider
    pub fn with_secondary(mut self, secondary: Arc<dyn EmbeddingProvider>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Replace the default cache
    pub fn with_cache(mut self, cache: EmbeddingCache) -> Self {
        self.cache = cache;
        self
    }

    /// Embed text, consulting cache then providers.
    pub fn embed(&self, text: &str) -> Result<EmbedOutcome, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }
        if text.chars().count() > MAX_TEXT_LENGTH {
            return Err(EmbeddingError::InvalidInput(format!(
                "text exceeds {} codepoints",
                MAX_TEXT_LENGTH
            )));
        }

        if let Some(vector) = self.cache.get(text) {
            return Ok(EmbedOutcome {
                vector,
                provenance: Provenance::Cache,
            });
        }

        let mut primary_err = None;
        for attempt in 0..PRIMARY_RETRIES {
            match self.try_provider(self.primary.as_ref(), text) {
                Ok(vector) => {
                    self.cache.put(text, vector.clone());
                    return Ok(EmbedOutcome {
                        vector,
                        provenance: Provenance::Primary,
                    });
                }
                Err(e) => {
                    tracing::debug!(
                        provider = self.primary.name(),
                        attempt,
                        error = %e,
                        "primary embedding attempt failed"
                    );
                    primary_err = Some(e);
                }
            }
        }

        if let Some(secondary) = &self.secondary {
            match self.try_provider(secondary.as_ref(), text) {
                Ok(vector) => {
                    self.cache.put(text, vector.clone());
                    return Ok(EmbedOutcome {
                        vector,
                        provenance: Provenance::Secondary,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        provider = secondary.name(),
                        error = %e,
                        "secondary embedding provider failed"
                    );
                    return Err(EmbeddingError::AllProvidersFailed(format!(
                        "primary: {}; secondary: {}",
                        primary_err.map(|p| p.to_string()).unwrap_or_default(),
                        e
                    )));
                }
            }
        }

        Err(EmbeddingError::AllProvidersFailed(
            primary_err
                .map(|p| p.to_string())
                .unwrap_or_else(|| "no provider".into()),
        ))
    }

    /// Cache counters
    pub fn cache_stats(&self) -> super::CacheStats {
        self.cache.stats()
    }

    fn try_provider(
        &self,
        provider: &dyn EmbeddingProvider,
        text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let vector = provider.embed(text)?;
        if vector.len() != EMBEDDING_DIMENSIONS {
            return Err(EmbeddingError::InvalidDimensions {
                expected: EMBEDDING_DIMENSIONS,
                got: vector.len(),
            });
        }
        Ok(vector)
    }
}

// ============================================================================
// TESTS
// ============================================================================
