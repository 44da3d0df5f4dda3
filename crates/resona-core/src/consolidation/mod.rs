//! Semantic consolidation
//!
//! Prevents phi fragmentation when near-duplicate texts are ingested.
//! A short settle delay after ingest, then: find the most similar live
//! memory above the duplicate threshold, merge the newer row into the
//! older one (the older id is the stable resonator), archive the
//! absorbed content as a semantic variant, and soft-delete the newer
//! row — merge and soft-delete in one transaction.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{CoreError, Result};
use crate::memory::{Memory, SemanticVariant};
use crate::storage::SqliteStore;

/// Cosine similarity at which two memories are duplicates
pub const DUPLICATE_THRESHOLD: f32 = 0.95;

/// Similarity at which a merge contributes at full scale
pub const FULL_SCALE_THRESHOLD: f32 = 0.98;

/// Settle delay before post-ingest consolidation runs
pub const SETTLE_DELAY_MS: u64 = 1_000;

/// Candidate cap for the fragmentation diagnostic
const FRAGMENTATION_SCAN_CAP: usize = 256;

/// Result of a post-ingest consolidation pass
#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationOutcome {
    /// No live memory cleared the duplicate threshold
    Distinct,
    /// The new memory was absorbed into an older near-duplicate
    Merged {
        survivor_id: String,
        absorbed_id: String,
        similarity: f32,
    },
}

/// Semantic consolidation engine
#[derive(Clone)]
pub struct SemanticConsolidation {
    store: Arc<SqliteStore>,
}

impl SemanticConsolidation {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// The single most similar live memory at or above the threshold,
    /// excluding `exclude_id`
    pub fn find_semantic_duplicate(
        &self,
        embedding: &[f32],
        threshold: f32,
        exclude_id: Option<&str>,
    ) -> Result<Option<(Memory, f32)>> {
        let mut hits = self
            .store
            .similar_memories(embedding, 1, threshold, exclude_id, None)?;
        Ok(hits.drain(..).next())
    }

    /// Merge a near-duplicate's contribution into an existing memory.
    ///
    /// Phi grows by `base * scale` (base 1.0 for a catalyst variant,
    /// 0.1 otherwise; scale 1.0 at similarity >= 0.98, else 0.9),
    /// clamped at the ceiling. The variant is archived in metadata and
    /// the access trace is touched.
    pub fn merge_into_centroid(
        &self,
        existing_id: &str,
        new_content: &str,
        is_catalyst: bool,
        similarity: f32,
    ) -> Result<Memory> {
        // Merging a memory's own content back in is a no-op beyond
        // the timestamps
        let existing = self
            .store
            .get_live_memory(existing_id)?
            .ok_or_else(|| CoreError::MemoryNotFound(existing_id.to_string()))?;
        if existing.content == new_content {
            return self.store.touch_memory(existing_id);
        }

        let variant = Self::variant_for(new_content, is_catalyst, similarity);
        self.store.absorb_variant(existing_id, None, variant)
    }

    /// Post-ingest pass for a just-inserted memory.
    ///
    /// If a distinct live near-duplicate exists, the newer of the two
    /// rows is merged into the older and soft-deleted. Callers run this
    /// on the background supervisor after the settle delay.
    pub fn consolidate_new(&self, memory_id: &str) -> Result<ConsolidationOutcome> {
        let Some(memory) = self.store.get_live_memory(memory_id)? else {
            // Already absorbed by a concurrent pass; nothing to do
            return Ok(ConsolidationOutcome::Distinct);
        };
        let embedding = self
            .store
            .get_embedding(memory_id)?
            .ok_or_else(|| CoreError::MemoryNotFound(memory_id.to_string()))?;

        let Some((twin, similarity)) =
            self.find_semantic_duplicate(&embedding, DUPLICATE_THRESHOLD, Some(memory_id))?
        else {
            return Ok(ConsolidationOutcome::Distinct);
        };

        // The older id survives as the stable resonator
        let (survivor, absorbed) = if twin.created_at <= memory.created_at {
            (twin, memory)
        } else {
            (memory, twin)
        };

        let variant = Self::variant_for(&absorbed.content, absorbed.is_catalyst, similarity);
        self.store
            .absorb_variant(&survivor.id, Some(&absorbed.id), variant)?;

        tracing::info!(
            survivor = %survivor.id,
            absorbed = %absorbed.id,
            similarity,
            "semantic duplicate consolidated"
        );
        Ok(ConsolidationOutcome::Merged {
            survivor_id: survivor.id,
            absorbed_id: absorbed.id,
            similarity,
        })
    }

    /// Diagnostic pairwise scan over a bounded sample of live
    /// embeddings; returns pairs above the threshold, capped
    pub fn detect_fragmentation(
        &self,
        threshold: f32,
        max_pairs: usize,
    ) -> Result<Vec<(String, String, f32)>> {
        if max_pairs == 0 {
            return Ok(vec![]);
        }
        let sample = self.store.live_embeddings(FRAGMENTATION_SCAN_CAP)?;
        let mut pairs = Vec::new();

        'outer: for (i, (id_a, vec_a)) in sample.iter().enumerate() {
            for (id_b, vec_b) in sample.iter().skip(i + 1) {
                let similarity = crate::embeddings::cosine_similarity(vec_a, vec_b);
                if similarity >= threshold {
                    pairs.push((id_a.clone(), id_b.clone(), similarity));
                    if pairs.len() >= max_pairs {
                        break 'outer;
                    }
                }
            }
        }
        Ok(pairs)
    }

    fn variant_for(content: &str, is_catalyst: bool, similarity: f32) -> SemanticVariant {
        let base = if is_catalyst { 1.0 } else { 0.1 };
        let scale = if similarity >= FULL_SCALE_THRESHOLD {
            1.0
        } else {
            0.9
        };
        SemanticVariant {
            content: content.to_string(),
            merged_at: Utc::now(),
            phi_contributed: base * scale,
            similarity: similarity as f64,
            was_catalyst: is_catalyst,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
