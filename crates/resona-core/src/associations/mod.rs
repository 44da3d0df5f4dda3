//! Association engine
//!
//! Undirected co-occurrence edges between memories, canonically ordered
//! (`memory_a < memory_b`). Empirical edges come from retrieval
//! co-occurrence with log-dampened strength; synthesis edges are woven
//! by the fold with a fixed positive seed.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::Tier;
use crate::storage::SqliteStore;

/// Maximum pairs per upsert batch (one transaction each)
pub const MAX_BATCH_PAIRS: usize = 1_000;

// ============================================================================
// TYPES
// ============================================================================

/// An association edge as seen from a discovery query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationEdge {
    pub memory_a: String,
    pub memory_b: String,
    pub co_occurrence_count: i64,
    pub strength: f64,
    pub conversation_contexts: Vec<String>,
    pub first_co_occurred_at: DateTime<Utc>,
    pub last_co_occurred_at: DateTime<Utc>,
    /// Content of the endpoint other than the queried memory
    pub other_content: String,
    /// Tier of the other endpoint
    pub other_tier: Tier,
    /// Phi of the other endpoint
    pub other_phi: f64,
}

/// A highly-connected memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryHub {
    pub memory_id: String,
    pub content: String,
    pub tier: Tier,
    pub resonance_phi: f64,
    pub is_catalyst: bool,
    pub connection_count: i64,
    pub average_strength: f64,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Association engine
#[derive(Clone)]
pub struct AssociationEngine {
    store: Arc<SqliteStore>,
}

impl AssociationEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Record pairwise co-occurrence for a retrieval result set.
    ///
    /// Pairs are canonicalized and deduplicated, then upserted in
    /// batches of at most [`MAX_BATCH_PAIRS`], one transaction each.
    /// Returns the number of distinct pairs touched.
    pub fn record_co_occurrences(
        &self,
        memory_ids: &[String],
        conversation_id: Option<&str>,
    ) -> Result<usize> {
        let pairs = canonical_pairs(memory_ids);
        if pairs.is_empty() {
            return Ok(0);
        }

        let total = pairs.len();
        for chunk in pairs.chunks(MAX_BATCH_PAIRS) {
            self.store
                .upsert_co_occurrence_batch(chunk, conversation_id)?;
        }

        tracing::debug!(pairs = total, "recorded co-occurrences");
        Ok(total)
    }

    /// Edges incident to a memory above a strength floor, strongest first
    pub fn discover(
        &self,
        memory_id: &str,
        min_strength: f64,
        limit: i64,
    ) -> Result<Vec<AssociationEdge>> {
        self.store
            .discover_associations(memory_id, min_strength, limit)
    }

    /// Highly-connected memories by degree and average strength
    pub fn find_hubs(&self, min_connections: i64, limit: i64) -> Result<Vec<MemoryHub>> {
        self.store.find_hubs(min_connections, limit)
    }

    /// Weave synthesis links from a fold product to its ancestors:
    /// fresh edges seed at strength 2.0, rewoven edges gain +1.0.
    pub fn weave_synthesis_links(
        &self,
        memory_id: &str,
        ancestor_ids: &[String],
        context: &str,
    ) -> Result<usize> {
        let mut woven = 0;
        for ancestor in ancestor_ids {
            if ancestor == memory_id {
                continue;
            }
            self.store.weave_link(memory_id, ancestor, context)?;
            woven += 1;
        }
        Ok(woven)
    }
}

/// All unordered pairs from a result set, canonicalized and deduplicated
fn canonical_pairs(memory_ids: &[String]) -> Vec<(String, String)> {
    let mut pairs = BTreeSet::new();
    for (i, a) in memory_ids.iter().enumerate() {
        for b in memory_ids.iter().skip(i + 1) {
            if a == b {
                continue;
            }
            let pair = if a < b {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };
            pairs.insert(pair);
        }
    }
    pairs.into_iter().collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingProvider;
    use crate::embeddings::content_hash;
    use crate::embeddings::testing::FakeEmbedder;
    use crate::memory::MemoryMetadata;
    use crate::storage::NewMemory;
    use uuid::Uuid;

    fn seed(store: &SqliteStore, content: &str) -> String {
        store
            .insert_memory(NewMemory {
                id: Uuid::new_v4().to_string(),
                content: content.to_string(),
                content_hash: content_hash(content),
                embedding: FakeEmbedder::new().embed(content).unwrap(),
                tier: Tier::Active,
                category: None,
                tags: vec![],
                source: None,
                metadata: MemoryMetadata::new(),
                conversation_id: None,
                resonance_phi: 0.0,
                is_catalyst: false,
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_canonical_pairs_dedup_and_order() {
        let ids = vec![
            "b".to_string(),
            "a".to_string(),
            "c".to_string(),
            "a".to_string(),
        ];
        let pairs = canonical_pairs(&ids);
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "b".to_string()),
                ("a".to_string(), "c".to_string()),
                ("b".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_record_and_discover() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = AssociationEngine::new(store.clone());
        let m1 = seed(&store, "first");
        let m2 = seed(&store, "second");
        let m3 = seed(&store, "third");

        let ids = vec![m1.clone(), m2.clone(), m3.clone()];
        assert_eq!(engine.record_co_occurrences(&ids, Some("conv")).unwrap(), 3);

        let edges = engine.discover(&m1, 0.0, 10).unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.co_occurrence_count == 1));
        assert!(edges.iter().all(|e| e.memory_a < e.memory_b));

        // Below the floor nothing comes back
        assert!(engine.discover(&m1, 1.5, 10).unwrap().is_empty());
    }

    #[test]
    fn test_weave_skips_self_links() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = AssociationEngine::new(store.clone());
        let m1 = seed(&store, "product");
        let m2 = seed(&store, "ancestor");

        let woven = engine
            .weave_synthesis_links(&m1, &[m2.clone(), m1.clone()], "fold:rem")
            .unwrap();
        assert_eq!(woven, 1);

        let edges = engine.discover(&m1, 0.0, 10).unwrap();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].strength - 2.0).abs() < 1e-9);
        assert_eq!(edges[0].conversation_contexts, vec!["fold:rem"]);
    }
}
