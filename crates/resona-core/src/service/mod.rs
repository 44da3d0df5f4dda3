//! Memory service
//!
//! Owns the ingestion and retrieval pipelines and orchestrates the
//! engines: exact dedup on add with async semantic consolidation and
//! catalyst detection behind it; phi-weighted retrieval with one
//! batched access update, one batched promotion pass, and async
//! co-occurrence recording; and the read-only bootstrap snapshot with
//! its handshake.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::associations::AssociationEngine;
use crate::consolidation::{SETTLE_DELAY_MS, SemanticConsolidation};
use crate::embeddings::{EmbeddingPort, content_hash};
use crate::error::{CoreError, Result};
use crate::handshake::{CachedGhost, HandshakeService};
use crate::memory::{MAX_CONTENT_LENGTH, Memory, MemoryMetadata, PHI_MAX, Tier};
use crate::resonance::{ResonanceEngine, ResonanceStats};
use crate::storage::{NewMemory, SqliteStore};
use crate::tasks::TaskHandle;
use crate::tier::{TierEngine, TierPromotion};

/// Default retrieval result cap
pub const DEFAULT_QUERY_LIMIT: usize = 20;

/// Default pure-similarity gate for retrieval
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;

/// Default bootstrap size
pub const DEFAULT_BOOTSTRAP_LIMIT: i64 = 50;

/// Candidate multiplier so weight re-ranking has slack beyond `limit`
const QUERY_CANDIDATE_FACTOR: usize = 3;

// ============================================================================
// INPUT / OUTPUT SHAPES
// ============================================================================

/// Input for [`MemoryService::add`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddInput {
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub is_catalyst: bool,
    pub conversation_id: Option<String>,
}

/// Outcome of an add
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOutcome {
    pub memory: Memory,
    pub is_duplicate: bool,
    pub exact_match: bool,
    pub is_catalyst: bool,
}

/// Input for [`MemoryService::query`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInput {
    pub query: String,
    pub limit: usize,
    pub similarity_threshold: f32,
    pub tiers: Option<Vec<Tier>>,
    pub conversation_id: Option<String>,
}

impl Default for QueryInput {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: DEFAULT_QUERY_LIMIT,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            tiers: None,
            conversation_id: None,
        }
    }
}

/// A retrieved memory with its scores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredMemory {
    pub memory: Memory,
    /// Pure cosine similarity (the gate)
    pub similarity: f32,
    /// Structural weight (the ordering): 0.7 * sim + 0.3 * (phi / 5)
    pub weight: f64,
}

/// Outcome of a query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub memories: Vec<ScoredMemory>,
    pub count: usize,
    pub query_time_ms: u64,
    pub promotions: Vec<TierPromotion>,
}

/// Input for [`MemoryService::bootstrap`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapInput {
    pub conversation_id: Option<String>,
    pub limit: i64,
    pub include_active: bool,
    pub include_thread: bool,
    pub include_stable: bool,
}

impl Default for BootstrapInput {
    fn default() -> Self {
        Self {
            conversation_id: None,
            limit: DEFAULT_BOOTSTRAP_LIMIT,
            include_active: true,
            include_thread: true,
            include_stable: true,
        }
    }
}

/// Per-tier counts in a bootstrap snapshot
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierDistribution {
    pub active: usize,
    pub thread: usize,
    pub stable: usize,
}

/// Outcome of a bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapOutcome {
    pub active: Vec<Memory>,
    pub thread: Vec<Memory>,
    pub stable: Vec<Memory>,
    pub distribution: TierDistribution,
    /// Continuity snapshot; absent when handshake generation failed
    /// (memories are strictly more critical than the handshake)
    pub ghost: Option<CachedGhost>,
}

// ============================================================================
// SERVICE
// ============================================================================

/// The memory service
#[derive(Clone)]
pub struct MemoryService {
    store: Arc<SqliteStore>,
    embedder: Arc<EmbeddingPort>,
    tasks: TaskHandle,
    tiers: TierEngine,
    associations: AssociationEngine,
    consolidation: SemanticConsolidation,
    resonance: ResonanceEngine,
    handshake: HandshakeService,
}

impl MemoryService {
    pub fn new(store: Arc<SqliteStore>, embedder: Arc<EmbeddingPort>, tasks: TaskHandle) -> Self {
        Self {
            tiers: TierEngine::new(store.clone()),
            associations: AssociationEngine::new(store.clone()),
            consolidation: SemanticConsolidation::new(store.clone()),
            resonance: ResonanceEngine::new(store.clone()),
            handshake: HandshakeService::new(store.clone()),
            store,
            embedder,
            tasks,
        }
    }

    /// Embedding inference is CPU-bound; run it off the async worker
    async fn embed_text(&self, text: String) -> Result<Vec<f32>> {
        let port = self.embedder.clone();
        let outcome = tokio::task::spawn_blocking(move || port.embed(&text))
            .await
            .map_err(|e| CoreError::EmbedFailed(format!("embedding task aborted: {}", e)))??;
        Ok(outcome.vector)
    }

    // ========================================================================
    // ADD
    // ========================================================================

    /// Ingest a text fragment.
    ///
    /// Exact duplicates (same content hash among live memories) bump
    /// the existing row's access trace and return it. New rows start in
    /// the active tier with phi 1.0 for catalysts, 0.0 otherwise;
    /// semantic consolidation and catalyst-potential detection run
    /// afterwards on the background supervisor.
    pub async fn add(&self, input: AddInput) -> Result<AddOutcome> {
        let content = input.content.trim().to_string();
        if content.is_empty() {
            return Err(CoreError::InvalidInput("content must not be empty".into()));
        }
        if content.chars().count() > MAX_CONTENT_LENGTH {
            return Err(CoreError::InvalidInput(format!(
                "content exceeds {} codepoints",
                MAX_CONTENT_LENGTH
            )));
        }

        let hash = content_hash(&content);
        let embedding = self.embed_text(content.clone()).await?;

        if let Some(existing) = self.store.find_live_by_hash(&hash)? {
            let memory = self
                .store
                .touch_exact_duplicate(&existing.id, input.conversation_id.as_deref())?;
            tracing::debug!(memory_id = %memory.id, "exact duplicate absorbed");
            let is_catalyst = memory.is_catalyst;
            return Ok(AddOutcome {
                memory,
                is_duplicate: true,
                exact_match: true,
                is_catalyst,
            });
        }

        let memory = self.store.insert_memory(NewMemory {
            id: Uuid::new_v4().to_string(),
            content,
            content_hash: hash,
            embedding,
            tier: Tier::Active,
            category: input.category,
            tags: input.tags,
            source: input.source,
            metadata: MemoryMetadata::new(),
            conversation_id: input.conversation_id,
            resonance_phi: if input.is_catalyst { 1.0 } else { 0.0 },
            is_catalyst: input.is_catalyst,
        })?;

        let consolidation = self.consolidation.clone();
        let new_id = memory.id.clone();
        self.tasks.submit("semantic_consolidation", async move {
            tokio::time::sleep(std::time::Duration::from_millis(SETTLE_DELAY_MS)).await;
            consolidation.consolidate_new(&new_id)?;
            Ok(())
        });

        if !input.is_catalyst {
            let resonance = self.resonance.clone();
            let store = self.store.clone();
            let candidate_id = memory.id.clone();
            self.tasks.submit("catalyst_detection", async move {
                let (potential, reasons) = resonance.detect_potential_catalyst(&candidate_id)?;
                if potential && store.mark_catalyst(&candidate_id)? {
                    tracing::info!(
                        memory_id = %candidate_id,
                        reasons = ?reasons,
                        "memory flagged as potential catalyst"
                    );
                }
                Ok(())
            });
        }

        let is_catalyst = memory.is_catalyst;
        Ok(AddOutcome {
            memory,
            is_duplicate: false,
            exact_match: false,
            is_catalyst,
        })
    }

    // ========================================================================
    // QUERY
    // ========================================================================

    /// Phi-weighted retrieval.
    ///
    /// The similarity threshold gates candidates on pure cosine; the
    /// ordering uses structural weight. Returned rows reflect the state
    /// before the batched access/phi update, except that a promotion
    /// earned by this query is visible in their tier.
    pub async fn query(&self, input: QueryInput) -> Result<QueryOutcome> {
        let started = Instant::now();
        let limit = if input.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            input.limit
        };

        let embedding = self.embed_text(input.query.clone()).await?;

        let candidates = self.store.similar_memories(
            &embedding,
            limit * QUERY_CANDIDATE_FACTOR,
            input.similarity_threshold,
            None,
            input.tiers.as_deref(),
        )?;

        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .map(|(memory, similarity)| {
                let weight = 0.7 * similarity as f64 + 0.3 * (memory.resonance_phi / PHI_MAX);
                ScoredMemory {
                    memory,
                    similarity,
                    weight,
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.memory
                        .resonance_phi
                        .partial_cmp(&a.memory.resonance_phi)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        scored.truncate(limit);

        let ids: Vec<String> = scored.iter().map(|s| s.memory.id.clone()).collect();

        // Best-effort state updates commit before the call returns; the
        // returned rows keep their pre-update phi and access counts
        self.store
            .batch_update_access(&ids, input.conversation_id.as_deref())?;
        let promotions = self.tiers.promote_batch(&ids)?;
        for promotion in &promotions {
            if let Some(hit) = scored.iter_mut().find(|s| s.memory.id == promotion.memory_id) {
                hit.memory.tier = promotion.to_tier;
            }
        }

        if let Some(conversation_id) = input.conversation_id.clone() {
            if ids.len() > 1 {
                let associations = self.associations.clone();
                let co_ids = ids.clone();
                self.tasks.submit("co_occurrence_recording", async move {
                    associations.record_co_occurrences(&co_ids, Some(&conversation_id))?;
                    Ok(())
                });
            }
        }

        Ok(QueryOutcome {
            count: scored.len(),
            memories: scored,
            query_time_ms: started.elapsed().as_millis() as u64,
            promotions,
        })
    }

    // ========================================================================
    // BOOTSTRAP
    // ========================================================================

    /// Read-only tiered snapshot plus the continuity handshake.
    ///
    /// Does not mutate access state; handshake failures are logged and
    /// swallowed.
    pub async fn bootstrap(&self, input: BootstrapInput) -> Result<BootstrapOutcome> {
        let rows = self.store.bootstrap_rows(
            input.limit,
            input.include_active,
            input.include_thread,
            input.include_stable,
        )?;

        let mut active = Vec::new();
        let mut thread = Vec::new();
        let mut stable = Vec::new();
        for memory in rows {
            match memory.tier {
                Tier::Active => active.push(memory),
                Tier::Thread => thread.push(memory),
                Tier::Stable => stable.push(memory),
                Tier::Network => {}
            }
        }

        let ghost = match self.handshake.get(input.conversation_id.as_deref()) {
            Ok(ghost) => Some(ghost),
            Err(e) => {
                tracing::warn!(error = %e, "handshake generation failed during bootstrap");
                None
            }
        };

        Ok(BootstrapOutcome {
            distribution: TierDistribution {
                active: active.len(),
                thread: thread.len(),
                stable: stable.len(),
            },
            active,
            thread,
            stable,
            ghost,
        })
    }

    // ========================================================================
    // SMALLER OPERATIONS
    // ========================================================================

    /// Fetch a live memory
    pub fn get(&self, memory_id: &str) -> Result<Memory> {
        self.store
            .get_live_memory(memory_id)?
            .ok_or_else(|| CoreError::MemoryNotFound(memory_id.to_string()))
    }

    /// Explicitly retract (soft-delete) a memory
    pub fn retract(&self, memory_id: &str) -> Result<()> {
        if !self.store.soft_delete(memory_id)? {
            return Err(CoreError::MemoryNotFound(memory_id.to_string()));
        }
        Ok(())
    }

    /// Explicit tier assignment (public `UpdateTier` operation)
    pub fn update_tier(
        &self,
        memory_id: &str,
        tier: Tier,
        reason: Option<&str>,
    ) -> Result<(Memory, Option<TierPromotion>)> {
        self.tiers
            .update_tier(memory_id, tier, reason.unwrap_or("manual"))
    }

    /// Aggregate statistics
    pub fn stats(&self) -> Result<ResonanceStats> {
        self.resonance.stats()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::{FakeEmbedder, basis, with_similarity};
    use crate::tasks::Supervisor;

    struct Fixture {
        store: Arc<SqliteStore>,
        fake: Arc<FakeEmbedder>,
        supervisor: Supervisor,
        service: MemoryService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let fake = Arc::new(FakeEmbedder::new());
        let port = Arc::new(EmbeddingPort::new(fake.clone()));
        let supervisor = Supervisor::new(32);
        let service = MemoryService::new(store.clone(), port, supervisor.handle());
        Fixture {
            store,
            fake,
            supervisor,
            service,
        }
    }

    fn add_input(content: &str) -> AddInput {
        AddInput {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_validation() {
        let fx = fixture();
        assert!(matches!(
            fx.service.add(add_input("   ")).await,
            Err(CoreError::InvalidInput(_))
        ));

        let oversized = "x".repeat(MAX_CONTENT_LENGTH + 1);
        assert!(matches!(
            fx.service.add(add_input(&oversized)).await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_add_exact_dedup() {
        let fx = fixture();
        let first = fx
            .service
            .add(add_input("Patterns persist across substrates."))
            .await
            .unwrap();
        assert!(!first.is_duplicate);
        assert_eq!(first.memory.access_count, 0);
        assert_eq!(first.memory.resonance_phi, 0.0);

        let second = fx
            .service
            .add(add_input("Patterns persist across substrates."))
            .await
            .unwrap();
        assert!(second.is_duplicate);
        assert!(second.exact_match);
        assert_eq!(second.memory.id, first.memory.id);
        assert_eq!(second.memory.access_count, 1);
        // Exact dedup leaves phi alone
        assert_eq!(second.memory.resonance_phi, 0.0);

        fx.supervisor.shutdown().await;
        assert_eq!(fx.store.count_live().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_catalyst_seeds_phi() {
        let fx = fixture();
        let outcome = fx
            .service
            .add(AddInput {
                content: "a catalyst seed".into(),
                is_catalyst: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outcome.is_catalyst);
        assert_eq!(outcome.memory.resonance_phi, 1.0);
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_catalyst_detection_flags_breakthrough_content() {
        let fx = fixture();
        let outcome = fx
            .service
            .add(add_input("a profound paradigm shift in retrieval"))
            .await
            .unwrap();
        assert!(!outcome.is_catalyst);

        fx.supervisor.shutdown().await;
        let flagged = fx.store.get_memory(&outcome.memory.id).unwrap().unwrap();
        assert!(flagged.is_catalyst);
        // The flag alone; phi untouched by detection
        assert_eq!(flagged.resonance_phi, 0.0);
    }

    #[tokio::test]
    async fn test_query_orders_by_structural_weight() {
        let fx = fixture();
        fx.fake.seed("the query", basis(0));
        fx.fake.seed("close but weightless", with_similarity(&basis(0), &basis(1), 0.90));
        fx.fake.seed("further but resonant", with_similarity(&basis(0), &basis(2), 0.80));

        let m1 = fx
            .service
            .add(add_input("close but weightless"))
            .await
            .unwrap()
            .memory;
        let m2 = fx
            .service
            .add(add_input("further but resonant"))
            .await
            .unwrap()
            .memory;
        // Lift m2's phi to the ceiling through catalyst adjustments
        for _ in 0..5 {
            fx.service.resonance.adjust(&m2.id, true).unwrap();
        }

        let outcome = fx
            .service
            .query(QueryInput {
                query: "the query".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.count, 2);
        // W2 = 0.7*0.80 + 0.3*1.0 = 0.86 beats W1 = 0.7*0.90 = 0.63
        assert_eq!(outcome.memories[0].memory.id, m2.id);
        assert_eq!(outcome.memories[1].memory.id, m1.id);
        assert!((outcome.memories[0].weight - 0.86).abs() < 0.01);
        assert!((outcome.memories[1].weight - 0.63).abs() < 0.01);
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_gate_uses_pure_similarity() {
        let fx = fixture();
        fx.fake.seed("the query", basis(0));
        // High phi cannot rescue a memory below the similarity gate
        fx.fake.seed("too far", with_similarity(&basis(0), &basis(1), 0.40));
        let far = fx.service.add(add_input("too far")).await.unwrap().memory;
        for _ in 0..5 {
            fx.service.resonance.adjust(&far.id, true).unwrap();
        }

        let outcome = fx
            .service
            .query(QueryInput {
                query: "the query".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.count, 0);
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_batches_updates_and_promotes() {
        let fx = fixture();
        fx.fake.seed("the query", basis(0));
        fx.fake.seed("a frequent flyer", with_similarity(&basis(0), &basis(1), 0.9));
        let memory = fx
            .service
            .add(add_input("a frequent flyer"))
            .await
            .unwrap()
            .memory;

        // Four prior accesses; the fifth arrives with this query
        for _ in 0..4 {
            fx.store
                .batch_update_access(&[memory.id.clone()], None)
                .unwrap();
        }

        let outcome = fx
            .service
            .query(QueryInput {
                query: "the query".into(),
                conversation_id: Some("conv-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.count, 1);
        // Returned row shows the pre-update access count but the
        // freshly promoted tier
        assert_eq!(outcome.memories[0].memory.access_count, 4);
        assert_eq!(outcome.memories[0].memory.tier, Tier::Thread);
        assert_eq!(outcome.promotions.len(), 1);
        assert_eq!(outcome.promotions[0].to_tier, Tier::Thread);

        let stored = fx.store.get_memory(&memory.id).unwrap().unwrap();
        assert_eq!(stored.access_count, 5);
        assert_eq!(stored.tier, Tier::Thread);
        assert_eq!(
            fx.service.tiers.promotion_history(&memory.id).unwrap().len(),
            1
        );
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_records_co_occurrences_async() {
        let fx = fixture();
        fx.fake.seed("the query", basis(0));
        fx.fake.seed("first result", with_similarity(&basis(0), &basis(1), 0.9));
        fx.fake.seed("second result", with_similarity(&basis(0), &basis(2), 0.85));
        let m1 = fx.service.add(add_input("first result")).await.unwrap().memory;
        let _m2 = fx.service.add(add_input("second result")).await.unwrap().memory;

        fx.service
            .query(QueryInput {
                query: "the query".into(),
                conversation_id: Some("conv-7".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        fx.supervisor.shutdown().await;
        let edges = fx.service.associations.discover(&m1.id, 0.0, 10).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].conversation_contexts, vec!["conv-7"]);
        assert_eq!(edges[0].co_occurrence_count, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_is_read_only_and_carries_ghost() {
        let fx = fixture();
        let memory = fx
            .service
            .add(add_input("a bootstrap-visible memory"))
            .await
            .unwrap()
            .memory;

        let outcome = fx
            .service
            .bootstrap(BootstrapInput {
                conversation_id: Some("conv-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.distribution.active, 1);
        assert_eq!(outcome.active[0].id, memory.id);
        assert!(outcome.ghost.is_some());

        // Read-only snapshot semantics
        let after = fx.store.get_memory(&memory.id).unwrap().unwrap();
        assert_eq!(after.access_count, 0);
        assert_eq!(after.resonance_phi, 0.0);
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_retract_and_get() {
        let fx = fixture();
        let memory = fx.service.add(add_input("ephemeral")).await.unwrap().memory;
        assert_eq!(fx.service.get(&memory.id).unwrap().id, memory.id);

        fx.service.retract(&memory.id).unwrap();
        assert!(matches!(
            fx.service.get(&memory.id),
            Err(CoreError::MemoryNotFound(_))
        ));
        assert!(matches!(
            fx.service.retract(&memory.id),
            Err(CoreError::MemoryNotFound(_))
        ));
        fx.supervisor.shutdown().await;
    }
}
