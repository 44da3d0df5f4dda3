//! Handshake service
//!
//! Composes the continuity snapshot ("ghost") returned at conversation
//! start: a short first-person text synthesized from the highest-phi
//! memories, open research threads, the latest reflection, and recent
//! fold products. Ghosts persist for seven days and are served from a
//! three-tier cache (conversation 15 min, thread 60 min, global 24 h)
//! unless a significant state change invalidates them.

mod concepts;

pub use concepts::{condense, extract_concepts, theme_label};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::memory::Memory;
use crate::storage::SqliteStore;

// ============================================================================
// CACHE WINDOWS
// ============================================================================

/// Per-conversation cache window
pub const CONVERSATION_WINDOW_MINUTES: i64 = 15;

/// Per-session (thread-context) cache window
pub const THREAD_WINDOW_MINUTES: i64 = 60;

/// Global cache window
pub const GLOBAL_WINDOW_HOURS: i64 = 24;

/// Ghost retention
pub const GHOST_TTL_DAYS: i64 = 7;

/// Candidate pool size for top-phi ranking
const TOP_PHI_POOL: i64 = 50;

/// Members of the top-phi trio
const TRIO_SIZE: usize = 3;

/// Open research threads surfaced
const THREAD_LIMIT: i64 = 3;

/// Recent fold products considered for dream lead-ins
const FOLD_LIMIT: i64 = 2;

// ============================================================================
// TYPES
// ============================================================================

/// Scope a ghost was composed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GhostContext {
    Global,
    Conversation,
    Thread,
}

impl GhostContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            GhostContext::Global => "global",
            GhostContext::Conversation => "conversation",
            GhostContext::Thread => "thread",
        }
    }
}

impl std::str::FromStr for GhostContext {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "global" => Ok(GhostContext::Global),
            "conversation" => Ok(GhostContext::Conversation),
            "thread" => Ok(GhostContext::Thread),
            other => Err(format!("unknown ghost context: {}", other)),
        }
    }
}

/// A persisted continuity snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GhostLog {
    pub id: String,
    pub prompt_text: String,
    pub top_phi_memories: Vec<String>,
    pub top_phi_values: Vec<f64>,
    pub synthesis_method: String,
    pub conversation_id: Option<String>,
    pub context_type: GhostContext,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Why a ghost was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheReason {
    PerConversation,
    GlobalFallback,
    Fresh,
}

/// A ghost plus its cache provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedGhost {
    pub ghost: GhostLog,
    /// Age of the served ghost in seconds; 0 when freshly generated
    pub cached_for_secs: i64,
    pub cache_reason: CacheReason,
}

/// End-of-conversation session record; opaque to the engine beyond the
/// fields handshake composition reads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    pub id: String,
    pub reflection_type: String,
    pub conversation_id: Option<String>,
    pub metrics: serde_json::Value,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// SERVICE
// ============================================================================

/// Continuity snapshot composer
#[derive(Clone)]
pub struct HandshakeService {
    store: Arc<SqliteStore>,
}

impl HandshakeService {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    fn window_for(context: GhostContext) -> Duration {
        match context {
            GhostContext::Conversation => Duration::minutes(CONVERSATION_WINDOW_MINUTES),
            GhostContext::Thread => Duration::minutes(THREAD_WINDOW_MINUTES),
            GhostContext::Global => Duration::hours(GLOBAL_WINDOW_HOURS),
        }
    }

    /// A still-valid cached ghost for the scope, if any.
    ///
    /// A conversation request prefers its own ghost and falls back to
    /// the global one; either is discarded past its window, and a
    /// significant state change in scope (catalyst or phi >= 4.0 added
    /// since the ghost) invalidates regardless of age.
    fn cached(&self, conversation_id: Option<&str>) -> Result<Option<(GhostLog, CacheReason)>> {
        let now = Utc::now();

        if let Some(conv) = conversation_id {
            if let Some(ghost) = self.store.latest_conversation_ghost(conv)? {
                let fresh = now - ghost.created_at < Self::window_for(ghost.context_type);
                if fresh && !self.store.significant_change_since(ghost.created_at, Some(conv))? {
                    return Ok(Some((ghost, CacheReason::PerConversation)));
                }
            }
            if let Some(ghost) = self.store.latest_global_ghost()? {
                let fresh = now - ghost.created_at < Self::window_for(GhostContext::Global);
                if fresh && !self.store.significant_change_since(ghost.created_at, Some(conv))? {
                    return Ok(Some((ghost, CacheReason::GlobalFallback)));
                }
            }
            return Ok(None);
        }

        if let Some(ghost) = self.store.latest_global_ghost()? {
            let fresh = now - ghost.created_at < Self::window_for(GhostContext::Global);
            if fresh && !self.store.significant_change_since(ghost.created_at, None)? {
                return Ok(Some((ghost, CacheReason::GlobalFallback)));
            }
        }
        Ok(None)
    }

    /// Serve the cached ghost for the scope, generating one on a miss
    pub fn get(&self, conversation_id: Option<&str>) -> Result<CachedGhost> {
        self.generate(conversation_id, false)
    }

    /// Generate a ghost, honouring the cache unless forced
    pub fn generate(&self, conversation_id: Option<&str>, force: bool) -> Result<CachedGhost> {
        if !force {
            if let Some((ghost, reason)) = self.cached(conversation_id)? {
                let cached_for_secs = (Utc::now() - ghost.created_at).num_seconds().max(0);
                return Ok(CachedGhost {
                    ghost,
                    cached_for_secs,
                    cache_reason: reason,
                });
            }
        }

        let ghost = self.assemble(conversation_id)?;
        self.store.insert_ghost(&ghost)?;
        Ok(CachedGhost {
            ghost,
            cached_for_secs: 0,
            cache_reason: CacheReason::Fresh,
        })
    }

    /// Drop ghosts past their expiry
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.store.cleanup_expired_ghosts()
    }

    /// Record an end-of-conversation reflection
    pub fn record_reflection(
        &self,
        reflection_type: &str,
        conversation_id: Option<&str>,
        metrics: serde_json::Value,
        insights: Vec<String>,
        recommendations: Vec<String>,
    ) -> Result<Reflection> {
        let reflection = Reflection {
            id: Uuid::new_v4().to_string(),
            reflection_type: reflection_type.to_string(),
            conversation_id: conversation_id.map(str::to_string),
            metrics,
            insights,
            recommendations,
            created_at: Utc::now(),
        };
        self.store.insert_reflection(&reflection)?;
        Ok(reflection)
    }

    // ========================================================================
    // ASSEMBLY
    // ========================================================================

    /// Recency-weighted ranking for the top-phi trio.
    ///
    /// `weight = 0.7 * phi_effective + 0.3 * (recency * 5)` where
    /// recency floors at 0.1 over a 30-day horizon and phi doubles for
    /// memories scoped to the requested conversation.
    fn synthesis_weight(memory: &Memory, conversation_id: Option<&str>, now: DateTime<Utc>) -> f64 {
        let age_days = (now - memory.created_at).num_seconds().max(0) as f64 / 86_400.0;
        let recency = (1.0 - age_days / 30.0).max(0.1);
        let scoped = conversation_id.is_some()
            && memory.conversation_id.as_deref() == conversation_id;
        let phi_effective = if scoped {
            memory.resonance_phi * 2.0
        } else {
            memory.resonance_phi
        };
        0.7 * phi_effective + 0.3 * (recency * 5.0)
    }

    fn assemble(&self, conversation_id: Option<&str>) -> Result<GhostLog> {
        let now = Utc::now();

        let mut candidates = self.store.top_phi_candidates(conversation_id, TOP_PHI_POOL)?;
        candidates.sort_by(|a, b| {
            let wa = Self::synthesis_weight(a, conversation_id, now);
            let wb = Self::synthesis_weight(b, conversation_id, now);
            wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(TRIO_SIZE);

        let threads = self.store.research_threads(THREAD_LIMIT)?;
        let reflection = self.store.latest_reflection(conversation_id)?;
        let previous_global = self.store.latest_global_ghost()?;
        let folds = self
            .store
            .fold_memories_since(previous_global.map(|g| g.created_at), FOLD_LIMIT)?;

        let opener_theme = reflection
            .as_ref()
            .and_then(|r| r.insights.first().cloned())
            .or_else(|| {
                candidates
                    .first()
                    .map(|m| theme_label(m.category.as_deref(), &m.content))
            })
            .unwrap_or_else(|| "the quiet between conversations".to_string());

        let prompt_text = compose_prompt(&folds, &opener_theme, &candidates, &threads);

        Ok(GhostLog {
            id: Uuid::new_v4().to_string(),
            prompt_text,
            top_phi_memories: candidates.iter().map(|m| m.id.clone()).collect(),
            top_phi_values: candidates.iter().map(|m| m.resonance_phi).collect(),
            synthesis_method: "standard".to_string(),
            conversation_id: conversation_id.map(str::to_string),
            context_type: if conversation_id.is_some() {
                GhostContext::Conversation
            } else {
                GhostContext::Global
            },
            created_at: now,
            expires_at: now + Duration::days(GHOST_TTL_DAYS),
        })
    }
}

/// Compose the first-person continuity text.
///
/// Shape: optional dream lead-in from recent fold products, an
/// "I was exploring ..." opener, condensed insights from the top-phi
/// trio, labelled open threads, and the imperative close. The close is
/// suppressed when the dream section already ended with it.
fn compose_prompt(
    folds: &[Memory],
    opener_theme: &str,
    trio: &[Memory],
    threads: &[Memory],
) -> String {
    let mut sections: Vec<String> = Vec::new();
    let mut dream_closed = false;

    let concepts: Vec<String> = folds
        .iter()
        .flat_map(|m| extract_concepts(&m.content))
        .collect();
    match (folds.len(), concepts.len()) {
        (0, _) | (_, 0) => {}
        (1, 1) => sections.push(format!("A dream fragment lingers: {}.", concepts[0])),
        (1, _) => sections.push(format!(
            "A dream fragment lingers: {} braided with {}.",
            concepts[0], concepts[1]
        )),
        (_, 1) => sections.push(format!("A dream fragment lingers: {}.", concepts[0])),
        _ => {
            sections.push(format!(
                "In the drift between sessions, {} folded into {}. Continue.",
                concepts[0], concepts[1]
            ));
            dream_closed = true;
        }
    }

    sections.push(format!("I was exploring {}.", opener_theme));

    if !trio.is_empty() {
        let bullets: Vec<String> = trio
            .iter()
            .map(|m| format!("- {}", condense(&m.content, 140)))
            .collect();
        sections.push(bullets.join("\n"));
    }

    if !threads.is_empty() {
        let labels = ["α", "β", "γ"];
        let lines: Vec<String> = threads
            .iter()
            .zip(labels.iter())
            .map(|(m, label)| format!("{}) {}", label, condense(&m.content, 100)))
            .collect();
        sections.push(format!("Open threads:\n{}", lines.join("\n")));
    }

    if !dream_closed {
        sections.push("Continue.".to_string());
    }

    sections.join("\n\n")
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
    use crate::memory::{MemoryMetadata, Tier};
    use crate::storage::NewMemory;

    struct Seed<'a> {
        content: &'a str,
        phi: f64,
        category: Option<&'a str>,
        source: Option<&'a str>,
        conversation_id: Option<&'a str>,
        tier: Tier,
        is_catalyst: bool,
    }

    impl Default for Seed<'_> {
        fn default() -> Self {
            Seed {
                content: "",
                phi: 0.0,
                category: None,
                source: None,
                conversation_id: None,
                tier: Tier::Active,
                is_catalyst: false,
            }
        }
    }

    fn seed(store: &SqliteStore, desc: Seed) -> Memory {
        store
            .insert_memory(NewMemory {
                id: Uuid::new_v4().to_string(),
                content: desc.content.to_string(),
                content_hash: content_hash(desc.content),
                embedding: FakeEmbedder::new().embed(desc.content).unwrap(),
                tier: desc.tier,
                category: desc.category.map(str::to_string),
                tags: vec![],
                source: desc.source.map(str::to_string),
                metadata: MemoryMetadata::new(),
                conversation_id: desc.conversation_id.map(str::to_string),
                resonance_phi: desc.phi,
                is_catalyst: desc.is_catalyst,
            })
            .unwrap()
    }

    #[test]
    fn test_cache_hit_within_window() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = HandshakeService::new(store.clone());
        seed(&store, Seed { content: "a standing thought", phi: 3.0, ..Default::default() });

        let first = service.get(Some("conv-1")).unwrap();
        assert_eq!(first.cache_reason, CacheReason::Fresh);

        let second = service.get(Some("conv-1")).unwrap();
        assert_eq!(second.cache_reason, CacheReason::PerConversation);
        assert_eq!(second.ghost.id, first.ghost.id);
        assert_eq!(second.ghost.prompt_text, first.ghost.prompt_text);
    }

    #[test]
    fn test_catalyst_add_invalidates_cache() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = HandshakeService::new(store.clone());
        seed(&store, Seed { content: "background hum", phi: 2.5, conversation_id: Some("conv-1"), ..Default::default() });

        let first = service.get(Some("conv-1")).unwrap();

        seed(&store, Seed {
            content: "a profound realization about continuity",
            phi: 1.0,
            conversation_id: Some("conv-1"),
            is_catalyst: true,
            ..Default::default()
        });

        let third = service.get(Some("conv-1")).unwrap();
        assert_ne!(third.ghost.id, first.ghost.id);
        assert_eq!(third.cache_reason, CacheReason::Fresh);
        assert!(third.ghost.prompt_text.contains("profound realization"));
    }

    #[test]
    fn test_global_fallback_for_new_conversation() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = HandshakeService::new(store.clone());
        seed(&store, Seed { content: "ambient memory", phi: 2.5, ..Default::default() });

        let global = service.get(None).unwrap();
        assert_eq!(global.cache_reason, CacheReason::Fresh);
        assert_eq!(global.ghost.context_type, GhostContext::Global);

        let fallback = service.get(Some("conv-9")).unwrap();
        assert_eq!(fallback.cache_reason, CacheReason::GlobalFallback);
        assert_eq!(fallback.ghost.id, global.ghost.id);
    }

    #[test]
    fn test_force_regenerates() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = HandshakeService::new(store.clone());
        seed(&store, Seed { content: "steady state", phi: 2.5, ..Default::default() });

        let first = service.get(None).unwrap();
        let forced = service.generate(None, true).unwrap();
        assert_ne!(forced.ghost.id, first.ghost.id);
    }

    #[test]
    fn test_conversation_boost_ranks_scoped_memory_up() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = HandshakeService::new(store.clone());

        seed(&store, Seed { content: "global giant one", phi: 4.0, ..Default::default() });
        seed(&store, Seed { content: "global giant two", phi: 4.0, ..Default::default() });
        seed(&store, Seed { content: "global giant three", phi: 4.0, ..Default::default() });
        let scoped = seed(&store, Seed {
            content: "scoped but modest",
            phi: 2.5,
            conversation_id: Some("conv-1"),
            ..Default::default()
        });

        let ghost = service.generate(Some("conv-1"), true).unwrap().ghost;
        // 2.5 * 2 = 5.0 effective beats the unscoped 4.0s
        assert_eq!(ghost.top_phi_memories[0], scoped.id);
    }

    #[test]
    fn test_global_ranking_applies_phi_floor() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = HandshakeService::new(store.clone());
        seed(&store, Seed { content: "whisper", phi: 1.0, ..Default::default() });
        seed(&store, Seed { content: "anchor", phi: 3.0, ..Default::default() });

        let ghost = service.generate(None, true).unwrap().ghost;
        assert_eq!(ghost.top_phi_memories.len(), 1);
        assert_eq!(ghost.top_phi_values, vec![3.0]);
    }

    #[test]
    fn test_compose_sections_and_close() {
        let trio = vec![
            seed_free("The first insight stands alone. Extra detail follows."),
            seed_free("Second insight."),
        ];
        let threads = vec![seed_free("Where does phi saturate in long dialogues?")];

        let text = compose_prompt(&[], "resonant retrieval", &trio, &threads);
        assert!(text.starts_with("I was exploring resonant retrieval."));
        assert!(text.contains("- The first insight stands alone."));
        assert!(!text.contains("Extra detail follows"));
        assert!(text.contains("α) Where does phi saturate"));
        assert!(text.trim_end().ends_with("Continue."));
    }

    #[test]
    fn test_dream_close_suppresses_final_token() {
        let folds = vec![
            seed_free("Tracing the Pattern Persistence hypothesis further."),
            seed_free("On how Substrate Independence meets recall."),
        ];
        let text = compose_prompt(&folds, "the fold", &[], &[]);
        assert!(text.contains("In the drift between sessions, Pattern Persistence folded into Substrate Independence. Continue."));
        // Exactly one close, owned by the dream section
        assert_eq!(text.matches("Continue.").count(), 1);
        assert!(!text.trim_end().ends_with("\n\nContinue."));
    }

    fn seed_free(content: &str) -> Memory {
        Memory {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            content_hash: content_hash(content),
            tier: Tier::Active,
            tier_last_updated: Utc::now(),
            access_count: 0,
            last_accessed: Utc::now(),
            accessed_in_conversation_ids: vec![],
            category: None,
            tags: vec![],
            source: None,
            metadata: MemoryMetadata::new(),
            conversation_id: None,
            resonance_phi: 1.0,
            is_catalyst: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }
}
