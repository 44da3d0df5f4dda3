//! Tier engine
//!
//! Deterministic promotion from access-count thresholds, with an
//! append-only audit trail. Two threshold sets exist on purpose:
//!
//! - Canonical thresholds (3 / 10) apply when a single memory is
//!   checked directly via [`TierEngine::check_and_promote`].
//! - The retrieval hot path debounces with a stricter overlay (5 / 20)
//!   via [`TierEngine::promote_batch`], so one busy query burst does not
//!   promote half the result set.
//!
//! Promotion never chooses the `network` tier; that state is assigned
//! only by an explicit external [`TierEngine::update_tier`] call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::memory::{Memory, Tier};
use crate::storage::SqliteStore;

// ============================================================================
// THRESHOLDS
// ============================================================================

/// Canonical promotion thresholds
#[derive(Debug, Clone, Copy)]
pub struct TierThresholds {
    /// Accesses required for active -> thread
    pub active_to_thread: i64,
    /// Accesses required for thread -> stable
    pub thread_to_stable: i64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            active_to_thread: 3,
            thread_to_stable: 10,
        }
    }
}

/// Stricter overlay used when promoting inside the retrieval hot path
pub const RETRIEVAL_THRESHOLDS: TierThresholds = TierThresholds {
    active_to_thread: 5,
    thread_to_stable: 20,
};

// ============================================================================
// PROMOTION RECORD
// ============================================================================

/// Append-only promotion audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierPromotion {
    pub id: String,
    pub memory_id: String,
    pub from_tier: Tier,
    pub to_tier: Tier,
    pub reason: String,
    pub access_count_at_promotion: i64,
    pub days_since_last_access: f64,
    pub created_at: DateTime<Utc>,
}

impl TierPromotion {
    fn for_memory(memory: &Memory, to_tier: Tier, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            memory_id: memory.id.clone(),
            from_tier: memory.tier,
            to_tier,
            reason: reason.to_string(),
            access_count_at_promotion: memory.access_count,
            days_since_last_access: memory.days_since_access(now),
            created_at: now,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Tier promotion engine
#[derive(Clone)]
pub struct TierEngine {
    store: Arc<SqliteStore>,
    thresholds: TierThresholds,
}

impl TierEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            thresholds: TierThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: TierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// The tier a memory is due for under the given thresholds, if any.
    /// One rung per call; `stable` and `network` never move.
    fn eligible_promotion(
        memory: &Memory,
        thresholds: &TierThresholds,
    ) -> Option<Tier> {
        match memory.tier {
            Tier::Active if memory.access_count >= thresholds.active_to_thread => {
                Some(Tier::Thread)
            }
            Tier::Thread if memory.access_count >= thresholds.thread_to_stable => {
                Some(Tier::Stable)
            }
            _ => None,
        }
    }

    /// Check one memory against the canonical thresholds and promote it
    /// if due. Idempotent once the memory sits at its target tier.
    pub fn check_and_promote(&self, memory_id: &str) -> Result<Option<TierPromotion>> {
        let memory = self
            .store
            .get_live_memory(memory_id)?
            .ok_or_else(|| CoreError::MemoryNotFound(memory_id.to_string()))?;

        let Some(target) = Self::eligible_promotion(&memory, &self.thresholds) else {
            return Ok(None);
        };

        let promotion =
            TierPromotion::for_memory(&memory, target, "access_threshold", Utc::now());
        self.store.apply_promotions(std::slice::from_ref(&promotion))?;

        tracing::debug!(
            memory_id = %memory_id,
            from = %promotion.from_tier,
            to = %promotion.to_tier,
            "promoted memory"
        );
        Ok(Some(promotion))
    }

    /// Explicit tier assignment, transactional with its audit row.
    ///
    /// Regressions are rejected; `network` is accepted only here, as an
    /// external assignment. A no-op when the memory already sits at the
    /// target tier.
    pub fn update_tier(
        &self,
        memory_id: &str,
        to_tier: Tier,
        reason: &str,
    ) -> Result<(Memory, Option<TierPromotion>)> {
        let memory = self
            .store
            .get_live_memory(memory_id)?
            .ok_or_else(|| CoreError::MemoryNotFound(memory_id.to_string()))?;

        if memory.tier == to_tier {
            return Ok((memory, None));
        }
        if to_tier.rank() < memory.tier.rank() {
            return Err(CoreError::InvalidTier(format!(
                "cannot regress {} from {} to {}",
                memory_id, memory.tier, to_tier
            )));
        }

        let promotion = TierPromotion::for_memory(&memory, to_tier, reason, Utc::now());
        self.store.apply_promotions(std::slice::from_ref(&promotion))?;

        let updated = self
            .store
            .get_live_memory(memory_id)?
            .ok_or_else(|| CoreError::MemoryNotFound(memory_id.to_string()))?;
        Ok((updated, Some(promotion)))
    }

    /// Batched promotion for the retrieval path: one round trip for
    /// candidates at the overlay thresholds, one transaction for the
    /// updates and audits.
    pub fn promote_batch(&self, ids: &[String]) -> Result<Vec<TierPromotion>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let candidates = self.store.promotion_candidates(
            ids,
            RETRIEVAL_THRESHOLDS.active_to_thread,
            RETRIEVAL_THRESHOLDS.thread_to_stable,
        )?;
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let now = Utc::now();
        let promotions: Vec<TierPromotion> = candidates
            .iter()
            .filter_map(|memory| {
                Self::eligible_promotion(memory, &RETRIEVAL_THRESHOLDS)
                    .map(|target| TierPromotion::for_memory(memory, target, "access_threshold", now))
            })
            .collect();

        self.store.apply_promotions(&promotions)?;
        Ok(promotions)
    }

    /// Audit rows for a memory, oldest first
    pub fn promotion_history(&self, memory_id: &str) -> Result<Vec<TierPromotion>> {
        self.store.promotions_for(memory_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
