//! Resonance engine
//!
//! Phi adjustment, catalyst detection, and the decay sweep. Phi only
//! grows under access; the sweep is the single sanctioned way down, and
//! it runs at most once per sweep window (a config marker guards
//! against compounding ad-hoc invocations).

use std::sync::Arc;

use chrono::{Duration, Utc};
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::config::{defaults, keys};
use crate::error::{CoreError, Result};
use crate::memory::{Memory, Tier};
use crate::storage::SqliteStore;

// ============================================================================
// CATALYST PATTERN REGISTRY
// ============================================================================

/// Default content patterns that mark breakthrough material
pub const DEFAULT_CATALYST_PATTERNS: &[&str] = &[
    r"(?i)breakthrough",
    r"(?i)insight",
    r"(?i)realized",
    r"(?i)profound",
    r"(?i)paradigm shift",
    r"(?i)eureka",
];

/// Named registry of catalyst content patterns
#[derive(Clone)]
pub struct CatalystPatterns {
    set: RegexSet,
}

impl Default for CatalystPatterns {
    fn default() -> Self {
        Self::from_patterns(DEFAULT_CATALYST_PATTERNS)
            .expect("default catalyst patterns are valid")
    }
}

impl CatalystPatterns {
    /// Build a registry from raw patterns
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = RegexSet::new(patterns)
            .map_err(|e| CoreError::InvalidInput(format!("bad catalyst pattern: {}", e)))?;
        Ok(Self { set })
    }

    /// Whether any pattern matches the content
    pub fn matches(&self, content: &str) -> bool {
        self.set.is_match(content)
    }
}

// ============================================================================
// STATS
// ============================================================================

/// Aggregate resonance statistics over live memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResonanceStats {
    pub total_memories: i64,
    pub catalyst_count: i64,
    pub average_phi: f64,
    pub max_phi: f64,
    pub by_tier: std::collections::HashMap<Tier, i64>,
}

/// Outcome of a decay sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecaySweep {
    /// Whether the sweep actually ran (false inside the guard window)
    pub swept: bool,
    /// Memories decayed
    pub count: usize,
    /// Total phi removed
    pub total_delta: f64,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Rapid-access burst window for catalyst detection
const BURST_WINDOW_MINUTES: i64 = 10;

/// Accesses within the burst window that signal a catalyst
const BURST_THRESHOLD: i64 = 3;

/// Incident associations that signal a catalyst
const CONNECTIVITY_THRESHOLD: i64 = 5;

/// Access-log retention
const ACCESS_LOG_RETENTION_HOURS: i64 = 24;

/// Phi floor below which decay does not touch a memory
const DECAY_PHI_FLOOR: f64 = 0.5;

/// Resonance engine
#[derive(Clone)]
pub struct ResonanceEngine {
    store: Arc<SqliteStore>,
    patterns: CatalystPatterns,
}

impl ResonanceEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            patterns: CatalystPatterns::default(),
        }
    }

    pub fn with_patterns(mut self, patterns: CatalystPatterns) -> Self {
        self.patterns = patterns;
        self
    }

    /// Adjust phi for one access: +1.0 for a catalyst event, +0.1
    /// otherwise, clamped at 5.0. Sets the catalyst flag when requested,
    /// touches `last_accessed`, and appends to the access log.
    /// Returns `(new_phi, capped)`.
    pub fn adjust(&self, memory_id: &str, is_catalyst: bool) -> Result<(f64, bool)> {
        self.store.adjust_resonance(memory_id, is_catalyst)
    }

    /// Catalyst-potential heuristics: a rapid access burst, dense
    /// connectivity, or breakthrough content. Returns the verdict and
    /// the reasons that fired.
    pub fn detect_potential_catalyst(&self, memory_id: &str) -> Result<(bool, Vec<String>)> {
        let memory = self
            .store
            .get_live_memory(memory_id)?
            .ok_or_else(|| CoreError::MemoryNotFound(memory_id.to_string()))?;

        let mut reasons = Vec::new();

        let since = Utc::now() - Duration::minutes(BURST_WINDOW_MINUTES);
        if self.store.recent_access_count(memory_id, since)? >= BURST_THRESHOLD {
            reasons.push("rapid_access".to_string());
        }

        if self.store.association_degree(memory_id)? >= CONNECTIVITY_THRESHOLD {
            reasons.push("high_connectivity".to_string());
        }

        if self.patterns.matches(&memory.content) {
            reasons.push("content_pattern".to_string());
        }

        Ok((!reasons.is_empty(), reasons))
    }

    /// Monthly decay sweep: 5% phi reduction for live memories inactive
    /// past the cutoff with phi above the floor.
    ///
    /// Scheduled semantics: a `decay_last_sweep` marker makes repeat
    /// calls inside the sweep window no-ops, so decay cannot compound
    /// from ad-hoc invocation.
    pub fn apply_decay(&self) -> Result<DecaySweep> {
        let now = Utc::now();

        let sweep_days = self
            .store
            .get_config_number(keys::DECAY_SWEEP_DAYS, defaults::DECAY_SWEEP_DAYS)?;
        if let Some(marker) = self.store.get_config_text(keys::DECAY_LAST_SWEEP)? {
            if let Ok(last) = chrono::DateTime::parse_from_rfc3339(&marker) {
                let elapsed_days = (now - last.with_timezone(&Utc)).num_seconds() as f64 / 86_400.0;
                if elapsed_days < sweep_days {
                    tracing::debug!(elapsed_days, "decay sweep skipped inside guard window");
                    return Ok(DecaySweep {
                        swept: false,
                        count: 0,
                        total_delta: 0.0,
                    });
                }
            }
        }

        let inactive_days = self
            .store
            .get_config_number(keys::DECAY_INACTIVE_DAYS, defaults::DECAY_INACTIVE_DAYS)?;
        let cutoff = now - Duration::seconds((inactive_days * 86_400.0) as i64);

        let (count, total_delta) = self.store.decay_sweep(cutoff, DECAY_PHI_FLOOR)?;
        self.store
            .set_config_text(keys::DECAY_LAST_SWEEP, &now.to_rfc3339())?;

        tracing::info!(count, total_delta, "decay sweep applied");
        Ok(DecaySweep {
            swept: true,
            count,
            total_delta,
        })
    }

    /// Highest-phi catalysts
    pub fn top_catalysts(&self, limit: i64) -> Result<Vec<Memory>> {
        self.store.top_catalysts(limit)
    }

    /// Aggregate statistics
    pub fn stats(&self) -> Result<ResonanceStats> {
        self.store.resonance_stats()
    }

    /// Trim access-log entries past the retention window
    pub fn cleanup_access_log(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::hours(ACCESS_LOG_RETENTION_HOURS);
        self.store.cleanup_access_log(cutoff)
    }
}

// ============================================================================
// TESTS
// ============================================================================
