//! Memory record - the fundamental unit of storage
//!
//! Each memory carries:
//! - Content and its deterministic hash (exact dedup identity)
//! - Resonance phi in [0, 5] and the catalyst flag
//! - A lifecycle tier that promotes monotonically
//! - Access trace (count, last access, conversation scopes)
//! - Typed metadata: archived semantic variants and evolution history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Upper bound for resonance phi
pub const PHI_MAX: f64 = 5.0;

/// Maximum content length in codepoints
pub const MAX_CONTENT_LENGTH: usize = 50_000;

/// Current metadata schema version
const METADATA_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// TIERS
// ============================================================================

/// Lifecycle tier of a memory.
///
/// Promotion is monotone under engine operation: `active → thread →
/// stable`. `network` is reserved for externally-assigned background
/// items and is never chosen by the promotion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Recently created, ranked by recency
    #[default]
    Active,
    /// Frequently used within conversations
    Thread,
    /// Established long-term memory
    Stable,
    /// Background item seeded from outside the engine
    Network,
}

impl Tier {
    /// String form used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Active => "active",
            Tier::Thread => "thread",
            Tier::Stable => "stable",
            Tier::Network => "network",
        }
    }

    /// Promotion rank; `network` sits outside the promotion ladder
    pub fn rank(&self) -> u8 {
        match self {
            Tier::Active => 0,
            Tier::Thread => 1,
            Tier::Stable => 2,
            Tier::Network => 3,
        }
    }

    /// The next tier on the promotion ladder, if any
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Active => Some(Tier::Thread),
            Tier::Thread => Some(Tier::Stable),
            Tier::Stable | Tier::Network => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Tier::Active),
            "thread" => Ok(Tier::Thread),
            "stable" => Ok(Tier::Stable),
            "network" => Ok(Tier::Network),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

// ============================================================================
// TYPED METADATA
// ============================================================================

/// A near-duplicate absorbed by semantic consolidation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SemanticVariant {
    /// The absorbed content
    pub content: String,
    /// When the merge happened
    pub merged_at: DateTime<Utc>,
    /// Phi contributed to the surviving memory
    pub phi_contributed: f64,
    /// Cosine similarity at merge time
    pub similarity: f64,
    /// Whether the absorbed variant was flagged catalyst
    pub was_catalyst: bool,
}

/// One step in a fold-evolved memory's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionEntry {
    /// Content before this evolution
    pub previous_content: String,
    /// When the evolution happened
    pub evolved_at: DateTime<Utc>,
    /// Consonance of the synthesis that evolved it
    pub consonance: f64,
    /// Similarity between synthesis and the previous embedding
    pub similarity: f64,
    /// Phi added by this evolution
    pub phi_delta: f64,
}

/// Provenance attached to fold-created memories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoldProvenance {
    /// Ids of the triad members the synthesis was composed from
    pub triad_ids: Vec<String>,
    /// Phi values of the triad at synthesis time
    pub source_phis: Vec<f64>,
    /// Consonance of the synthesis
    pub consonance: f64,
    /// Synthesis method label
    pub synthesis_method: String,
    /// Drift aperture in effect when the overtone was sampled
    pub drift_aperture: f64,
}

/// Structured memory metadata.
///
/// Persisted as JSON; in memory it is typed, with a schema version so
/// older persisted shapes can be migrated on read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetadata {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semantic_variants: Vec<SemanticVariant>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evolution_history: Vec<EvolutionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fold: Option<FoldProvenance>,
    /// Free-form keys carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MemoryMetadata {
    /// Empty metadata at the current schema version
    pub fn new() -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            ..Default::default()
        }
    }

    /// Parse persisted JSON, migrating older shapes.
    ///
    /// Version 0 (no `schemaVersion` key) stored variants and history
    /// under the same keys but without the version marker; migration
    /// just stamps the current version. Unknown keys are preserved in
    /// `extra` either way.
    pub fn from_json(raw: &str) -> Self {
        let mut parsed: MemoryMetadata = serde_json::from_str(raw).unwrap_or_default();
        if parsed.schema_version < METADATA_SCHEMA_VERSION {
            parsed.schema_version = METADATA_SCHEMA_VERSION;
        }
        parsed
    }

    /// Serialize for persistence
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// A memory row.
///
/// The embedding is not carried here; it lives in the store (BLOB plus
/// the HNSW index) and is fetched only by the paths that need it.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// The text content
    pub content: String,
    /// SHA-256 hex digest of content; unique among live memories
    pub content_hash: String,
    /// Lifecycle tier
    pub tier: Tier,
    /// When the tier last changed
    pub tier_last_updated: DateTime<Utc>,
    /// Number of retrieval accesses
    pub access_count: i64,
    /// Last access timestamp
    pub last_accessed: DateTime<Utc>,
    /// Conversations this memory surfaced in (append-only)
    pub accessed_in_conversation_ids: Vec<String>,
    /// Optional category label
    pub category: Option<String>,
    /// Tags
    pub tags: Vec<String>,
    /// Provenance of the content
    pub source: Option<String>,
    /// Typed metadata (variants, evolution history, fold provenance)
    pub metadata: MemoryMetadata,
    /// Conversation scope; `None` = global
    pub conversation_id: Option<String>,
    /// Resonance phi in [0, 5]
    pub resonance_phi: f64,
    /// Catalyst flag; monotone once set
    pub is_catalyst: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// Soft-delete timestamp
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Whether the memory is live (not soft-deleted)
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Days since this memory was last accessed, relative to `now`
    pub fn days_since_access(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_accessed).num_seconds().max(0) as f64 / 86_400.0
    }
}

// ============================================================================
// TESTS
// ============================================================================
