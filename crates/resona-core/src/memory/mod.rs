//! Memory module - core types and data structures
//!
//! The unit of storage is the [`Memory`]: content plus its resonance
//! state (phi, tier, catalyst flag, access trace) and typed metadata
//! for archived variants and evolution history.

mod record;

pub use record::{
    EvolutionEntry, FoldProvenance, MAX_CONTENT_LENGTH, Memory, MemoryMetadata, PHI_MAX,
    SemanticVariant, Tier,
};
