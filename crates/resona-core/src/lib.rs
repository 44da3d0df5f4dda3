//! # Resona Core
//!
//! Persistent associative memory engine for conversational agents.
//!
//! A client ingests text fragments ("memories") and retrieves them by
//! semantic similarity; on top of that the engine maintains:
//!
//! - **Resonance phi**: a per-memory importance scalar in [0, 5], grown
//!   by access and catalyst events, decayed by a guarded monthly sweep
//! - **Tier promotion**: deterministic lifecycle buckets
//!   (`active -> thread -> stable`, plus an externally seeded `network`
//!   tier) with an append-only audit trail
//! - **Associations**: a co-occurrence graph with log-dampened edge
//!   strength and explicit synthesis links
//! - **Semantic consolidation**: near-duplicates (cosine >= 0.95) merge
//!   into the older memory, archiving the newer as a variant
//! - **Handshake**: a cached first-person continuity snapshot composed
//!   from the highest-phi memories at conversation start
//! - **The Fold**: a harmonic synthesis engine that samples a
//!   Fundamental / Melody / Overtone triad, hands a prompt to an
//!   external generator, and gates the result on consonance
//!
//! Embedding generation and synthesis text generation live outside the
//! engine behind narrow ports; storage is SQLite plus an in-process
//! HNSW index.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use resona_core::{Resona, service::AddInput};
//!
//! let engine = Resona::open_local(None)?;
//! let added = engine.memory.add(AddInput {
//!     content: "Patterns persist across substrates.".into(),
//!     ..Default::default()
//! }).await?;
//!
//! let results = engine.memory.query(Default::default()).await?;
//! engine.shutdown().await;
//! ```
//!
//! ## Feature flags
//!
//! - `embeddings` (default): local fastembed provider
//!   (`nomic-embed-text-v1.5`, 768 dimensions)
//! - `bundled-sqlite` (default): compile SQLite in

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod associations;
pub mod config;
pub mod consolidation;
pub mod embeddings;
pub mod error;
pub mod fold;
pub mod handshake;
pub mod memory;
pub mod resonance;
pub mod search;
pub mod service;
pub mod storage;
pub mod tasks;
pub mod tier;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use associations::{AssociationEdge, AssociationEngine, MemoryHub};
pub use consolidation::{ConsolidationOutcome, SemanticConsolidation};
pub use embeddings::{
    EmbeddingCache, EmbeddingError, EmbeddingPort, EmbeddingProvider, Provenance,
    EMBEDDING_DIMENSIONS, cosine_similarity, harmonic_mean,
};
pub use error::{CoreError, Result};
pub use fold::{FoldAttempt, FoldEngine, FoldStored, SkipReason, SynthesisMethod, Triad};
pub use handshake::{CachedGhost, GhostContext, GhostLog, HandshakeService, Reflection};
pub use memory::{Memory, MemoryMetadata, Tier};
pub use resonance::{CatalystPatterns, ResonanceEngine, ResonanceStats};
pub use service::{
    AddInput, AddOutcome, BootstrapInput, BootstrapOutcome, MemoryService, QueryInput,
    QueryOutcome, ScoredMemory,
};
pub use storage::SqliteStore;
pub use tasks::{Supervisor, TaskHandle};
pub use tier::{TierEngine, TierPromotion, TierThresholds};

#[cfg(feature = "embeddings")]
pub use embeddings::LocalEmbedder;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// ENGINE WIRING
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;

/// The assembled engine: one store, one embedding port, one background
/// supervisor, and the services wired over them.
///
/// Construct from an async context (the supervisor spawns its worker on
/// the current tokio runtime) and tear down with [`Resona::shutdown`].
pub struct Resona {
    store: Arc<SqliteStore>,
    embedder: Arc<EmbeddingPort>,
    supervisor: Supervisor,
    /// Ingestion, retrieval, and bootstrap pipelines
    pub memory: MemoryService,
    /// Continuity snapshot composer
    pub handshake: HandshakeService,
    /// Harmonic synthesis
    pub fold: FoldEngine,
    /// Phi adjustment, catalyst detection, decay
    pub resonance: ResonanceEngine,
    /// Promotion and audit
    pub tiers: TierEngine,
    /// Co-occurrence graph
    pub associations: AssociationEngine,
    /// Near-duplicate merging
    pub consolidation: SemanticConsolidation,
}

impl Resona {
    /// Open the engine with an explicit embedding provider
    pub fn open(db_path: Option<PathBuf>, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(db_path)?);
        Self::assemble(store, Arc::new(EmbeddingPort::new(provider)))
    }

    /// Open a throwaway in-memory engine (tests, experiments)
    pub fn open_in_memory(provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let store = Arc::new(SqliteStore::open_in_memory()?);
        Self::assemble(store, Arc::new(EmbeddingPort::new(provider)))
    }

    /// Open with the local fastembed provider as primary
    #[cfg(feature = "embeddings")]
    #[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
    pub fn open_local(db_path: Option<PathBuf>) -> Result<Self> {
        Self::open(db_path, Arc::new(LocalEmbedder::new()))
    }

    /// Open with a fully custom embedding port (fallback provider,
    /// custom cache)
    pub fn open_with_port(db_path: Option<PathBuf>, port: EmbeddingPort) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(db_path)?);
        Self::assemble(store, Arc::new(port))
    }

    fn assemble(store: Arc<SqliteStore>, embedder: Arc<EmbeddingPort>) -> Result<Self> {
        let supervisor = Supervisor::default();
        let memory = MemoryService::new(store.clone(), embedder.clone(), supervisor.handle());
        let handshake = HandshakeService::new(store.clone());
        let fold = FoldEngine::new(store.clone(), embedder.clone());
        let resonance = ResonanceEngine::new(store.clone());
        let tiers = TierEngine::new(store.clone());
        let associations = AssociationEngine::new(store.clone());
        let consolidation = SemanticConsolidation::new(store.clone());

        Ok(Self {
            store,
            embedder,
            supervisor,
            memory,
            handshake,
            fold,
            resonance,
            tiers,
            associations,
            consolidation,
        })
    }

    /// The storage port
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// The embedding port (cache stats live here)
    pub fn embedder(&self) -> &Arc<EmbeddingPort> {
        &self.embedder
    }

    /// Drain queued background work and stop the supervisor
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AddInput, AddOutcome, BootstrapInput, CoreError, FoldAttempt, FoldStored, Memory,
        MemoryService, QueryInput, QueryOutcome, Resona, Result, Tier,
    };

    #[cfg(feature = "embeddings")]
    pub use crate::LocalEmbedder;
}
