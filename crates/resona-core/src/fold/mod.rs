//! Fold engine (resonant synthesis)
//!
//! Composes a new memory from a strategically sampled triad:
//!
//! - **Fundamental** - the highest-phi memory in the `network` tier
//! - **Melody** - the memory maximising `phi * days_stale` (phi > 1)
//! - **Overtone** - a phi-ranked memory whose similarity to the
//!   reference falls inside the drift-aperture band
//!
//! Synthesis is two-phase: [`FoldEngine::perform`] returns a prompt and
//! the triad; the text generator lives outside the engine, and
//! [`FoldEngine::store_synthesis`] later accepts the generated text,
//! gates it on consonance (harmonic mean of triad similarities), and
//! either evolves a near-identical live memory or creates a new one,
//! weaving synthesis links either way.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::associations::AssociationEngine;
use crate::config::{defaults, keys};
use crate::embeddings::{EmbeddingPort, content_hash, cosine_similarity, harmonic_mean};
use crate::error::{CoreError, Result};
use crate::memory::{EvolutionEntry, FoldProvenance, Memory, MemoryMetadata, Tier};
use crate::storage::{NewMemory, SqliteStore};

/// Width of the similarity band below its aperture-derived ceiling
const BAND_WIDTH: f64 = 0.05;

/// Candidate pool cap for overtone sampling
const OVERTONE_POOL: usize = 256;

/// Phi ceiling for a freshly created synthesis
const CREATED_PHI_CAP: f64 = 3.0;

/// Category and source stamped on fold products
pub const FOLD_CATEGORY: &str = "the_fold";
pub const FOLD_SOURCE: &str = "autonomous_synthesis";

// ============================================================================
// TYPES
// ============================================================================

/// How the triad reference was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMethod {
    /// Reference is the Fundamental's own embedding
    Rem,
    /// Reference is an externally supplied query embedding
    ActivePulse,
}

impl SynthesisMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisMethod::Rem => "rem",
            SynthesisMethod::ActivePulse => "active_pulse",
        }
    }
}

/// One member of a triad
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriadMember {
    pub id: String,
    pub content: String,
    pub phi: f64,
}

impl TriadMember {
    fn from_memory(memory: &Memory) -> Self {
        Self {
            id: memory.id.clone(),
            content: memory.content.clone(),
            phi: memory.resonance_phi,
        }
    }
}

/// A sampled triad
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Triad {
    pub fundamental: TriadMember,
    pub melody: TriadMember,
    pub overtone: TriadMember,
    pub method: SynthesisMethod,
}

impl Triad {
    fn member_ids(&self) -> [&str; 3] {
        [
            self.fundamental.id.as_str(),
            self.melody.id.as_str(),
            self.overtone.id.as_str(),
        ]
    }
}

/// Why a fold was skipped; an expected outcome, not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    NoFundamental,
    NoMelody,
    NoOvertone,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoFundamental => "NO_FUNDAMENTAL",
            SkipReason::NoMelody => "NO_MELODY",
            SkipReason::NoOvertone => "NO_OVERTONE",
        }
    }
}

/// Outcome of the sampling phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FoldAttempt {
    /// A triad was sampled; the caller takes the prompt to a generator
    Ready { prompt: String, triad: Triad },
    /// Sampling came up empty
    Skipped { reason: SkipReason },
}

/// Outcome of storing a synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FoldStored {
    /// The synthesis passed the consonance gate and was persisted
    Stored {
        memory: Memory,
        consonance: f64,
        /// True when an existing memory evolved instead of a new row
        evolved: bool,
    },
    /// Consonance fell at or below the floor; nothing was persisted
    Rejected {
        consonance: f64,
        threshold: f64,
        synthesis_text: String,
    },
}

// ============================================================================
// ENGINE
// ============================================================================

/// Resonant synthesis engine
#[derive(Clone)]
pub struct FoldEngine {
    store: Arc<SqliteStore>,
    embedder: Arc<EmbeddingPort>,
    associations: AssociationEngine,
}

impl FoldEngine {
    pub fn new(store: Arc<SqliteStore>, embedder: Arc<EmbeddingPort>) -> Self {
        let associations = AssociationEngine::new(store.clone());
        Self {
            store,
            embedder,
            associations,
        }
    }

    // ========================================================================
    // DRIFT APERTURE
    // ========================================================================

    /// Current drift aperture, clamped to its legal range
    pub fn drift(&self) -> Result<f64> {
        let raw = self
            .store
            .get_config_number(keys::DRIFT_APERTURE, defaults::DRIFT_APERTURE)?;
        Ok(raw.clamp(defaults::DRIFT_MIN, defaults::DRIFT_MAX))
    }

    /// Validate and persist a new drift aperture
    pub fn set_drift(&self, value: f64) -> Result<()> {
        if !(defaults::DRIFT_MIN..=defaults::DRIFT_MAX).contains(&value) {
            return Err(CoreError::InvalidInput(format!(
                "drift aperture {} outside [{}, {}]",
                value,
                defaults::DRIFT_MIN,
                defaults::DRIFT_MAX
            )));
        }
        self.store.set_config_number(keys::DRIFT_APERTURE, value)
    }

    // ========================================================================
    // PHASE ONE: SAMPLING
    // ========================================================================

    /// Sample a triad and build the synthesis prompt.
    ///
    /// With a user query the engine runs in active-pulse mode and the
    /// overtone band is centred on the query embedding; without one it
    /// runs in REM mode against the Fundamental's own embedding.
    pub fn perform(&self, user_query: Option<&str>) -> Result<FoldAttempt> {
        let Some(fundamental) = self.store.top_network_memory()? else {
            return Ok(FoldAttempt::Skipped {
                reason: SkipReason::NoFundamental,
            });
        };

        let Some(melody) = self
            .store
            .max_staleness_memory(&[fundamental.id.clone()])?
        else {
            return Ok(FoldAttempt::Skipped {
                reason: SkipReason::NoMelody,
            });
        };

        let (reference, method) = match user_query {
            Some(query) => (
                self.embedder.embed(query)?.vector,
                SynthesisMethod::ActivePulse,
            ),
            None => {
                let embedding = self
                    .store
                    .get_embedding(&fundamental.id)?
                    .ok_or_else(|| CoreError::MemoryNotFound(fundamental.id.clone()))?;
                (embedding, SynthesisMethod::Rem)
            }
        };

        let aperture = self.drift()?;
        let sim_max = (1.05 - aperture) as f32;
        let sim_min = sim_max - BAND_WIDTH as f32;

        let exclude = vec![fundamental.id.clone(), melody.id.clone()];
        let candidates = self.store.overtone_candidates(&exclude, OVERTONE_POOL)?;
        // Candidates arrive phi-ranked; the first one inside the band wins
        let overtone = candidates.into_iter().find_map(|(memory, embedding)| {
            let similarity = cosine_similarity(&reference, &embedding);
            (similarity >= sim_min && similarity <= sim_max).then_some(memory)
        });
        let Some(overtone) = overtone else {
            return Ok(FoldAttempt::Skipped {
                reason: SkipReason::NoOvertone,
            });
        };

        let triad = Triad {
            fundamental: TriadMember::from_memory(&fundamental),
            melody: TriadMember::from_memory(&melody),
            overtone: TriadMember::from_memory(&overtone),
            method,
        };
        let prompt = build_prompt(&triad);

        tracing::debug!(
            fundamental = %triad.fundamental.id,
            melody = %triad.melody.id,
            overtone = %triad.overtone.id,
            method = method.as_str(),
            aperture,
            "fold triad sampled"
        );
        Ok(FoldAttempt::Ready { prompt, triad })
    }

    // ========================================================================
    // PHASE TWO: STORE
    // ========================================================================

    /// Gate a generated synthesis on consonance and persist it.
    ///
    /// Consonance is the harmonic mean of the similarities between the
    /// synthesis embedding and each triad member; at or below the floor
    /// the synthesis is rejected without side effects. Above it, a live
    /// memory within the evolution threshold evolves in place,
    /// otherwise a new fold memory is created. Both paths weave
    /// synthesis links back to the triad.
    pub fn store_synthesis(&self, synthesis_text: &str, triad: &Triad) -> Result<FoldStored> {
        let text = synthesis_text.trim();
        if text.is_empty() {
            return Err(CoreError::InvalidInput("empty synthesis text".into()));
        }

        let synth_embedding = self.embedder.embed(text)?.vector;

        let mut similarities = Vec::with_capacity(3);
        for member_id in triad.member_ids() {
            if let Some(embedding) = self.store.get_embedding(member_id)? {
                similarities.push(cosine_similarity(&synth_embedding, &embedding));
            }
        }
        if similarities.is_empty() {
            return Err(CoreError::InvalidInput(
                "no triad member embeddings available".into(),
            ));
        }

        let Some(consonance) = harmonic_mean(&similarities).map(f64::from) else {
            // All similarities were non-positive: maximal dissonance
            return Ok(FoldStored::Rejected {
                consonance: 0.0,
                threshold: self
                    .store
                    .get_config_number(keys::FOLD_MIN_CONSONANCE, defaults::FOLD_MIN_CONSONANCE)?,
                synthesis_text: text.to_string(),
            });
        };

        let threshold = self
            .store
            .get_config_number(keys::FOLD_MIN_CONSONANCE, defaults::FOLD_MIN_CONSONANCE)?;
        if consonance <= threshold {
            tracing::info!(consonance, threshold, "fold rejected: consonance too low");
            return Ok(FoldStored::Rejected {
                consonance,
                threshold,
                synthesis_text: text.to_string(),
            });
        }

        let evolution_threshold = self.store.get_config_number(
            keys::FOLD_EVOLUTION_THRESHOLD,
            defaults::FOLD_EVOLUTION_THRESHOLD,
        )?;
        let existing = self
            .store
            .similar_memories(&synth_embedding, 1, evolution_threshold as f32, None, None)?
            .into_iter()
            .next();

        let aperture = self.drift()?;
        let context = format!("fold:{}", triad.method.as_str());

        let (memory, evolved) = match existing {
            Some((existing, similarity)) => {
                let phi_delta = consonance * similarity as f64 * 5.0;
                let entry = EvolutionEntry {
                    previous_content: existing.content.clone(),
                    evolved_at: Utc::now(),
                    consonance,
                    similarity: similarity as f64,
                    phi_delta,
                };
                let evolved = self.store.evolve_memory(
                    &existing.id,
                    text,
                    &content_hash(text),
                    &synth_embedding,
                    phi_delta,
                    entry,
                )?;
                (evolved, true)
            }
            None => {
                let mut metadata = MemoryMetadata::new();
                metadata.fold = Some(FoldProvenance {
                    triad_ids: triad.member_ids().iter().map(|s| s.to_string()).collect(),
                    source_phis: vec![
                        triad.fundamental.phi,
                        triad.melody.phi,
                        triad.overtone.phi,
                    ],
                    consonance,
                    synthesis_method: triad.method.as_str().to_string(),
                    drift_aperture: aperture,
                });

                let created = self.store.insert_memory(NewMemory {
                    id: Uuid::new_v4().to_string(),
                    content: text.to_string(),
                    content_hash: content_hash(text),
                    embedding: synth_embedding,
                    tier: Tier::Active,
                    category: Some(FOLD_CATEGORY.to_string()),
                    tags: vec![],
                    source: Some(FOLD_SOURCE.to_string()),
                    metadata,
                    conversation_id: None,
                    resonance_phi: (consonance * 5.0).min(CREATED_PHI_CAP),
                    is_catalyst: false,
                })?;
                (created, false)
            }
        };

        let ancestors: Vec<String> = triad.member_ids().iter().map(|s| s.to_string()).collect();
        self.associations
            .weave_synthesis_links(&memory.id, &ancestors, &context)?;

        tracing::info!(
            memory_id = %memory.id,
            consonance,
            evolved,
            "fold synthesis stored"
        );
        Ok(FoldStored::Stored {
            memory,
            consonance,
            evolved,
        })
    }

    /// Fold products, newest first
    pub fn history(&self, limit: i64) -> Result<Vec<Memory>> {
        self.store.fold_history(limit)
    }
}

/// Generator-agnostic prompt from the triad contents and phi values
fn build_prompt(triad: &Triad) -> String {
    format!(
        "Three memories resonate together.\n\n\
         Fundamental (phi {:.2}):\n{}\n\n\
         Melody (phi {:.2}):\n{}\n\n\
         Overtone (phi {:.2}):\n{}\n\n\
         Compose one new insight that holds all three in tension. \
         One or two sentences, first person, present tense.",
        triad.fundamental.phi,
        triad.fundamental.content,
        triad.melody.phi,
        triad.melody.content,
        triad.overtone.phi,
        triad.overtone.content,
    )
}

// ============================================================================
// TESTS
// ============================================================================
