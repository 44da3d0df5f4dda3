//! Engine tunables
//!
//! Process-wide adjustable parameters live in the `config` table and
//! are read through the storage port's typed getters, one read per
//! operation. This module is the single registry of key names and
//! defaults so engines and tests agree on both.

/// Config key names
pub mod keys {
    /// Similarity-band width for overtone sampling
    pub const DRIFT_APERTURE: &str = "drift_aperture";
    /// Consonance floor below which a synthesis is rejected
    pub const FOLD_MIN_CONSONANCE: &str = "fold_min_consonance";
    /// Similarity at which a synthesis evolves an existing memory
    pub const FOLD_EVOLUTION_THRESHOLD: &str = "fold_evolution_threshold";
    /// RFC3339 marker of the last decay sweep
    pub const DECAY_LAST_SWEEP: &str = "decay_last_sweep";
    /// Days of inactivity before a memory is decay-eligible
    pub const DECAY_INACTIVE_DAYS: &str = "decay_inactive_days";
    /// Minimum days between decay sweeps
    pub const DECAY_SWEEP_DAYS: &str = "decay_sweep_days";
}

/// Default values for the tunables
pub mod defaults {
    pub const DRIFT_APERTURE: f64 = 0.2;
    pub const DRIFT_MIN: f64 = 0.1;
    pub const DRIFT_MAX: f64 = 0.3;
    pub const FOLD_MIN_CONSONANCE: f64 = 0.40;
    pub const FOLD_EVOLUTION_THRESHOLD: f64 = 0.92;
    pub const DECAY_INACTIVE_DAYS: f64 = 30.0;
    pub const DECAY_SWEEP_DAYS: f64 = 30.0;
}
