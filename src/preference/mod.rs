//! Preference learning
//!
//! Keeps per-user acceptance statistics along five independent dimensions
//! (question type, time of day, day of week, topic, keywords) and turns
//! them into an ask/don't-ask recommendation. The confidence threshold is
//! recalibrated multiplicatively once per window of observations.

mod engine;
pub mod features;
pub mod profile;

use thiserror::Error;

use crate::retry::{Elapsed, Transient};
use crate::store::StoreError;

pub use engine::{score, DimensionScore, Insights, PreferenceEngine, Recommendation};
pub use features::Features;
pub use profile::{Dimension, DimensionStats, PreferenceProfile, TimeBucket};

/// Learning errors
#[derive(Debug, Error)]
pub enum LearnError {
    #[error("not enough data for {user_id}: {observations} of {required} observations")]
    InsufficientData {
        user_id: String,
        observations: u64,
        required: u64,
    },

    #[error("learning update timed out: {0}")]
    Timeout(Elapsed),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<Elapsed> for LearnError {
    fn from(e: Elapsed) -> Self {
        LearnError::Timeout(e)
    }
}

impl Transient for LearnError {
    fn is_transient(&self) -> bool {
        match self {
            LearnError::Timeout(_) => true,
            LearnError::Store(e) => e.is_transient(),
            LearnError::InsufficientData { .. } => false,
        }
    }
}
