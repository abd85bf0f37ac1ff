//! Human-in-the-loop protocol
//!
//! Decides whether, when and how often a detected pattern turns into a
//! question for the user, and drives each question through
//! `PENDING -> SCHEDULED -> DELIVERED -> ANSWERED` (or `EXPIRED` /
//! `SUPPRESSED`). Terminal states are never left.

mod formulator;
mod protocol;
mod timing;

use thiserror::Error;

use crate::bus::BusError;
use crate::preference::LearnError;
use crate::retry::{Elapsed, Transient};
use crate::store::StoreError;
use crate::types::QuestionStatus;

pub use formulator::{QuestionFormulator, TemplateFormulator};
pub use protocol::{DeliveryReport, HitlProtocol};
pub use timing::FocusMarker;

/// Protocol errors
#[derive(Debug, Error)]
pub enum HitlError {
    #[error(
        "pattern {pattern_id} lacks evidence: {evidence_count} of {required} sightings, confidence {confidence:.2}"
    )]
    InsufficientEvidence {
        pattern_id: String,
        evidence_count: u32,
        required: u32,
        confidence: f64,
    },

    #[error("pattern {pattern_id} suppressed: {reason}")]
    DuplicateSuppressed { pattern_id: String, reason: String },

    /// The question was persisted as SUPPRESSED
    #[error("question {question_id} rate limited ({delivered} delivered + {scheduled} scheduled, cap {cap})")]
    RateLimited {
        question_id: String,
        delivered: u32,
        scheduled: u32,
        cap: u32,
    },

    #[error("question {question_id} cannot move from {from} to {to}")]
    InvalidTransition {
        question_id: String,
        from: QuestionStatus,
        to: QuestionStatus,
    },

    #[error("question {0} not found")]
    NotFound(String),

    #[error("decision timed out: {0}")]
    Timeout(Elapsed),

    #[error("invalid policy configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Learn(#[from] LearnError),
}

impl HitlError {
    pub(crate) fn config(e: anyhow::Error) -> Self {
        HitlError::Config(format!("{:#}", e))
    }

    /// Suppression and rate limiting are expected outcomes, not failures
    pub fn is_policy_outcome(&self) -> bool {
        matches!(
            self,
            HitlError::InsufficientEvidence { .. }
                | HitlError::DuplicateSuppressed { .. }
                | HitlError::RateLimited { .. }
        )
    }
}

impl From<Elapsed> for HitlError {
    fn from(e: Elapsed) -> Self {
        HitlError::Timeout(e)
    }
}

impl Transient for HitlError {
    fn is_transient(&self) -> bool {
        match self {
            HitlError::Timeout(_) => true,
            HitlError::Store(e) => e.is_transient(),
            HitlError::Bus(e) => e.is_transient(),
            HitlError::Learn(e) => e.is_transient(),
            _ => false,
        }
    }
}
