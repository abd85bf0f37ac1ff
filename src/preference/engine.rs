//! Learning engine: folds responses into profiles and scores prospective questions

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::features::Features;
use super::profile::{ContextSample, Dimension, DimensionStats, Observation, PreferenceProfile};
use super::LearnError;
use crate::clock::SharedClock;
use crate::config::{LearningConfig, SharedConfig};
use crate::retry::RetryPolicy;
use crate::store::{ResponseRecord, Store, StoreError};

/// Contribution of one dimension value to a recommendation
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionScore {
    pub dimension: Dimension,
    pub key: String,
    /// Decided answers (YES + NO) behind this value
    pub samples: u32,
    /// Smoothed acceptance rate
    pub rate: f64,
    pub weight: f64,
}

/// Whether to interrupt the user, and why
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub should_ask: bool,
    pub confidence: f64,
    pub threshold: f64,
    pub explanation: Vec<DimensionScore>,
    /// `1 - later_rate` for the time bucket; 1.0 without data
    pub timing_quality: f64,
    /// No history in any dimension
    pub cold_start: bool,
}

/// Summary of what has been learned about a user
#[derive(Debug, Clone, PartialEq)]
pub struct Insights {
    pub user_id: String,
    pub best_time_bucket: Option<String>,
    pub best_day: Option<String>,
    pub confidence_threshold: f64,
    pub evidence_threshold: u32,
    pub later_rate: f64,
    pub observations: u64,
}

/// Score a prospective question against a (possibly missing) profile
pub fn score(
    profile: Option<&PreferenceProfile>,
    features: &Features,
    config: &LearningConfig,
) -> Recommendation {
    let threshold = profile
        .map(|p| p.confidence_threshold)
        .unwrap_or_else(|| config.clamp_threshold(config.initial_confidence_threshold));
    let k = config.smoothing.max(f64::EPSILON);
    let prior = config.prior_acceptance.clamp(0.0, 1.0);

    let mut explanation = Vec::new();
    let (mut weighted, mut total_weight) = (0.0, 0.0);
    if let Some(profile) = profile {
        for (dimension, key) in features.dimension_keys() {
            let stats = profile.stats(dimension, &key);
            let n = stats.decided() as f64;
            if n == 0.0 {
                continue;
            }
            let rate = (stats.yes as f64 + k * prior) / (n + k);
            let weight = n / (n + k);
            weighted += rate * weight;
            total_weight += weight;
            explanation.push(DimensionScore {
                dimension,
                key,
                samples: stats.decided(),
                rate,
                weight,
            });
        }
    }

    let timing_quality = profile
        .and_then(|p| p.stats(Dimension::TimeBucket, features.time_bucket().as_str()).later_rate())
        .map(|later| 1.0 - later)
        .unwrap_or(1.0);

    if total_weight == 0.0 {
        return Recommendation {
            should_ask: true,
            confidence: config.cold_start_confidence,
            threshold,
            explanation,
            timing_quality,
            cold_start: true,
        };
    }

    let history = weighted / total_weight;
    let pattern_weight = config.pattern_weight.clamp(0.0, 1.0);
    let confidence = ((1.0 - pattern_weight) * history
        + pattern_weight * features.pattern_confidence.clamp(0.0, 1.0))
    .clamp(0.0, 1.0);

    Recommendation {
        should_ask: confidence >= threshold,
        confidence,
        threshold,
        explanation,
        timing_quality,
        cold_start: false,
    }
}

/// Preference learning over the store's responses and profiles
pub struct PreferenceEngine {
    store: Arc<Store>,
    config: SharedConfig,
    clock: SharedClock,
}

impl PreferenceEngine {
    pub fn new(store: Arc<Store>, config: SharedConfig, clock: SharedClock) -> Self {
        Self { store, config, clock }
    }

    async fn budget(&self) -> (RetryPolicy, Duration) {
        let config = self.config.read().await;
        (
            RetryPolicy::new(
                config.runtime.max_attempts,
                Duration::from_millis(config.runtime.retry_base_ms),
            ),
            Duration::from_millis(config.runtime.operation_budget_ms),
        )
    }

    /// Fold a recorded response into its user's profile.
    ///
    /// Already learned responses are skipped, so redelivery is harmless.
    pub async fn observe(&self, response: &ResponseRecord) -> Result<(), LearnError> {
        let (policy, budget) = self.budget().await;
        policy
            .run_with_budget("observe response", budget, || self.observe_once(response))
            .await
    }

    async fn observe_once(&self, response: &ResponseRecord) -> Result<(), LearnError> {
        let question = self
            .store
            .get_question(&response.question_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("question {}", response.question_id)))?;
        let learning = self.config.read().await.learning.clone();
        let now = self.clock.now();

        let observation = Observation {
            answer: response.answer,
            sample: ContextSample {
                question_type: question.question_type,
                topic: question.topic.clone(),
                hour: response.context.hour,
                weekday: response.context.weekday,
                keywords: response.context.keyword_hits.clone(),
                responded_at: response.responded_at,
            },
        };

        let updated = self
            .store
            .apply_observation(&question.user_id, &response.response_id, |existing| {
                let mut profile = existing
                    .unwrap_or_else(|| PreferenceProfile::new(&question.user_id, &learning, now));
                profile.observe(&observation, &learning, now);
                profile
            })
            .await?;

        match updated {
            Some(profile) if profile.observations % learning.window() as u64 == 0 => {
                info!(
                    "Recalibrated {} after {} observations: threshold {:.3}, evidence {}",
                    profile.user_id,
                    profile.observations,
                    profile.confidence_threshold,
                    profile.evidence_threshold
                );
            }
            Some(profile) => debug!(
                "Learned {} for {} ({} observations)",
                response.answer, profile.user_id, profile.observations
            ),
            None => debug!("Response {} already learned", response.response_id),
        }
        Ok(())
    }

    /// Score a prospective question
    pub async fn recommend(&self, features: &Features) -> Result<Recommendation, LearnError> {
        let profile = self.store.load_profile(&features.user_id).await?;
        let learning = self.config.read().await.learning.clone();
        let recommendation = score(profile.as_ref(), features, &learning);
        debug!(
            "Recommendation for {} on {}: ask={} confidence={:.3} threshold={:.3}",
            features.user_id,
            features.topic,
            recommendation.should_ask,
            recommendation.confidence,
            recommendation.threshold
        );
        Ok(recommendation)
    }

    /// Learned evidence threshold for a user, or the configured initial value
    pub async fn evidence_threshold(&self, user_id: &str) -> Result<u32, LearnError> {
        let learned = self.store.load_profile(user_id).await?;
        let learning = self.config.read().await.learning.clone();
        Ok(learned
            .map(|p| p.evidence_threshold)
            .unwrap_or(learning.initial_evidence_threshold))
    }

    /// Learn every response a crash or timeout left unprocessed; returns how many
    pub async fn catch_up(&self) -> Result<usize, LearnError> {
        let pending = self.store.unlearned_responses(256).await?;
        let mut learned = 0;
        for response in &pending {
            match self.observe(response).await {
                Ok(()) => learned += 1,
                Err(LearnError::Store(StoreError::NotFound(what))) => {
                    warn!("Skipping response {}: {} is missing", response.response_id, what);
                }
                Err(e) => return Err(e),
            }
        }
        if learned > 0 {
            info!("Caught up on {} unlearned responses", learned);
        }
        Ok(learned)
    }

    pub async fn profile(&self, user_id: &str) -> Result<Option<PreferenceProfile>, LearnError> {
        Ok(self.store.load_profile(user_id).await?)
    }

    /// Best times to ask, once enough answers are in
    pub async fn insights(&self, user_id: &str) -> Result<Insights, LearnError> {
        let required = self.config.read().await.learning.min_observations_for_insights;
        let profile = self.store.load_profile(user_id).await?;
        let observations = profile.as_ref().map(|p| p.observations).unwrap_or(0);
        let profile = match profile {
            Some(profile) if observations >= required => profile,
            _ => {
                return Err(LearnError::InsufficientData {
                    user_id: user_id.to_string(),
                    observations,
                    required,
                })
            }
        };

        let mut overall = DimensionStats::default();
        for stats in profile.by_time_bucket.values() {
            overall.yes += stats.yes;
            overall.no += stats.no;
            overall.later += stats.later;
        }

        Ok(Insights {
            user_id: profile.user_id.clone(),
            best_time_bucket: best_key(profile.dimension(Dimension::TimeBucket)),
            best_day: best_key(profile.dimension(Dimension::Day)),
            confidence_threshold: profile.confidence_threshold,
            evidence_threshold: profile.evidence_threshold,
            later_rate: overall.later_rate().unwrap_or(0.0),
            observations,
        })
    }
}

fn best_key(stats: &std::collections::BTreeMap<String, DimensionStats>) -> Option<String> {
    stats
        .iter()
        .filter_map(|(key, s)| s.acceptance_rate().map(|rate| (key, rate, s.decided())))
        .max_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        })
        .map(|(key, _, _)| key.clone())
}
