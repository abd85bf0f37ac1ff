//! Question lifecycle: submit, schedule, deliver, answer, expire

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::formulator::{QuestionFormulator, TemplateFormulator};
use super::timing::{FocusMarker, Window};
use super::HitlError;
use crate::bus::{Payload, Publisher, Topic};
use crate::clock::SharedClock;
use crate::config::{PolicyConfig, SharedConfig};
use crate::preference::features::{keyword_hits, word_similarity};
use crate::preference::{Features, PreferenceEngine};
use crate::retry::RetryPolicy;
use crate::store::{
    AnswerOutcome, DeliveryMark, Pattern, Question, ResponseContext, ResponseRecord, Store,
};
use crate::types::{Answer, Priority, QuestionStatus, QuestionType, Sentiment};

/// What a delivery sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub rescheduled: Vec<String>,
}

/// Rolling window used by the daily cap
fn rate_window() -> Duration {
    Duration::hours(24)
}

/// Owns questions from submission to resolution
pub struct HitlProtocol {
    store: Arc<Store>,
    publisher: Arc<dyn Publisher>,
    engine: Arc<PreferenceEngine>,
    formulator: Arc<dyn QuestionFormulator>,
    config: SharedConfig,
    clock: SharedClock,
}

impl HitlProtocol {
    pub fn new(
        store: Arc<Store>,
        publisher: Arc<dyn Publisher>,
        engine: Arc<PreferenceEngine>,
        config: SharedConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            publisher,
            engine,
            formulator: Arc::new(TemplateFormulator),
            config,
            clock,
        }
    }

    /// Replace the default template wording
    pub fn with_formulator(mut self, formulator: Arc<dyn QuestionFormulator>) -> Self {
        self.formulator = formulator;
        self
    }

    async fn budget(&self) -> (RetryPolicy, std::time::Duration) {
        let config = self.config.read().await;
        (
            RetryPolicy::new(
                config.runtime.max_attempts,
                std::time::Duration::from_millis(config.runtime.retry_base_ms),
            ),
            std::time::Duration::from_millis(config.runtime.operation_budget_ms),
        )
    }

    /// Turn a detected pattern into a scheduled question, if policy allows.
    ///
    /// The returned id refers to a SCHEDULED question, or to a SUPPRESSED
    /// one when the learning engine declined.
    pub async fn submit(&self, pattern: Pattern) -> Result<String, HitlError> {
        let question_id = Uuid::new_v4().to_string();
        let (policy, budget) = self.budget().await;
        policy
            .run_with_budget("submit pattern", budget, || {
                self.submit_once(&pattern, &question_id)
            })
            .await
    }

    async fn submit_once(&self, pattern: &Pattern, question_id: &str) -> Result<String, HitlError> {
        let now = self.clock.now();
        let (policy, keywords) = {
            let config = self.config.read().await;
            (config.policy.clone(), config.learning.keywords.clone())
        };

        // A retry after a timeout may find the first attempt's work done
        if let Some(existing) = self.store.get_question(question_id).await? {
            if existing.status == QuestionStatus::Pending {
                self.schedule(existing, &policy, now).await?;
            }
            return Ok(question_id.to_string());
        }

        self.record_pattern(pattern).await?;
        let user_id = pattern
            .user_id()
            .map(str::to_string)
            .unwrap_or_else(|| policy.default_user_id.clone());

        // 1. Evidence gate
        let required = policy
            .min_evidence_count
            .max(self.engine.evidence_threshold(&user_id).await?);
        if pattern.evidence_count < required || pattern.confidence < policy.min_confidence {
            debug!(
                "Pattern {} below gate: evidence {}/{} confidence {:.2}/{:.2}",
                pattern.pattern_id,
                pattern.evidence_count,
                required,
                pattern.confidence,
                policy.min_confidence
            );
            return Err(HitlError::InsufficientEvidence {
                pattern_id: pattern.pattern_id.clone(),
                evidence_count: pattern.evidence_count,
                required,
                confidence: pattern.confidence,
            });
        }

        // 2. Exact duplicate: this pattern was turned down recently
        if self
            .store
            .has_rejection(&pattern.pattern_id, now - policy.duplicate_cooldown())
            .await?
        {
            info!("Suppressing pattern {}: declined within cooldown", pattern.pattern_id);
            return Err(HitlError::DuplicateSuppressed {
                pattern_id: pattern.pattern_id.clone(),
                reason: "declined within cooldown".to_string(),
            });
        }

        // 3. Near duplicate: same topic, similar pattern content, recently
        if let Some(similar) = self
            .near_duplicate(pattern, &user_id, &policy, now)
            .await?
        {
            info!(
                "Suppressing pattern {}: near duplicate of question {}",
                pattern.pattern_id, similar.question_id
            );
            return Err(HitlError::DuplicateSuppressed {
                pattern_id: pattern.pattern_id.clone(),
                reason: format!("near duplicate of {}", similar.question_id),
            });
        }

        let text = self.formulator.formulate(pattern);
        let question_type = if pattern.confidence >= policy.high_value_confidence {
            QuestionType::HighValue
        } else {
            QuestionType::LowStakes
        };
        let priority = match question_type {
            QuestionType::HighValue => Priority::High,
            QuestionType::LowStakes => Priority::Normal,
        };
        let mut question = Question {
            question_id: question_id.to_string(),
            pattern_id: pattern.pattern_id.clone(),
            user_id: user_id.clone(),
            topic: pattern.category.clone(),
            question_text: text.clone(),
            question_type,
            priority,
            status: QuestionStatus::Pending,
            scheduled_for: None,
            delivered_at: None,
            expires_at: now + policy.question_ttl(),
            batch_id: None,
            created_at: now,
            updated_at: now,
        };

        // 4. Ask the learning engine
        let mut keyword_source = text.clone();
        if let Some(summary) = pattern.summary() {
            keyword_source.push(' ');
            keyword_source.push_str(summary);
        }
        let features = Features {
            user_id: user_id.clone(),
            question_type,
            topic: pattern.category.clone(),
            at: now.with_timezone(&policy.utc_offset()),
            keywords: keyword_hits(&keyword_source, &keywords),
            pattern_confidence: pattern.confidence,
        };
        let recommendation = self.engine.recommend(&features).await?;
        if !recommendation.should_ask {
            question.status = QuestionStatus::Suppressed;
            self.store.insert_question(&question).await?;
            info!(
                "Question {} suppressed: confidence {:.2} below threshold {:.2}",
                question.question_id, recommendation.confidence, recommendation.threshold
            );
            return Ok(question.question_id);
        }

        // 5. Rolling daily cap
        let delivered = self
            .store
            .count_delivered_since(&user_id, now - rate_window())
            .await?;
        let scheduled = self.store.count_scheduled(&user_id).await?;
        if delivered + scheduled >= policy.max_questions_per_day {
            question.status = QuestionStatus::Suppressed;
            self.store.insert_question(&question).await?;
            info!(
                "Question {} rate limited for {} ({} delivered, {} scheduled)",
                question.question_id, user_id, delivered, scheduled
            );
            return Err(HitlError::RateLimited {
                question_id: question.question_id,
                delivered,
                scheduled,
                cap: policy.max_questions_per_day,
            });
        }

        // 6. Persist, then apply the timing policy
        self.store.insert_question(&question).await?;
        self.schedule(question, &policy, now).await
    }

    /// Move a PENDING question to SCHEDULED at the slot the timing policy picks
    async fn schedule(
        &self,
        pending: Question,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> Result<String, HitlError> {
        let (slot, batch_id) = self.plan_slot(&pending, policy, now).await?;

        let mut scheduled = pending.clone();
        scheduled.status = QuestionStatus::Scheduled;
        scheduled.scheduled_for = Some(slot);
        scheduled.batch_id = batch_id;
        scheduled.updated_at = now;
        self.transition(&pending, &scheduled).await?;

        info!(
            "Question {} scheduled for {} at {}{}",
            scheduled.question_id,
            scheduled.user_id,
            slot,
            scheduled
                .batch_id
                .as_ref()
                .map(|b| format!(" (batch {})", b))
                .unwrap_or_default()
        );
        Ok(scheduled.question_id)
    }

    async fn record_pattern(&self, pattern: &Pattern) -> Result<(), HitlError> {
        let key = format!("pattern:{}", pattern.pattern_id);
        let merged = match self.store.get_item::<Pattern>(&key).await? {
            Some(mut known) => {
                known.merge_sighting(pattern);
                known
            }
            None => pattern.clone(),
        };
        self.store.put_item(&merged).await?;
        Ok(())
    }

    /// A recent live question on the same topic about the same thing.
    ///
    /// Compares pattern content rather than question text, so shared
    /// template wording never counts. Patterns with no content only match
    /// themselves.
    async fn near_duplicate(
        &self,
        pattern: &Pattern,
        user_id: &str,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<Question>, HitlError> {
        let recent = self
            .store
            .recent_questions(user_id, &pattern.category, now - policy.near_duplicate_window())
            .await?;
        let content = pattern.content();

        for question in recent {
            if question.pattern_id == pattern.pattern_id {
                return Ok(Some(question));
            }
            if content.is_empty() {
                continue;
            }
            let Some(earlier) = self
                .store
                .get_item::<Pattern>(&format!("pattern:{}", question.pattern_id))
                .await?
            else {
                continue;
            };
            let earlier = earlier.content();
            if !earlier.is_empty()
                && word_similarity(&earlier, &content) >= policy.near_duplicate_similarity
            {
                return Ok(Some(question));
            }
        }
        Ok(None)
    }

    async fn focus_marker(&self, user_id: &str) -> Result<Option<FocusMarker>, HitlError> {
        Ok(self
            .store
            .get_item::<FocusMarker>(&FocusMarker::key_for(user_id))
            .await?)
    }

    /// Pick a delivery slot, joining an open batch when one fits
    async fn plan_slot(
        &self,
        question: &Question,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, Option<String>), HitlError> {
        let focus = self.focus_marker(&question.user_id).await?;
        let window = Window::new(policy, focus.as_ref(), now);

        if policy.batching {
            if let Some(open) = self
                .store
                .open_batch(&question.user_id, question.question_type)
                .await?
            {
                if let Some(slot) = open.scheduled_for {
                    if window.is_open(slot.max(now))? {
                        let batch_id = match &open.batch_id {
                            Some(id) => id.clone(),
                            None => self.start_batch(&open, now).await?,
                        };
                        return Ok((slot, Some(batch_id)));
                    }
                }
            }
        }

        let last = self
            .store
            .last_delivery_slot(&question.user_id, true)
            .await?;
        Ok((window.after_interval(now, last)?, None))
    }

    /// Give a lone scheduled question a batch id so others can join it
    async fn start_batch(&self, open: &Question, now: DateTime<Utc>) -> Result<String, HitlError> {
        let batch_id = Uuid::new_v4().to_string();
        let mut tagged = open.clone();
        tagged.batch_id = Some(batch_id.clone());
        tagged.updated_at = now;
        self.transition(open, &tagged).await?;
        Ok(batch_id)
    }

    /// Persist `next` if the lifecycle allows leaving `current`'s status
    async fn transition(&self, current: &Question, next: &Question) -> Result<(), HitlError> {
        if !current.status.can_transition_to(next.status) {
            return Err(HitlError::InvalidTransition {
                question_id: current.question_id.clone(),
                from: current.status,
                to: next.status,
            });
        }
        if self.store.update_question(next, current.status).await? {
            debug!(
                "Question {}: {} -> {}",
                current.question_id, current.status, next.status
            );
            return Ok(());
        }

        // Lost a race; report against the status that won
        let actual = self
            .store
            .get_question(&current.question_id)
            .await?
            .map(|q| q.status)
            .ok_or_else(|| HitlError::NotFound(current.question_id.clone()))?;
        Err(HitlError::InvalidTransition {
            question_id: current.question_id.clone(),
            from: actual,
            to: next.status,
        })
    }

    /// Deliver every scheduled question whose slot has come
    pub async fn deliver_due(&self) -> Result<DeliveryReport, HitlError> {
        let now = self.clock.now();
        let policy = self.config.read().await.policy.clone();
        let window_start = now - rate_window();
        let mut report = DeliveryReport::default();
        let mut batches_sent: HashSet<String> = HashSet::new();

        for question in self.store.due_scheduled(now).await? {
            let user_id = question.user_id.as_str();
            let focus = self.focus_marker(user_id).await?;
            let window = Window::new(&policy, focus.as_ref(), now);

            // Focus set after scheduling
            if !window.is_open(now)? {
                let slot = window.next_open(now)?;
                self.reschedule(&question, slot, now, "user busy").await?;
                report.rescheduled.push(question.question_id);
                continue;
            }

            let delivered = self.store.count_delivered_since(user_id, window_start).await?;
            if delivered >= policy.max_questions_per_day {
                let frees = self
                    .store
                    .oldest_delivery_since(user_id, window_start)
                    .await?
                    .map(|oldest| oldest + rate_window())
                    .unwrap_or(now);
                let slot = window.next_open(frees.max(now))?;
                self.reschedule(&question, slot, now, "daily cap reached").await?;
                report.rescheduled.push(question.question_id);
                continue;
            }

            let in_sent_batch = question
                .batch_id
                .as_ref()
                .is_some_and(|b| batches_sent.contains(b));
            if !in_sent_batch {
                let last = self.store.last_delivery_slot(user_id, false).await?;
                if let Some(last) = last {
                    if last + policy.min_question_interval() > now {
                        let slot = window.after_interval(now, Some(last))?;
                        self.reschedule(&question, slot, now, "too soon after last question")
                            .await?;
                        report.rescheduled.push(question.question_id);
                        continue;
                    }
                }
            }

            let correlation = question
                .batch_id
                .clone()
                .unwrap_or_else(|| question.question_id.clone());
            self.publisher
                .publish(
                    Topic::DeliverQuestion,
                    Payload::DeliverQuestion {
                        question_id: question.question_id.clone(),
                        question_text: question.question_text.clone(),
                        question_type: question.question_type,
                        priority: question.priority,
                    },
                    question.priority,
                    Some(correlation),
                )
                .await?;

            match self
                .store
                .mark_delivered(
                    &question.question_id,
                    now,
                    policy.max_questions_per_day,
                    window_start,
                )
                .await?
            {
                DeliveryMark::Delivered => {
                    info!("Delivered question {} to {}", question.question_id, user_id);
                    if let Some(batch) = &question.batch_id {
                        batches_sent.insert(batch.clone());
                    }
                    report.delivered.push(question.question_id);
                }
                DeliveryMark::OverCap { delivered } => {
                    warn!(
                        "Question {} published but {} already has {} deliveries; rescheduling",
                        question.question_id, user_id, delivered
                    );
                    let slot = window.next_open(now + policy.min_question_interval())?;
                    self.reschedule(&question, slot, now, "daily cap reached").await?;
                    report.rescheduled.push(question.question_id);
                }
                DeliveryMark::StatusChanged(status) => {
                    debug!(
                        "Question {} moved to {} during delivery",
                        question.question_id, status
                    );
                }
            }
        }

        Ok(report)
    }

    async fn reschedule(
        &self,
        question: &Question,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), HitlError> {
        let mut moved = question.clone();
        moved.scheduled_for = Some(slot);
        moved.updated_at = now;
        self.transition(question, &moved).await?;
        debug!("Question {} rescheduled to {}: {}", question.question_id, slot, reason);
        Ok(())
    }

    /// Expire every pending or scheduled question past its deadline
    pub async fn expire_due(&self) -> Result<Vec<String>, HitlError> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        for question in self.store.expiry_candidates(now).await? {
            // Announce first: a failed publish leaves the question a candidate
            // for the next sweep instead of expiring it silently
            self.announce_resolved(&question, QuestionStatus::Expired).await?;

            let mut next = question.clone();
            next.status = QuestionStatus::Expired;
            next.updated_at = now;
            match self.transition(&question, &next).await {
                Ok(()) => {}
                Err(HitlError::InvalidTransition { from, .. }) => {
                    warn!(
                        "Question {} left {} after its expiry was announced",
                        question.question_id, from
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
            info!("Question {} expired", question.question_id);
            expired.push(question.question_id);
        }

        Ok(expired)
    }

    /// Record the user's answer to a delivered question.
    ///
    /// Idempotent on `response_id`.
    pub async fn record_response(
        &self,
        question_id: &str,
        response_id: &str,
        answer: Answer,
        sentiment: Sentiment,
        context: Option<ResponseContext>,
    ) -> Result<(), HitlError> {
        if let Some(seen) = self.store.get_response(response_id).await? {
            if !seen.learned {
                self.engine.observe(&seen).await?;
            }
            debug!("Response {} already recorded", response_id);
            // The first attempt may have failed before announcing the answer
            let question = self.get_question(&seen.question_id).await?;
            if question.status == QuestionStatus::Answered {
                self.announce_resolved(&question, QuestionStatus::Answered).await?;
            }
            return Ok(());
        }

        let question = self
            .store
            .get_question(question_id)
            .await?
            .ok_or_else(|| HitlError::NotFound(question_id.to_string()))?;
        let now = self.clock.now();
        let context = match context {
            Some(context) => context,
            None => {
                let (offset, keywords) = {
                    let config = self.config.read().await;
                    (config.policy.utc_offset(), config.learning.keywords.clone())
                };
                ResponseContext::at(
                    now.with_timezone(&offset),
                    keyword_hits(&question.question_text, &keywords),
                )
            }
        };

        let response = ResponseRecord {
            response_id: response_id.to_string(),
            question_id: question_id.to_string(),
            answer,
            sentiment,
            responded_at: now,
            context,
            learned: false,
        };

        match self.store.record_answer(&response).await? {
            AnswerOutcome::Recorded => {}
            AnswerOutcome::Duplicate => {
                debug!("Response {} recorded concurrently", response_id);
                return Ok(());
            }
            AnswerOutcome::InvalidState(status) => {
                return Err(HitlError::InvalidTransition {
                    question_id: question_id.to_string(),
                    from: status,
                    to: QuestionStatus::Answered,
                });
            }
        }
        info!("Question {} answered {}", question_id, answer);

        self.engine.observe(&response).await?;
        self.announce_resolved(&question, QuestionStatus::Answered).await
    }

    /// Publish `question.resolved`; may repeat, so consumers dedupe on question id
    async fn announce_resolved(
        &self,
        question: &Question,
        status: QuestionStatus,
    ) -> Result<(), HitlError> {
        let priority = match status {
            QuestionStatus::Answered => Priority::Normal,
            _ => Priority::Low,
        };
        let correlation = question
            .batch_id
            .clone()
            .unwrap_or_else(|| question.question_id.clone());
        self.publisher
            .publish(
                Topic::QuestionResolved,
                Payload::QuestionResolved {
                    question_id: question.question_id.clone(),
                    status,
                },
                priority,
                Some(correlation),
            )
            .await?;
        Ok(())
    }

    /// Hold questions for `user_id` until `until`
    pub async fn mark_focus(&self, user_id: &str, until: DateTime<Utc>) -> Result<(), HitlError> {
        let marker = FocusMarker {
            user_id: user_id.to_string(),
            until,
            set_at: self.clock.now(),
        };
        self.store.put_item(&marker).await?;
        info!("{} in focus until {}", user_id, until);
        Ok(())
    }

    /// End a focus period early; returns whether one was active
    pub async fn clear_focus(&self, user_id: &str) -> Result<bool, HitlError> {
        let cleared = self.store.expire(&FocusMarker::key_for(user_id)).await?;
        if cleared {
            info!("{} focus cleared", user_id);
        }
        Ok(cleared)
    }

    pub async fn get_question(&self, question_id: &str) -> Result<Question, HitlError> {
        self.store
            .get_question(question_id)
            .await?
            .ok_or_else(|| HitlError::NotFound(question_id.to_string()))
    }

    /// Question counts by status
    pub async fn status_counts(&self) -> Result<Vec<(QuestionStatus, u64)>, HitlError> {
        Ok(self.store.status_counts().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, MockPublisher};
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::preference::PreferenceProfile;
    use crate::preference::DimensionStats;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        clock: ManualClock,
        protocol: HitlProtocol,
    }

    fn monday(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    async fn fixture(start: DateTime<Utc>, publisher: MockPublisher) -> Fixture {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.runtime.operation_budget_ms = 5_000;
        let store = Arc::new(Store::open(dir.path().join("hitl.db"), &config.store).await.unwrap());
        let config = config.into_shared();
        let clock = ManualClock::new(start);
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let engine = Arc::new(PreferenceEngine::new(store.clone(), config.clone(), shared_clock.clone()));
        let protocol = HitlProtocol::new(store.clone(), Arc::new(publisher), engine, config, shared_clock);
        Fixture { _dir: dir, store, clock, protocol }
    }

    fn publisher_accepting(times: usize) -> MockPublisher {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(times)
            .returning(|_, _, _, _| Ok(Uuid::new_v4().to_string()));
        publisher
    }

    fn pattern(id: &str, category: &str, confidence: f64, evidence: u32, summary: &str) -> Pattern {
        Pattern {
            pattern_id: id.to_string(),
            category: category.to_string(),
            confidence,
            evidence_count: evidence,
            first_seen: monday(8, 0),
            last_seen: monday(8, 30),
            payload: serde_json::json!({"user_id": "alice", "summary": summary}),
        }
    }

    #[tokio::test]
    async fn test_submit_deliver_answer() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|topic, payload, priority, correlation| {
                *topic == Topic::DeliverQuestion
                    && matches!(payload, Payload::DeliverQuestion { .. })
                    && *priority == Priority::High
                    && correlation.is_some()
            })
            .times(1)
            .returning(|_, _, _, _| Ok("m1".to_string()));
        publisher
            .expect_publish()
            .withf(|topic, payload, _, _| {
                *topic == Topic::QuestionResolved
                    && matches!(payload, Payload::QuestionResolved { status: QuestionStatus::Answered, .. })
            })
            .times(2)
            .returning(|_, _, _, _| Ok("m2".to_string()));
        let f = fixture(monday(9, 0), publisher).await;

        let qid = f
            .protocol
            .submit(pattern("p1", "testing", 0.85, 5, "run the tests before committing"))
            .await
            .unwrap();
        let q = f.protocol.get_question(&qid).await.unwrap();
        assert_eq!(q.status, QuestionStatus::Scheduled);
        assert_eq!(q.question_type, QuestionType::HighValue);
        assert_eq!(q.scheduled_for, Some(monday(9, 0)));

        f.clock.set(monday(9, 1));
        let report = f.protocol.deliver_due().await.unwrap();
        assert_eq!(report.delivered, vec![qid.clone()]);
        assert_eq!(
            f.protocol.get_question(&qid).await.unwrap().delivered_at,
            Some(monday(9, 1))
        );

        f.protocol
            .record_response(&qid, "r1", Answer::Yes, Sentiment::Positive, None)
            .await
            .unwrap();
        // Same response again changes nothing but announces the answer again
        f.protocol
            .record_response(&qid, "r1", Answer::Yes, Sentiment::Positive, None)
            .await
            .unwrap();
        assert_eq!(
            f.protocol.get_question(&qid).await.unwrap().status,
            QuestionStatus::Answered
        );
        assert!(f.store.get_response("r1").await.unwrap().unwrap().learned);
    }

    #[tokio::test]
    async fn test_weak_pattern_is_recorded_but_not_asked() {
        let f = fixture(monday(9, 0), publisher_accepting(0)).await;
        let result = f.protocol.submit(pattern("p1", "testing", 0.9, 1, "lint")).await;
        assert!(matches!(result, Err(HitlError::InsufficientEvidence { required: 3, .. })));
        assert!(f.store.get_item::<Pattern>("pattern:p1").await.unwrap().is_some());
        assert!(f
            .protocol
            .status_counts()
            .await
            .unwrap()
            .iter()
            .all(|(_, n)| *n == 0));
    }

    #[tokio::test]
    async fn test_quiet_hours_defer_slot() {
        let f = fixture(monday(23, 0), publisher_accepting(0)).await;
        let qid = f
            .protocol
            .submit(pattern("p1", "testing", 0.7, 4, "format code on save"))
            .await
            .unwrap();
        let q = f.protocol.get_question(&qid).await.unwrap();
        assert_eq!(q.scheduled_for, Some(Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap()));
        assert_eq!(q.priority, Priority::Normal);
        assert!(f.protocol.deliver_due().await.unwrap().delivered.is_empty());
    }

    #[tokio::test]
    async fn test_focus_defers_and_clears() {
        let f = fixture(monday(9, 0), publisher_accepting(0)).await;
        f.protocol.mark_focus("alice", monday(11, 0)).await.unwrap();
        let qid = f
            .protocol
            .submit(pattern("p1", "testing", 0.7, 4, "format code on save"))
            .await
            .unwrap();
        assert_eq!(
            f.protocol.get_question(&qid).await.unwrap().scheduled_for,
            Some(monday(11, 0))
        );
        assert!(f.protocol.clear_focus("alice").await.unwrap());
        assert!(!f.protocol.clear_focus("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_compatible_questions_share_a_batch() {
        let f = fixture(monday(9, 0), publisher_accepting(2)).await;
        let first = f
            .protocol
            .submit(pattern("p1", "git", 0.7, 4, "rebase before pushing"))
            .await
            .unwrap();
        let second = f
            .protocol
            .submit(pattern("p2", "editor", 0.7, 4, "format code on save"))
            .await
            .unwrap();

        let a = f.protocol.get_question(&first).await.unwrap();
        let b = f.protocol.get_question(&second).await.unwrap();
        assert_eq!(a.scheduled_for, b.scheduled_for);
        assert!(a.batch_id.is_some());
        assert_eq!(a.batch_id, b.batch_id);

        f.clock.set(monday(9, 1));
        let report = f.protocol.deliver_due().await.unwrap();
        assert_eq!(report.delivered.len(), 2);
    }

    #[tokio::test]
    async fn test_unbatched_questions_keep_minimum_interval() {
        let f = fixture(monday(9, 0), publisher_accepting(1)).await;
        let first = f
            .protocol
            .submit(pattern("p1", "git", 0.7, 4, "rebase before pushing"))
            .await
            .unwrap();
        // Different type, so no batch
        let second = f
            .protocol
            .submit(pattern("p2", "editor", 0.9, 4, "format code on save"))
            .await
            .unwrap();
        assert_eq!(
            f.protocol.get_question(&second).await.unwrap().scheduled_for,
            Some(monday(9, 30))
        );

        f.clock.set(monday(9, 5));
        let report = f.protocol.deliver_due().await.unwrap();
        assert_eq!(report.delivered, vec![first]);
    }

    #[tokio::test]
    async fn test_expiry_is_terminal() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|topic, _, _, _| *topic == Topic::QuestionResolved)
            .times(1)
            .returning(|_, _, _, _| Ok("m".to_string()));
        let f = fixture(monday(23, 0), publisher).await;
        let qid = f
            .protocol
            .submit(pattern("p1", "testing", 0.7, 4, "format code on save"))
            .await
            .unwrap();

        f.clock.set(monday(23, 0) + Duration::hours(25));
        assert_eq!(f.protocol.expire_due().await.unwrap(), vec![qid.clone()]);
        assert!(f.protocol.expire_due().await.unwrap().is_empty());

        let late = f
            .protocol
            .record_response(&qid, "r1", Answer::Yes, Sentiment::Neutral, None)
            .await;
        assert!(matches!(
            late,
            Err(HitlError::InvalidTransition { from: QuestionStatus::Expired, .. })
        ));
    }

    #[tokio::test]
    async fn test_similar_habit_in_same_topic_is_suppressed() {
        let f = fixture(monday(9, 0), publisher_accepting(0)).await;
        f.protocol
            .submit(pattern("p1", "git", 0.7, 4, "rebase before pushing"))
            .await
            .unwrap();

        let similar = f
            .protocol
            .submit(pattern("p2", "git", 0.7, 4, "rebase before pushing changes"))
            .await;
        assert!(matches!(
            similar,
            Err(HitlError::DuplicateSuppressed { ref pattern_id, .. }) if pattern_id == "p2"
        ));

        // Same wording under another topic is a different question
        f.protocol
            .submit(pattern("p3", "editor", 0.7, 4, "rebase before pushing changes"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unrelated_habits_in_same_topic_are_both_asked() {
        let f = fixture(monday(9, 0), publisher_accepting(0)).await;
        f.protocol
            .submit(pattern("p1", "git", 0.7, 4, "rebase before pushing"))
            .await
            .unwrap();
        f.protocol
            .submit(pattern("p2", "git", 0.7, 4, "squash commits before merging"))
            .await
            .unwrap();

        // Without a summary the question text is all template
        let mut bare = pattern("p3", "git", 0.7, 4, "");
        bare.payload = serde_json::json!({"user_id": "alice"});
        f.protocol.submit(bare.clone()).await.unwrap();
        bare.pattern_id = "p4".to_string();
        f.protocol.submit(bare).await.unwrap();

        let scheduled = f
            .store
            .questions_with_status(QuestionStatus::Scheduled, 10)
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 4);
    }

    /// Publishes deliveries, fails the first `question.resolved`, then accepts
    fn publisher_failing_first_resolution(attempts: Arc<AtomicUsize>) -> MockPublisher {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|topic, _, _, _| *topic == Topic::DeliverQuestion)
            .returning(|_, _, _, _| Ok("m".to_string()));
        publisher
            .expect_publish()
            .withf(|topic, _, _, _| *topic == Topic::QuestionResolved)
            .returning(move |_, _, _, _| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(BusError::Closed)
                } else {
                    Ok("m".to_string())
                }
            });
        publisher
    }

    #[tokio::test]
    async fn test_replayed_response_announces_answer_after_failed_publish() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let f = fixture(monday(9, 0), publisher_failing_first_resolution(attempts.clone())).await;
        let qid = f
            .protocol
            .submit(pattern("p1", "testing", 0.85, 5, "run the tests before committing"))
            .await
            .unwrap();
        f.clock.set(monday(9, 1));
        f.protocol.deliver_due().await.unwrap();

        let first = f
            .protocol
            .record_response(&qid, "r1", Answer::Yes, Sentiment::Positive, None)
            .await;
        assert!(matches!(first, Err(HitlError::Bus(BusError::Closed))));
        assert_eq!(
            f.protocol.get_question(&qid).await.unwrap().status,
            QuestionStatus::Answered
        );

        f.protocol
            .record_response(&qid, "r1", Answer::Yes, Sentiment::Positive, None)
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expiry_waits_for_announcement() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let f = fixture(monday(23, 0), publisher_failing_first_resolution(attempts.clone())).await;
        let qid = f
            .protocol
            .submit(pattern("p1", "testing", 0.7, 4, "format code on save"))
            .await
            .unwrap();

        f.clock.set(monday(23, 0) + Duration::hours(25));
        assert!(f.protocol.expire_due().await.is_err());
        assert_eq!(
            f.protocol.get_question(&qid).await.unwrap().status,
            QuestionStatus::Scheduled
        );

        assert_eq!(f.protocol.expire_due().await.unwrap(), vec![qid.clone()]);
        assert_eq!(
            f.protocol.get_question(&qid).await.unwrap().status,
            QuestionStatus::Expired
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_learned_rejection_suppresses() {
        let f = fixture(monday(9, 0), publisher_accepting(0)).await;
        let learning = crate::config::LearningConfig::default();
        let mut profile = PreferenceProfile::new("alice", &learning, monday(8, 0));
        profile
            .by_question_type
            .insert("low_stakes".into(), DimensionStats { yes: 0, no: 20, later: 0 });
        f.store.save_profile(&profile).await.unwrap();

        let qid = f
            .protocol
            .submit(pattern("p1", "testing", 0.6, 5, "format code on save"))
            .await
            .unwrap();
        assert_eq!(
            f.protocol.get_question(&qid).await.unwrap().status,
            QuestionStatus::Suppressed
        );
    }
}
