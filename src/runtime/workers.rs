//! Long-running loops that connect the bus to the protocol and the engine

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::cancel::CancellationToken;
use crate::bus::{BusError, Delivery, MessageBus, Payload, Subscriber};
use crate::hitl::{HitlError, HitlProtocol};
use crate::preference::PreferenceEngine;
use crate::retry::Transient;
use crate::store::Pattern;

/// Acknowledged log rows older than this are purged by the sweep
const ACKED_RETENTION_DAYS: i64 = 7;

/// Whether a handled delivery should be acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack,
    /// Leave the lease to run out so the message is redelivered
    Retry,
}

/// Build the domain pattern carried by a `pattern.detected` message
pub(crate) fn pattern_from(delivery: &Delivery) -> Option<Pattern> {
    match &delivery.payload {
        Payload::PatternDetected {
            pattern_id,
            category,
            confidence,
            evidence_count,
            payload,
        } => Some(Pattern {
            pattern_id: pattern_id.clone(),
            category: category.clone(),
            confidence: *confidence,
            evidence_count: *evidence_count,
            first_seen: delivery.created_at,
            last_seen: delivery.created_at,
            payload: payload.clone(),
        }),
        _ => None,
    }
}

pub(crate) async fn handle_pattern(protocol: &HitlProtocol, delivery: &Delivery) -> Disposition {
    let Some(pattern) = pattern_from(delivery) else {
        error!("Unexpected payload on {}: {:?}", delivery.topic, delivery.payload);
        return Disposition::Ack;
    };
    let pattern_id = pattern.pattern_id.clone();

    match protocol.submit(pattern).await {
        Ok(question_id) => {
            debug!("Pattern {} became question {}", pattern_id, question_id);
            Disposition::Ack
        }
        Err(e) if e.is_policy_outcome() => {
            info!("Pattern {} not asked: {}", pattern_id, e);
            Disposition::Ack
        }
        Err(e) if e.is_transient() => {
            warn!("Pattern {} deferred for redelivery: {}", pattern_id, e);
            Disposition::Retry
        }
        Err(e) => {
            error!("Dropping pattern {}: {}", pattern_id, e);
            Disposition::Ack
        }
    }
}

pub(crate) async fn handle_response(protocol: &HitlProtocol, delivery: &Delivery) -> Disposition {
    let Payload::ResponseReceived {
        question_id,
        response_id,
        answer,
        sentiment,
        context,
    } = &delivery.payload
    else {
        error!("Unexpected payload on {}: {:?}", delivery.topic, delivery.payload);
        return Disposition::Ack;
    };

    match protocol
        .record_response(question_id, response_id, *answer, *sentiment, context.clone())
        .await
    {
        Ok(()) => Disposition::Ack,
        Err(e @ (HitlError::InvalidTransition { .. } | HitlError::NotFound(_))) => {
            warn!("Ignoring response {}: {}", response_id, e);
            Disposition::Ack
        }
        Err(e) if e.is_transient() => {
            warn!("Response {} deferred for redelivery: {}", response_id, e);
            Disposition::Retry
        }
        Err(e) => {
            error!("Dropping response {}: {}", response_id, e);
            Disposition::Ack
        }
    }
}

/// Drain a subscription until cancelled or the bus closes
pub(crate) async fn consume<S, F, Fut>(
    name: &'static str,
    mut subscription: S,
    token: CancellationToken,
    retry_pause: Duration,
    mut handle: F,
) where
    S: Subscriber,
    F: FnMut(Delivery) -> Fut,
    Fut: std::future::Future<Output = Disposition>,
{
    info!("{} consumer started", name);

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                info!("{} consumer received shutdown signal", name);
                break;
            }
            next = subscription.next() => next,
        };

        let delivery = match next {
            Ok(delivery) => delivery,
            Err(BusError::Closed) => break,
            Err(e) => {
                warn!("{} consumer failed to receive: {}", name, e);
                tokio::time::sleep(retry_pause).await;
                continue;
            }
        };

        let message_id = delivery.message_id.clone();
        if handle(delivery).await == Disposition::Ack {
            match subscription.ack(&message_id).await {
                Ok(()) => {}
                Err(BusError::LeaseExpired(_)) => {
                    warn!("{} consumer acked {} after its lease ran out", name, message_id)
                }
                Err(e) => warn!("{} consumer failed to ack {}: {}", name, message_id, e),
            }
        }
    }

    info!("{} consumer stopped", name);
}

/// Periodic expiry, delivery and log housekeeping
pub(crate) async fn scheduler_loop(
    protocol: Arc<HitlProtocol>,
    bus: Arc<MessageBus>,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Scheduler loop started");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Scheduler received shutdown signal");
                break;
            }
            _ = interval.tick() => {
                sweep(&protocol, &bus).await;
            }
        }
    }
}

pub(crate) async fn sweep(protocol: &HitlProtocol, bus: &MessageBus) {
    match protocol.expire_due().await {
        Ok(expired) if !expired.is_empty() => info!("Expired {} questions", expired.len()),
        Ok(_) => {}
        Err(e) => warn!("Expiry sweep failed: {}", e),
    }

    match protocol.deliver_due().await {
        Ok(report) => {
            if !report.delivered.is_empty() || !report.rescheduled.is_empty() {
                info!(
                    "Delivery sweep: {} delivered, {} rescheduled",
                    report.delivered.len(),
                    report.rescheduled.len()
                );
            }
        }
        Err(e) => warn!("Delivery sweep failed: {}", e),
    }

    match bus.purge_acked(ChronoDuration::days(ACKED_RETENTION_DAYS)).await {
        Ok(0) => {}
        Ok(purged) => debug!("Purged {} acknowledged messages", purged),
        Err(BusError::Closed) => {}
        Err(e) => warn!("Log purge failed: {}", e),
    }
}

/// Fold in responses the engine has not yet learned from
pub(crate) async fn recalc_loop(engine: Arc<PreferenceEngine>, period: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Recalculation loop started");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Recalculation loop received shutdown signal");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = engine.catch_up().await {
                    warn!("Preference catch-up failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockPublisher;
    use crate::clock::{ManualClock, SharedClock};
    use crate::config::Config;
    use crate::store::Store;
    use crate::types::Priority;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn delivery(payload: Payload) -> Delivery {
        Delivery {
            message_id: "m1".into(),
            topic: payload.topic(),
            payload,
            priority: Priority::Normal,
            correlation_id: None,
            created_at: t0(),
            attempt: 1,
            lease_expires_at: t0() + ChronoDuration::seconds(30),
        }
    }

    fn detected(evidence: u32) -> Payload {
        Payload::PatternDetected {
            pattern_id: "p1".into(),
            category: "testing".into(),
            confidence: 0.9,
            evidence_count: evidence,
            payload: serde_json::json!({"summary": "run the tests before pushing"}),
        }
    }

    async fn protocol(dir: &tempfile::TempDir) -> HitlProtocol {
        let mut config = Config::default();
        config.runtime.operation_budget_ms = 5_000;
        let store = Arc::new(Store::open(dir.path().join("w.db"), &config.store).await.unwrap());
        let config = config.into_shared();
        let clock: SharedClock = Arc::new(ManualClock::new(t0()));
        let engine = Arc::new(PreferenceEngine::new(store.clone(), config.clone(), clock.clone()));
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .returning(|_, _, _, _| Ok("msg".to_string()));
        HitlProtocol::new(store, Arc::new(publisher), engine, config, clock)
    }

    #[test]
    fn test_pattern_from_uses_message_time() {
        let pattern = pattern_from(&delivery(detected(4))).unwrap();
        assert_eq!(pattern.pattern_id, "p1");
        assert_eq!(pattern.first_seen, t0());
        assert_eq!(pattern.last_seen, t0());
        assert!(pattern_from(&delivery(Payload::QuestionResolved {
            question_id: "q".into(),
            status: crate::types::QuestionStatus::Expired,
        }))
        .is_none());
    }

    #[tokio::test]
    async fn test_policy_outcomes_are_acked() {
        let dir = tempdir().unwrap();
        let protocol = protocol(&dir).await;

        assert_eq!(handle_pattern(&protocol, &delivery(detected(5))).await, Disposition::Ack);
        // Weak evidence is a policy outcome, not a failure
        assert_eq!(handle_pattern(&protocol, &delivery(detected(1))).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_response_to_unknown_question_is_acked() {
        let dir = tempdir().unwrap();
        let protocol = protocol(&dir).await;
        let response = Payload::ResponseReceived {
            question_id: "missing".into(),
            response_id: "r1".into(),
            answer: crate::types::Answer::Yes,
            sentiment: Default::default(),
            context: None,
        };
        assert_eq!(handle_response(&protocol, &delivery(response)).await, Disposition::Ack);
    }

    struct Scripted {
        queue: VecDeque<Delivery>,
        acked: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Subscriber for Scripted {
        async fn next(&mut self) -> Result<Delivery, BusError> {
            match self.queue.pop_front() {
                Some(d) => Ok(d),
                None => Err(BusError::Closed),
            }
        }

        async fn ack(&self, message_id: &str) -> Result<(), BusError> {
            self.acked.lock().unwrap().push(message_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_consume_acks_only_handled_messages() {
        let acked = Arc::new(Mutex::new(Vec::new()));
        let mut first = delivery(detected(4));
        first.message_id = "keep".into();
        let mut second = delivery(detected(4));
        second.message_id = "retry".into();
        let sub = Scripted {
            queue: VecDeque::from(vec![first, second]),
            acked: acked.clone(),
        };

        consume("test", sub, CancellationToken::new(), Duration::from_millis(1), |d| async move {
            if d.message_id == "retry" {
                Disposition::Retry
            } else {
                Disposition::Ack
            }
        })
        .await;

        assert_eq!(*acked.lock().unwrap(), vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn test_consume_stops_on_cancel() {
        struct Idle;

        #[async_trait]
        impl Subscriber for Idle {
            async fn next(&mut self) -> Result<Delivery, BusError> {
                futures::future::pending().await
            }

            async fn ack(&self, _: &str) -> Result<(), BusError> {
                Ok(())
            }
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(consume(
            "idle",
            Idle,
            token.clone(),
            Duration::from_millis(1),
            |_| async { Disposition::Ack },
        ));
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
