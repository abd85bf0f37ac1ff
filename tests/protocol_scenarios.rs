//! End-to-end question lifecycle against a real store and bus

mod common;

use chrono::Duration;
use common::{monday, pattern, world};
use hitl_agent::preference::Dimension;
use hitl_agent::{Answer, HitlError, Payload, QuestionStatus, QuestionType, Sentiment, Topic};
use std::time::Duration as StdDuration;

#[tokio::test]
async fn test_first_question_is_delivered_and_learned_from() {
    let w = world(monday(9, 0)).await;
    let mut channel = w.bus.subscribe(Topic::DeliverQuestion, "channel").unwrap();

    let qid = w
        .protocol
        .submit(pattern("p1", "testing", 0.85, 5, "run the tests before committing"))
        .await
        .unwrap();
    let question = w.protocol.get_question(&qid).await.unwrap();
    assert_eq!(question.status, QuestionStatus::Scheduled);
    assert_eq!(question.question_type, QuestionType::HighValue);

    w.clock.set(monday(9, 1));
    let report = w.protocol.deliver_due().await.unwrap();
    assert_eq!(report.delivered, vec![qid.clone()]);

    let delivery = tokio::time::timeout(StdDuration::from_secs(2), channel.next())
        .await
        .unwrap()
        .unwrap();
    match &delivery.payload {
        Payload::DeliverQuestion { question_id, .. } => assert_eq!(question_id, &qid),
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(delivery.correlation_id.as_deref(), Some(qid.as_str()));
    channel.ack(&delivery.message_id).await.unwrap();

    w.protocol
        .record_response(&qid, "r1", Answer::Yes, Sentiment::Positive, None)
        .await
        .unwrap();
    assert_eq!(
        w.protocol.get_question(&qid).await.unwrap().status,
        QuestionStatus::Answered
    );

    let profile = w.engine.profile("alice").await.unwrap().unwrap();
    let high_value = profile.stats(Dimension::QuestionType, "high_value");
    assert_eq!((high_value.yes, high_value.decided()), (1, 1));
    assert_eq!(high_value.acceptance_rate(), Some(1.0));
    assert_eq!(profile.observations, 1);
    assert_eq!(profile.confidence_threshold, 0.5);
}

#[tokio::test]
async fn test_declined_pattern_is_not_asked_again() {
    let w = world(monday(9, 0)).await;
    let qid = w
        .protocol
        .submit(pattern("p1", "testing", 0.85, 5, "run the tests before committing"))
        .await
        .unwrap();
    w.clock.set(monday(9, 1));
    w.protocol.deliver_due().await.unwrap();
    w.protocol
        .record_response(&qid, "r1", Answer::No, Sentiment::Negative, None)
        .await
        .unwrap();

    w.clock.set(monday(14, 0));
    let again = w
        .protocol
        .submit(pattern("p1", "testing", 0.9, 7, "run the tests before committing"))
        .await;
    assert!(matches!(again, Err(HitlError::DuplicateSuppressed { .. })));

    let total: u64 = w
        .protocol
        .status_counts()
        .await
        .unwrap()
        .iter()
        .map(|(_, n)| n)
        .sum();
    assert_eq!(total, 1);
}

const HABITS: [(&str, &str); 6] = [
    ("git", "rebase before pushing"),
    ("editor", "format code on save"),
    ("testing", "run the tests before committing"),
    ("deps", "update dependencies weekly"),
    ("shell", "close idle terminals"),
    ("cleanup", "archive merged branches"),
];

#[tokio::test]
async fn test_sixth_question_in_a_day_is_rate_limited() {
    let w = world(monday(9, 0)).await;
    let mut at = monday(9, 0);

    for (i, (category, summary)) in HABITS.iter().take(5).enumerate() {
        w.clock.set(at);
        let qid = w
            .protocol
            .submit(pattern(&format!("p{}", i), category, 0.7, 5, summary))
            .await
            .unwrap();
        w.clock.set(at + Duration::minutes(1));
        let report = w.protocol.deliver_due().await.unwrap();
        assert_eq!(report.delivered, vec![qid]);
        at = at + Duration::minutes(31);
    }

    w.clock.set(at);
    let (category, summary) = HABITS[5];
    let sixth = w.protocol.submit(pattern("p5", category, 0.7, 5, summary)).await;
    let question_id = match sixth {
        Err(HitlError::RateLimited {
            question_id,
            delivered,
            cap,
            ..
        }) => {
            assert_eq!((delivered, cap), (5, 5));
            question_id
        }
        other => panic!("expected rate limit, got {:?}", other),
    };
    assert_eq!(
        w.protocol.get_question(&question_id).await.unwrap().status,
        QuestionStatus::Suppressed
    );
}

#[tokio::test]
async fn test_no_rolling_day_exceeds_the_cap() {
    let w = world(monday(0, 0)).await;
    let start = monday(0, 0);

    for i in 0..96 {
        let now = start + Duration::minutes(45 * i);
        w.clock.set(now);
        let result = w
            .protocol
            .submit(pattern(
                &format!("p{}", i),
                &format!("category{}", i),
                0.7,
                5,
                &format!("habit number {}", i),
            ))
            .await;
        assert!(result.is_ok() || matches!(result, Err(HitlError::RateLimited { .. })));
        w.protocol.expire_due().await.unwrap();
        w.protocol.deliver_due().await.unwrap();
    }

    let mut delivered: Vec<_> = w
        .store
        .questions_with_status(QuestionStatus::Delivered, 1_000)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|q| q.delivered_at)
        .collect();
    delivered.sort();
    assert!(delivered.len() >= 5);

    for (i, first) in delivered.iter().enumerate() {
        let in_window = delivered[i..]
            .iter()
            .take_while(|at| **at < *first + Duration::hours(24))
            .count();
        assert!(in_window <= 5, "{} deliveries in the day from {}", in_window, first);
    }
}

#[tokio::test]
async fn test_replayed_response_is_counted_once() {
    let w = world(monday(9, 0)).await;
    let qid = w
        .protocol
        .submit(pattern("p1", "testing", 0.85, 5, "run the tests before committing"))
        .await
        .unwrap();
    w.clock.set(monday(9, 1));
    w.protocol.deliver_due().await.unwrap();

    for _ in 0..3 {
        w.protocol
            .record_response(&qid, "r1", Answer::Yes, Sentiment::Positive, None)
            .await
            .unwrap();
    }

    let profile = w.engine.profile("alice").await.unwrap().unwrap();
    assert_eq!(profile.observations, 1);

    // A different response to an answered question is refused
    let second = w
        .protocol
        .record_response(&qid, "r2", Answer::No, Sentiment::Negative, None)
        .await;
    assert!(matches!(
        second,
        Err(HitlError::InvalidTransition {
            from: QuestionStatus::Answered,
            ..
        })
    ));
}
