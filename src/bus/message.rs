//! Topics, payloads and envelopes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::BusError;
use crate::store::ResponseContext;
use crate::types::{Answer, Priority, QuestionStatus, QuestionType, Sentiment};

/// Every topic the bus carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "pattern.detected")]
    PatternDetected,
    #[serde(rename = "question.deliver")]
    DeliverQuestion,
    #[serde(rename = "question.resolved")]
    QuestionResolved,
    #[serde(rename = "question.response")]
    QuestionResponse,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::PatternDetected,
        Topic::DeliverQuestion,
        Topic::QuestionResolved,
        Topic::QuestionResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PatternDetected => "pattern.detected",
            Topic::DeliverQuestion => "question.deliver",
            Topic::QuestionResolved => "question.resolved",
            Topic::QuestionResponse => "question.response",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| BusError::InvalidPayload(format!("unknown topic '{}'", s)))
    }
}

/// Message body, one variant per topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// An upstream detector saw a behaviour pattern
    PatternDetected {
        pattern_id: String,
        category: String,
        confidence: f64,
        evidence_count: u32,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// A question is ready for a delivery channel
    DeliverQuestion {
        question_id: String,
        question_text: String,
        question_type: QuestionType,
        priority: Priority,
    },
    /// A question reached a terminal state
    QuestionResolved {
        question_id: String,
        status: QuestionStatus,
    },
    /// A user answered a delivered question
    ResponseReceived {
        question_id: String,
        response_id: String,
        answer: Answer,
        #[serde(default)]
        sentiment: Sentiment,
        /// Filled in from the receive time when the channel omits it
        #[serde(default)]
        context: Option<ResponseContext>,
    },
}

impl Payload {
    /// Topic this payload belongs to
    pub fn topic(&self) -> Topic {
        match self {
            Payload::PatternDetected { .. } => Topic::PatternDetected,
            Payload::DeliverQuestion { .. } => Topic::DeliverQuestion,
            Payload::QuestionResolved { .. } => Topic::QuestionResolved,
            Payload::ResponseReceived { .. } => Topic::QuestionResponse,
        }
    }

    /// Check the variant matches `topic` and every field is in range
    pub fn validate(&self, topic: Topic) -> Result<(), BusError> {
        if self.topic() != topic {
            return Err(BusError::InvalidPayload(format!(
                "{} payload published on {}",
                self.topic(),
                topic
            )));
        }

        match self {
            Payload::PatternDetected {
                pattern_id,
                category,
                confidence,
                ..
            } => {
                require_id("pattern_id", pattern_id)?;
                require_id("category", category)?;
                if !confidence.is_finite() || !(0.0..=1.0).contains(confidence) {
                    return Err(BusError::InvalidPayload(format!(
                        "confidence {} outside [0, 1]",
                        confidence
                    )));
                }
            }
            Payload::DeliverQuestion {
                question_id,
                question_text,
                ..
            } => {
                require_id("question_id", question_id)?;
                if question_text.trim().is_empty() {
                    return Err(BusError::InvalidPayload("empty question_text".into()));
                }
            }
            Payload::QuestionResolved { question_id, status } => {
                require_id("question_id", question_id)?;
                if !status.is_terminal() {
                    return Err(BusError::InvalidPayload(format!(
                        "resolved with non-terminal status {}",
                        status
                    )));
                }
            }
            Payload::ResponseReceived {
                question_id,
                response_id,
                context,
                ..
            } => {
                require_id("question_id", question_id)?;
                require_id("response_id", response_id)?;
                if let Some(ctx) = context {
                    if ctx.hour > 23 {
                        return Err(BusError::InvalidPayload(format!("hour {} out of range", ctx.hour)));
                    }
                }
            }
        }
        Ok(())
    }
}

fn require_id(field: &str, value: &str) -> Result<(), BusError> {
    if value.trim().is_empty() {
        Err(BusError::InvalidPayload(format!("empty {}", field)))
    } else {
        Ok(())
    }
}

/// A published message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub topic: Topic,
    pub payload: Payload,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub ack_at: Option<DateTime<Utc>>,
}

/// A message handed to a subscriber under a lease
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    pub topic: Topic,
    pub payload: Payload,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 1 on first delivery, higher on redelivery
    pub attempt: u32,
    pub lease_expires_at: DateTime<Utc>,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detected(confidence: f64) -> Payload {
        Payload::PatternDetected {
            pattern_id: "p1".into(),
            category: "testing".into(),
            confidence,
            evidence_count: 4,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_unknown_topic_fails_at_parse() {
        assert_eq!("question.deliver".parse::<Topic>().unwrap(), Topic::DeliverQuestion);
        assert!(matches!("question.bogus".parse::<Topic>(), Err(BusError::InvalidPayload(_))));
    }

    #[test]
    fn test_payload_must_match_topic() {
        assert!(detected(0.5).validate(Topic::PatternDetected).is_ok());
        assert!(detected(0.5).validate(Topic::DeliverQuestion).is_err());
    }

    #[test]
    fn test_out_of_range_fields_rejected() {
        assert!(detected(1.5).validate(Topic::PatternDetected).is_err());
        assert!(detected(f64::NAN).validate(Topic::PatternDetected).is_err());

        let resolved = Payload::QuestionResolved {
            question_id: "q1".into(),
            status: QuestionStatus::Scheduled,
        };
        assert!(resolved.validate(Topic::QuestionResolved).is_err());
    }

    #[test]
    fn test_payload_wire_format() {
        let json = serde_json::to_value(detected(0.9)).unwrap();
        assert_eq!(json["type"], "pattern_detected");

        let response: Payload = serde_json::from_str(
            r#"{"type":"response_received","question_id":"q1","response_id":"r1","answer":"YES"}"#,
        )
        .unwrap();
        assert_eq!(response.topic(), Topic::QuestionResponse);
        assert!(response.validate(Topic::QuestionResponse).is_ok());
    }
}
