//! Durable records owned by the store

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::records::Storable;
use crate::types::{Answer, Priority, QuestionStatus, QuestionType, Sentiment};

/// A behaviour pattern reported by an upstream detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub category: String,
    pub confidence: f64,
    pub evidence_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Detector-specific data, opaque to the core
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Pattern {
    /// Fold a fresh sighting into an existing pattern
    pub fn merge_sighting(&mut self, newer: &Pattern) {
        self.category = newer.category.clone();
        self.confidence = newer.confidence;
        self.evidence_count = newer.evidence_count;
        self.payload = newer.payload.clone();
        self.first_seen = self.first_seen.min(newer.first_seen);
        self.last_seen = self.last_seen.max(newer.last_seen);
    }

    /// User named in the payload, if any
    pub fn user_id(&self) -> Option<&str> {
        self.payload.get("user_id").and_then(|v| v.as_str())
    }

    /// Human readable summary carried in the payload, if any
    pub fn summary(&self) -> Option<&str> {
        self.payload
            .get("summary")
            .or_else(|| self.payload.get("description"))
            .and_then(|v| v.as_str())
    }

    /// What the pattern is about, free of any question wording.
    ///
    /// The summary when there is one, otherwise every scalar in the payload
    /// except the user id. Empty when the detector sent nothing descriptive.
    pub fn content(&self) -> String {
        if let Some(summary) = self.summary() {
            return summary.trim().to_string();
        }
        let mut words = Vec::new();
        collect_scalars(&self.payload, &mut words);
        words.join(" ")
    }
}

fn collect_scalars(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Number(n) => out.push(n.to_string()),
        serde_json::Value::Bool(b) => out.push(b.to_string()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_scalars(v, out)),
        serde_json::Value::Object(map) => map
            .iter()
            .filter(|(key, _)| key.as_str() != "user_id")
            .for_each(|(_, v)| collect_scalars(v, out)),
        serde_json::Value::Null => {}
    }
}

impl Storable for Pattern {
    const KIND: &'static str = "pattern";

    fn storage_key(&self) -> String {
        format!("pattern:{}", self.pattern_id)
    }

    fn tags(&self) -> Vec<String> {
        vec!["pattern".to_string(), format!("category:{}", self.category)]
    }

    fn confidence(&self) -> Option<f64> {
        Some(self.confidence)
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

/// A question that may be put to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question_id: String,
    pub pattern_id: String,
    pub user_id: String,
    /// Category of the originating pattern
    pub topic: String,
    pub question_text: String,
    pub question_type: QuestionType,
    pub priority: Priority,
    pub status: QuestionStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Shared by questions delivered together in one slot
    pub batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Situation in which a response was given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseContext {
    /// Local hour of day (0-23)
    pub hour: u32,
    pub weekday: Weekday,
    #[serde(default)]
    pub keyword_hits: Vec<String>,
}

impl ResponseContext {
    /// Snapshot the local time at which the response arrived
    pub fn at(local: DateTime<chrono::FixedOffset>, keyword_hits: Vec<String>) -> Self {
        Self {
            hour: local.hour(),
            weekday: local.weekday(),
            keyword_hits,
        }
    }
}

/// A user's answer to a delivered question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub response_id: String,
    pub question_id: String,
    pub answer: Answer,
    pub sentiment: Sentiment,
    pub responded_at: DateTime<Utc>,
    pub context: ResponseContext,
    /// Set once the learning engine has folded this response in
    #[serde(default)]
    pub learned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pattern(confidence: f64, at: DateTime<Utc>) -> Pattern {
        Pattern {
            pattern_id: "p1".to_string(),
            category: "testing".to_string(),
            confidence,
            evidence_count: 3,
            first_seen: at,
            last_seen: at,
            payload: serde_json::json!({"user_id": "alice", "summary": "runs tests before commit"}),
        }
    }

    #[test]
    fn test_merge_sighting_keeps_first_seen() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut old = pattern(0.6, t0);
        let newer = pattern(0.9, t1);
        old.merge_sighting(&newer);
        assert_eq!(old.first_seen, t0);
        assert_eq!(old.last_seen, t1);
        assert_eq!(old.confidence, 0.9);
    }

    #[test]
    fn test_pattern_storable_metadata() {
        let p = pattern(0.7, Utc::now());
        assert_eq!(p.storage_key(), "pattern:p1");
        assert!(p.tags().contains(&"category:testing".to_string()));
        assert_eq!(p.user_id(), Some("alice"));
        assert_eq!(p.summary(), Some("runs tests before commit"));
    }

    #[test]
    fn test_content_skips_user_and_template() {
        let mut p = pattern(0.7, Utc::now());
        assert_eq!(p.content(), "runs tests before commit");

        p.payload = serde_json::json!({"user_id": "alice", "command": "cargo fmt", "files": ["src/lib.rs"]});
        let content = p.content();
        assert!(content.contains("cargo fmt") && content.contains("src/lib.rs"));
        assert!(!content.contains("alice"));

        p.payload = serde_json::json!({"user_id": "alice"});
        assert!(p.content().is_empty());
    }
}
