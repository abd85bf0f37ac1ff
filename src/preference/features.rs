//! Decision features and keyword extraction

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use super::profile::{day_key, Dimension, TimeBucket};
use crate::types::QuestionType;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9][a-z0-9_'-]*").unwrap());

/// Lowercased word set of `text`
pub fn tokens(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    WORD.find_iter(&lower)
        .map(|m| m.as_str().trim_matches(|c| c == '\'' || c == '-').to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Configured keywords that occur in `text`
pub fn keyword_hits(text: &str, keywords: &[String]) -> Vec<String> {
    let words = tokens(text);
    let mut hits: Vec<String> = keywords
        .iter()
        .map(|k| k.to_lowercase())
        .filter(|k| words.contains(k))
        .collect();
    hits.sort();
    hits.dedup();
    hits
}

/// Word-level Jaccard similarity in `[0, 1]`
pub fn word_similarity(a: &str, b: &str) -> f64 {
    let a = tokens(a);
    let b = tokens(b);
    let union = a.union(&b).count();
    if union == 0 {
        return if a.is_empty() && b.is_empty() { 1.0 } else { 0.0 };
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// What the engine knows about a prospective question
#[derive(Debug, Clone)]
pub struct Features {
    pub user_id: String,
    pub question_type: QuestionType,
    pub topic: String,
    /// Local time at which the question would be asked
    pub at: DateTime<FixedOffset>,
    pub keywords: Vec<String>,
    /// Confidence reported by the pattern detector
    pub pattern_confidence: f64,
}

impl Features {
    pub fn time_bucket(&self) -> TimeBucket {
        TimeBucket::from_hour(self.at.hour())
    }

    /// `(dimension, key)` pairs this question would be scored on
    pub fn dimension_keys(&self) -> Vec<(Dimension, String)> {
        let mut keys = vec![
            (Dimension::QuestionType, self.question_type.as_str().to_string()),
            (Dimension::TimeBucket, self.time_bucket().as_str().to_string()),
            (Dimension::Day, day_key(self.at.weekday())),
            (Dimension::Topic, self.topic.clone()),
        ];
        keys.extend(self.keywords.iter().map(|k| (Dimension::Keyword, k.clone())));
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_keyword_hits_are_whole_words() {
        let keywords = vec!["deploy".to_string(), "test".to_string()];
        assert_eq!(keyword_hits("Deploy after the tests pass", &keywords), vec!["deploy"]);
        assert!(keyword_hits("", &keywords).is_empty());
    }

    #[test]
    fn test_word_similarity() {
        assert_eq!(word_similarity("run the tests", "Run the tests!"), 1.0);
        let s = word_similarity("should I run the tests before commit", "should I run the linter before commit");
        assert!(s > 0.6 && s < 0.8, "{}", s);
        assert_eq!(word_similarity("alpha", "beta"), 0.0);
    }

    #[test]
    fn test_dimension_keys() {
        let at = FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let features = Features {
            user_id: "alice".into(),
            question_type: QuestionType::HighValue,
            topic: "testing".into(),
            at,
            keywords: vec!["deploy".into()],
            pattern_confidence: 0.85,
        };
        let keys = features.dimension_keys();
        assert!(keys.contains(&(Dimension::TimeBucket, "morning".to_string())));
        assert!(keys.contains(&(Dimension::Day, "mon".to_string())));
        assert!(keys.contains(&(Dimension::Keyword, "deploy".to_string())));
    }
}
