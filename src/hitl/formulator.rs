//! Question wording

use crate::store::Pattern;

/// Turns a pattern into the text put to the user
pub trait QuestionFormulator: Send + Sync {
    fn formulate(&self, pattern: &Pattern) -> String;
}

/// Fixed templates filled from the pattern
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateFormulator;

impl QuestionFormulator for TemplateFormulator {
    fn formulate(&self, pattern: &Pattern) -> String {
        match pattern.summary() {
            Some(summary) => format!(
                "I noticed that you {}. Should I take care of this for you from now on?",
                summary.trim().trim_end_matches('.')
            ),
            None => format!(
                "I noticed a recurring {} pattern ({} sightings). Should I handle it automatically?",
                pattern.category, pattern.evidence_count
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pattern(payload: serde_json::Value) -> Pattern {
        Pattern {
            pattern_id: "p1".into(),
            category: "git".into(),
            confidence: 0.9,
            evidence_count: 6,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            payload,
        }
    }

    #[test]
    fn test_uses_summary_when_present() {
        let text = TemplateFormulator.formulate(&pattern(serde_json::json!({"summary": "rebase before pushing."})));
        assert_eq!(
            text,
            "I noticed that you rebase before pushing. Should I take care of this for you from now on?"
        );
    }

    #[test]
    fn test_falls_back_to_category() {
        let text = TemplateFormulator.formulate(&pattern(serde_json::Value::Null));
        assert!(text.contains("recurring git pattern (6 sightings)"));
    }
}
