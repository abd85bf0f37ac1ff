//! When a question may interrupt the user

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use super::HitlError;
use crate::config::PolicyConfig;
use crate::store::Storable;

/// The user asked not to be interrupted until `until`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusMarker {
    pub user_id: String,
    pub until: DateTime<Utc>,
    pub set_at: DateTime<Utc>,
}

impl FocusMarker {
    pub fn key_for(user_id: &str) -> String {
        format!("focus:{}", user_id)
    }

    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.until > at
    }
}

impl Storable for FocusMarker {
    const KIND: &'static str = "focus";

    fn storage_key(&self) -> String {
        Self::key_for(&self.user_id)
    }

    fn tags(&self) -> Vec<String> {
        vec!["focus".to_string(), format!("user:{}", self.user_id)]
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.set_at
    }
}

/// Quiet-hours and focus rules for one decision
pub(crate) struct Window<'a> {
    policy: &'a PolicyConfig,
    offset: FixedOffset,
    focus_until: Option<DateTime<Utc>>,
}

impl<'a> Window<'a> {
    pub(crate) fn new(policy: &'a PolicyConfig, focus: Option<&FocusMarker>, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            offset: policy.utc_offset(),
            focus_until: focus.filter(|f| f.is_active(now)).map(|f| f.until),
        }
    }

    pub(crate) fn in_quiet_hours(&self, at: DateTime<Utc>) -> Result<bool, HitlError> {
        self.policy
            .quiet_hours
            .contains(at.with_timezone(&self.offset).time())
            .map_err(HitlError::config)
    }

    /// Whether a question may be delivered at `at`
    pub(crate) fn is_open(&self, at: DateTime<Utc>) -> Result<bool, HitlError> {
        if self.focus_until.is_some_and(|until| at < until) {
            return Ok(false);
        }
        Ok(!self.in_quiet_hours(at)?)
    }

    /// First instant at or after `at` outside quiet hours and focus
    pub(crate) fn next_open(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, HitlError> {
        let mut slot = at;
        if let Some(until) = self.focus_until {
            slot = slot.max(until);
        }
        self.policy
            .quiet_hours
            .next_open(slot, self.offset)
            .map_err(HitlError::config)
    }

    /// Next open instant honouring the minimum gap after `last`
    pub(crate) fn after_interval(
        &self,
        at: DateTime<Utc>,
        last: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, HitlError> {
        let gap: Duration = self.policy.min_question_interval();
        let earliest = match last {
            Some(last) if last + gap > at => last + gap,
            _ => at,
        };
        self.next_open(earliest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_defer_to_morning() {
        let policy = PolicyConfig::default();
        let window = Window::new(&policy, None, at(23, 0));
        assert!(!window.is_open(at(23, 0)).unwrap());
        assert_eq!(
            window.next_open(at(23, 0)).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap()
        );
        assert_eq!(window.next_open(at(9, 0)).unwrap(), at(9, 0));
    }

    #[test]
    fn test_focus_defers_until_it_ends() {
        let policy = PolicyConfig::default();
        let focus = FocusMarker {
            user_id: "alice".into(),
            until: at(11, 0),
            set_at: at(9, 0),
        };
        let window = Window::new(&policy, Some(&focus), at(9, 30));
        assert!(!window.is_open(at(10, 0)).unwrap());
        assert_eq!(window.next_open(at(9, 30)).unwrap(), at(11, 0));

        // Expired markers are ignored
        let window = Window::new(&policy, Some(&focus), at(12, 0));
        assert!(window.is_open(at(12, 0)).unwrap());
    }

    #[test]
    fn test_interval_after_last_slot() {
        let policy = PolicyConfig::default();
        let window = Window::new(&policy, None, at(9, 0));
        assert_eq!(window.after_interval(at(9, 0), Some(at(8, 45))).unwrap(), at(9, 15));
        assert_eq!(window.after_interval(at(9, 0), Some(at(7, 0))).unwrap(), at(9, 0));
        assert_eq!(window.after_interval(at(9, 0), None).unwrap(), at(9, 0));
    }
}
