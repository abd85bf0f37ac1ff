//! Per-user preference profile

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::config::LearningConfig;
use crate::types::{Answer, QuestionType};

/// Answer counts along one dimension value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionStats {
    pub yes: u32,
    pub no: u32,
    pub later: u32,
}

impl DimensionStats {
    pub fn record(&mut self, answer: Answer) {
        match answer {
            Answer::Yes => self.yes += 1,
            Answer::No => self.no += 1,
            Answer::Later => self.later += 1,
        }
    }

    /// Answers that count towards acceptance (LATER excluded)
    pub fn decided(&self) -> u32 {
        self.yes + self.no
    }

    pub fn total(&self) -> u32 {
        self.yes + self.no + self.later
    }

    /// `yes / (yes + no)`, or `None` without any decided answer
    pub fn acceptance_rate(&self) -> Option<f64> {
        match self.decided() {
            0 => None,
            n => Some(self.yes as f64 / n as f64),
        }
    }

    /// Share of answers that were "ask me later"
    pub fn later_rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            n => Some(self.later as f64 / n as f64),
        }
    }
}

/// Independent axes along which acceptance is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    QuestionType,
    TimeBucket,
    Day,
    Topic,
    Keyword,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::QuestionType,
        Dimension::TimeBucket,
        Dimension::Day,
        Dimension::Topic,
        Dimension::Keyword,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::QuestionType => "question_type",
            Dimension::TimeBucket => "time_bucket",
            Dimension::Day => "day",
            Dimension::Topic => "topic",
            Dimension::Keyword => "keyword",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse time-of-day bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Night,
    Morning,
    Afternoon,
    Evening,
}

impl TimeBucket {
    /// night 22-05, morning 05-12, afternoon 12-17, evening 17-22
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeBucket::Morning,
            12..=16 => TimeBucket::Afternoon,
            17..=21 => TimeBucket::Evening,
            _ => TimeBucket::Night,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::Night => "night",
            TimeBucket::Morning => "morning",
            TimeBucket::Afternoon => "afternoon",
            TimeBucket::Evening => "evening",
        }
    }
}

/// Key used for the day-of-week dimension
pub fn day_key(day: Weekday) -> String {
    day.to_string().to_lowercase()
}

/// Context in which an answer was given, kept as a bounded sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSample {
    pub question_type: QuestionType,
    pub topic: String,
    pub hour: u32,
    pub weekday: Weekday,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub responded_at: DateTime<Utc>,
}

/// One answer as seen by the profile
#[derive(Debug, Clone)]
pub struct Observation {
    pub answer: Answer,
    pub sample: ContextSample,
}

/// Threshold movement caused by a recalibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Recalibration {
    /// The window was accepted often: ask sooner
    Lowered { from: f64, to: f64 },
    /// The window was rejected often: ask less
    Raised { from: f64, to: f64 },
    Unchanged,
}

/// Learned preferences of a single user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceProfile {
    pub user_id: String,
    #[serde(default)]
    pub by_question_type: BTreeMap<String, DimensionStats>,
    #[serde(default)]
    pub by_time_bucket: BTreeMap<String, DimensionStats>,
    #[serde(default)]
    pub by_day: BTreeMap<String, DimensionStats>,
    #[serde(default)]
    pub by_topic: BTreeMap<String, DimensionStats>,
    #[serde(default)]
    pub by_keyword: BTreeMap<String, DimensionStats>,
    pub confidence_threshold: f64,
    pub evidence_threshold: u32,
    #[serde(default)]
    pub success_samples: VecDeque<ContextSample>,
    #[serde(default)]
    pub failure_samples: VecDeque<ContextSample>,
    /// Outcomes since the last recalibration
    #[serde(default)]
    pub recent_outcomes: VecDeque<Answer>,
    #[serde(default)]
    pub observations: u64,
    pub last_updated: DateTime<Utc>,
}

impl PreferenceProfile {
    pub fn new(user_id: impl Into<String>, config: &LearningConfig, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            by_question_type: BTreeMap::new(),
            by_time_bucket: BTreeMap::new(),
            by_day: BTreeMap::new(),
            by_topic: BTreeMap::new(),
            by_keyword: BTreeMap::new(),
            confidence_threshold: config.clamp_threshold(config.initial_confidence_threshold),
            evidence_threshold: config
                .initial_evidence_threshold
                .clamp(config.min_evidence_threshold, config.max_evidence_threshold),
            success_samples: VecDeque::new(),
            failure_samples: VecDeque::new(),
            recent_outcomes: VecDeque::new(),
            observations: 0,
            last_updated: now,
        }
    }

    pub fn dimension(&self, dimension: Dimension) -> &BTreeMap<String, DimensionStats> {
        match dimension {
            Dimension::QuestionType => &self.by_question_type,
            Dimension::TimeBucket => &self.by_time_bucket,
            Dimension::Day => &self.by_day,
            Dimension::Topic => &self.by_topic,
            Dimension::Keyword => &self.by_keyword,
        }
    }

    fn dimension_mut(&mut self, dimension: Dimension) -> &mut BTreeMap<String, DimensionStats> {
        match dimension {
            Dimension::QuestionType => &mut self.by_question_type,
            Dimension::TimeBucket => &mut self.by_time_bucket,
            Dimension::Day => &mut self.by_day,
            Dimension::Topic => &mut self.by_topic,
            Dimension::Keyword => &mut self.by_keyword,
        }
    }

    /// Stats for one dimension value (zero when never seen)
    pub fn stats(&self, dimension: Dimension, key: &str) -> DimensionStats {
        self.dimension(dimension).get(key).copied().unwrap_or_default()
    }

    /// Whether any dimension has at least one answer
    pub fn has_history(&self) -> bool {
        Dimension::ALL
            .iter()
            .any(|d| self.dimension(*d).values().any(|s| s.total() > 0))
    }

    /// Fold one answer into every dimension and recalibrate on window boundaries
    pub fn observe(
        &mut self,
        observation: &Observation,
        config: &LearningConfig,
        now: DateTime<Utc>,
    ) -> Recalibration {
        let answer = observation.answer;
        let sample = &observation.sample;

        self.bump(Dimension::QuestionType, sample.question_type.as_str(), answer);
        self.bump(Dimension::TimeBucket, TimeBucket::from_hour(sample.hour).as_str(), answer);
        self.bump(Dimension::Day, &day_key(sample.weekday), answer);
        self.bump(Dimension::Topic, &sample.topic, answer);
        for keyword in &sample.keywords {
            self.bump(Dimension::Keyword, keyword, answer);
        }

        let cap = config.context_samples.max(1);
        match answer {
            Answer::Yes => push_bounded(&mut self.success_samples, sample.clone(), cap),
            Answer::No => push_bounded(&mut self.failure_samples, sample.clone(), cap),
            Answer::Later => {}
        }

        let window = config.window();
        push_bounded(&mut self.recent_outcomes, answer, window);
        self.observations += 1;
        self.last_updated = now;

        if self.observations % window as u64 == 0 {
            self.recalibrate(config)
        } else {
            Recalibration::Unchanged
        }
    }

    fn bump(&mut self, dimension: Dimension, key: &str, answer: Answer) {
        self.dimension_mut(dimension)
            .entry(key.to_string())
            .or_default()
            .record(answer);
    }

    fn recalibrate(&mut self, config: &LearningConfig) -> Recalibration {
        let mut window = DimensionStats::default();
        for answer in &self.recent_outcomes {
            window.record(*answer);
        }
        self.recent_outcomes.clear();

        let rate = match window.acceptance_rate() {
            Some(rate) => rate,
            None => return Recalibration::Unchanged,
        };
        let from = self.confidence_threshold;

        if rate > config.raise_above {
            self.confidence_threshold = config.clamp_threshold(from * config.lower_factor);
            self.evidence_threshold = self
                .evidence_threshold
                .saturating_sub(1)
                .max(config.min_evidence_threshold);
        } else if rate < config.lower_below {
            self.confidence_threshold = config.clamp_threshold(from * config.raise_factor);
            self.evidence_threshold = (self.evidence_threshold + 1).min(config.max_evidence_threshold);
        } else {
            return Recalibration::Unchanged;
        }

        let to = self.confidence_threshold;
        if to < from {
            Recalibration::Lowered { from, to }
        } else if to > from {
            Recalibration::Raised { from, to }
        } else {
            Recalibration::Unchanged
        }
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    ring.push_back(item);
    while ring.len() > cap {
        ring.pop_front();
    }
}
