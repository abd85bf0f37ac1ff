//! Configuration management
//!
//! Manages store, bus, question policy, learning and runtime settings.
//! The file is TOML and is hot-reloaded into a [`SharedConfig`] by
//! [`ConfigWatcher`].

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bus::Topic;

/// Configuration shared between components and swapped on reload
pub type SharedConfig = Arc<RwLock<Config>>;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file; defaults to `<data_dir>/hitl.db`
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// SQLite busy timeout (milliseconds)
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
    /// Attempts for a conflicting write before surfacing contention
    #[serde(default = "default_write_attempts")]
    pub max_write_attempts: u32,
    /// Base backoff between write attempts (milliseconds)
    #[serde(default = "default_write_backoff")]
    pub write_backoff_ms: u64,
}

fn default_busy_timeout() -> u64 { 250 }
fn default_write_attempts() -> u32 { 3 }
fn default_write_backoff() -> u64 { 20 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout(),
            max_write_attempts: default_write_attempts(),
            write_backoff_ms: default_write_backoff(),
        }
    }
}

impl StoreConfig {
    /// Resolve the database path
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("hitl.db")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Seconds a consumer holds a message before it becomes redeliverable
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
    /// How often an idle subscription re-checks the log (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Maximum unacked messages per topic
    #[serde(default = "default_inflight_ceiling")]
    pub inflight_ceiling: usize,
    /// Per-topic overrides of `inflight_ceiling`, keyed by topic name
    #[serde(default)]
    pub topic_ceilings: HashMap<String, usize>,
    /// Suspend `publish` under backpressure instead of failing
    #[serde(default = "default_true")]
    pub blocking_publish: bool,
}

fn default_lease_timeout() -> u64 { 30 }
fn default_poll_interval() -> u64 { 500 }
fn default_inflight_ceiling() -> usize { 1000 }

fn default_true() -> bool {
    true
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: default_lease_timeout(),
            poll_interval_ms: default_poll_interval(),
            inflight_ceiling: default_inflight_ceiling(),
            topic_ceilings: HashMap::new(),
            blocking_publish: true,
        }
    }
}

impl BusConfig {
    pub fn lease_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.lease_timeout_secs as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// In-flight ceiling for a topic
    pub fn ceiling_for(&self, topic: Topic) -> usize {
        self.topic_ceilings
            .get(topic.as_str())
            .copied()
            .unwrap_or(self.inflight_ceiling)
    }
}

/// Daily window during which no question is delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    /// Start of the quiet window (HH:MM, 24h format)
    pub start: String,
    /// End of the quiet window (HH:MM, 24h format)
    pub end: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            start: "22:00".to_string(),
            end: "08:00".to_string(),
        }
    }
}

impl QuietHours {
    fn parse(value: &str) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(value, "%H:%M")
            .with_context(|| format!("Invalid time of day '{}', expected HH:MM", value))
    }

    /// Check whether a local time of day falls in the window
    pub fn contains(&self, time: NaiveTime) -> Result<bool> {
        let start = Self::parse(&self.start)?;
        let end = Self::parse(&self.end)?;
        Ok(if start == end {
            false
        } else if start < end {
            time >= start && time < end
        } else {
            // Window wraps midnight
            time >= start || time < end
        })
    }

    /// First instant at or after `at` that lies outside the window
    pub fn next_open(&self, at: DateTime<Utc>, offset: FixedOffset) -> Result<DateTime<Utc>> {
        let local = at.with_timezone(&offset);
        if !self.contains(local.time())? {
            return Ok(at);
        }
        let end = Self::parse(&self.end)?;
        let mut date = local.date_naive();
        if local.time() >= end {
            date = date.succ_opt().context("Date overflow computing quiet hours end")?;
        }
        let open = offset
            .from_local_datetime(&date.and_time(end))
            .single()
            .context("Ambiguous local time for quiet hours end")?;
        Ok(open.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Minimum evidence before a pattern may become a question
    #[serde(default = "default_min_evidence")]
    pub min_evidence_count: u32,
    /// Minimum pattern confidence before a pattern may become a question
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Pattern confidence at which a question counts as high value
    #[serde(default = "default_high_value_confidence")]
    pub high_value_confidence: f64,
    /// Cap on questions per user in any rolling 24h window
    #[serde(default = "default_max_per_day")]
    pub max_questions_per_day: u32,
    /// Minimum spacing between deliveries (seconds)
    #[serde(default = "default_min_interval")]
    pub min_question_interval_secs: u64,
    #[serde(default)]
    pub quiet_hours: QuietHours,
    /// Offset of the user's local time from UTC (minutes)
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Window after a NO answer during which the same pattern is suppressed (hours)
    #[serde(default = "default_duplicate_cooldown")]
    pub duplicate_cooldown_hours: u64,
    /// Window in which near-duplicate questions are suppressed (hours)
    #[serde(default = "default_near_duplicate_window")]
    pub near_duplicate_window_hours: u64,
    /// Word-overlap similarity at which two questions count as duplicates
    #[serde(default = "default_similarity")]
    pub near_duplicate_similarity: f64,
    /// Time before an undelivered question expires (hours)
    #[serde(default = "default_ttl")]
    pub question_ttl_hours: u64,
    /// Join compatible scheduled questions into one delivery slot
    #[serde(default = "default_true")]
    pub batching: bool,
    /// User assigned when a pattern does not name one
    #[serde(default = "default_user")]
    pub default_user_id: String,
}

fn default_min_evidence() -> u32 { 3 }
fn default_min_confidence() -> f64 { 0.6 }
fn default_high_value_confidence() -> f64 { 0.8 }
fn default_max_per_day() -> u32 { 5 }
fn default_min_interval() -> u64 { 1800 }
fn default_duplicate_cooldown() -> u64 { 168 }
fn default_near_duplicate_window() -> u64 { 24 }
fn default_similarity() -> f64 { 0.7 }
fn default_ttl() -> u64 { 24 }
fn default_user() -> String { "default".to_string() }

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_evidence_count: default_min_evidence(),
            min_confidence: default_min_confidence(),
            high_value_confidence: default_high_value_confidence(),
            max_questions_per_day: default_max_per_day(),
            min_question_interval_secs: default_min_interval(),
            quiet_hours: QuietHours::default(),
            utc_offset_minutes: 0,
            duplicate_cooldown_hours: default_duplicate_cooldown(),
            near_duplicate_window_hours: default_near_duplicate_window(),
            near_duplicate_similarity: default_similarity(),
            question_ttl_hours: default_ttl(),
            batching: true,
            default_user_id: default_user(),
        }
    }
}

impl PolicyConfig {
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    pub fn min_question_interval(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.min_question_interval_secs as i64)
    }

    pub fn duplicate_cooldown(&self) -> ChronoDuration {
        ChronoDuration::hours(self.duplicate_cooldown_hours as i64)
    }

    pub fn near_duplicate_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.near_duplicate_window_hours as i64)
    }

    pub fn question_ttl(&self) -> ChronoDuration {
        ChronoDuration::hours(self.question_ttl_hours as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_initial_threshold")]
    pub initial_confidence_threshold: f64,
    #[serde(default = "default_min_threshold")]
    pub min_confidence_threshold: f64,
    #[serde(default = "default_max_threshold")]
    pub max_confidence_threshold: f64,
    #[serde(default = "default_initial_evidence")]
    pub initial_evidence_threshold: u32,
    #[serde(default = "default_min_evidence_threshold")]
    pub min_evidence_threshold: u32,
    #[serde(default = "default_max_evidence_threshold")]
    pub max_evidence_threshold: u32,
    /// Observations per threshold recalibration (never below 10)
    #[serde(default = "default_window")]
    pub window_size: usize,
    /// Window acceptance above which the threshold is lowered
    #[serde(default = "default_raise_above")]
    pub raise_above: f64,
    /// Window acceptance below which the threshold is raised
    #[serde(default = "default_lower_below")]
    pub lower_below: f64,
    /// Threshold multiplier applied on high acceptance
    #[serde(default = "default_lower_factor")]
    pub lower_factor: f64,
    /// Threshold multiplier applied on low acceptance
    #[serde(default = "default_raise_factor")]
    pub raise_factor: f64,
    /// Pseudo-count used to smooth sparse dimensions
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
    /// Acceptance assumed for a dimension before evidence arrives
    #[serde(default = "default_prior")]
    pub prior_acceptance: f64,
    /// Weight of the pattern's own confidence in the blended score
    #[serde(default = "default_pattern_weight")]
    pub pattern_weight: f64,
    /// Confidence reported when no dimension has history
    #[serde(default = "default_cold_start")]
    pub cold_start_confidence: f64,
    /// Success/failure context samples kept per profile
    #[serde(default = "default_context_samples")]
    pub context_samples: usize,
    /// Observations required before insights are reported
    #[serde(default = "default_min_insight_obs")]
    pub min_observations_for_insights: u64,
    /// Vocabulary tracked by the keyword dimension
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

fn default_initial_threshold() -> f64 { 0.5 }
fn default_min_threshold() -> f64 { 0.2 }
fn default_max_threshold() -> f64 { 0.9 }
fn default_initial_evidence() -> u32 { 3 }
fn default_min_evidence_threshold() -> u32 { 1 }
fn default_max_evidence_threshold() -> u32 { 10 }
fn default_window() -> usize { 10 }
fn default_raise_above() -> f64 { 0.70 }
fn default_lower_below() -> f64 { 0.30 }
fn default_lower_factor() -> f64 { 0.9 }
fn default_raise_factor() -> f64 { 1.1 }
fn default_smoothing() -> f64 { 2.0 }
fn default_prior() -> f64 { 0.5 }
fn default_pattern_weight() -> f64 { 0.5 }
fn default_cold_start() -> f64 { 0.3 }
fn default_context_samples() -> usize { 50 }
fn default_min_insight_obs() -> u64 { 5 }

fn default_keywords() -> Vec<String> {
    [
        "test", "build", "deploy", "refactor", "cleanup", "dependency", "security",
        "performance", "docs", "backup", "schedule", "meeting", "email", "commit",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            initial_confidence_threshold: default_initial_threshold(),
            min_confidence_threshold: default_min_threshold(),
            max_confidence_threshold: default_max_threshold(),
            initial_evidence_threshold: default_initial_evidence(),
            min_evidence_threshold: default_min_evidence_threshold(),
            max_evidence_threshold: default_max_evidence_threshold(),
            window_size: default_window(),
            raise_above: default_raise_above(),
            lower_below: default_lower_below(),
            lower_factor: default_lower_factor(),
            raise_factor: default_raise_factor(),
            smoothing: default_smoothing(),
            prior_acceptance: default_prior(),
            pattern_weight: default_pattern_weight(),
            cold_start_confidence: default_cold_start(),
            context_samples: default_context_samples(),
            min_observations_for_insights: default_min_insight_obs(),
            keywords: default_keywords(),
        }
    }
}

impl LearningConfig {
    /// Recalibration window, floored at 10 observations
    pub fn window(&self) -> usize {
        self.window_size.max(10)
    }

    pub fn clamp_threshold(&self, value: f64) -> f64 {
        value.clamp(self.min_confidence_threshold, self.max_confidence_threshold)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Time budget for one scheduling decision or learning update (milliseconds)
    #[serde(default = "default_budget")]
    pub operation_budget_ms: u64,
    /// Attempts for a budgeted operation before a recoverable error
    #[serde(default = "default_retries")]
    pub max_attempts: u32,
    /// Base backoff between budgeted attempts (milliseconds)
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,
    /// Seconds between delivery/expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Seconds between preference catch-up passes
    #[serde(default = "default_recalc_interval")]
    pub recalc_interval_secs: u64,
    /// Consumer group used by the protocol's subscriptions
    #[serde(default = "default_group")]
    pub consumer_group: String,
}

fn default_budget() -> u64 { 200 }
fn default_retries() -> u32 { 3 }
fn default_retry_base() -> u64 { 25 }
fn default_sweep_interval() -> u64 { 60 }
fn default_recalc_interval() -> u64 { 300 }
fn default_group() -> String { "hitl".to_string() }

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            operation_budget_ms: default_budget(),
            max_attempts: default_retries(),
            retry_base_ms: default_retry_base(),
            sweep_interval_secs: default_sweep_interval(),
            recalc_interval_secs: default_recalc_interval(),
            consumer_group: default_group(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            bus: BusConfig::default(),
            policy: PolicyConfig::default(),
            learning: LearningConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default file, creating it when missing
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject settings that would make the policies meaningless
    pub fn validate(&self) -> Result<()> {
        let learning = &self.learning;
        if learning.min_confidence_threshold > learning.max_confidence_threshold {
            anyhow::bail!("learning.min_confidence_threshold exceeds max_confidence_threshold");
        }
        if learning.min_evidence_threshold > learning.max_evidence_threshold {
            anyhow::bail!("learning.min_evidence_threshold exceeds max_evidence_threshold");
        }
        if learning.lower_below > learning.raise_above {
            anyhow::bail!("learning.lower_below must not exceed learning.raise_above");
        }
        if !(0.0..=1.0).contains(&self.policy.min_confidence) {
            anyhow::bail!("policy.min_confidence must lie in [0, 1]");
        }
        if self.policy.max_questions_per_day == 0 {
            anyhow::bail!("policy.max_questions_per_day must be at least 1");
        }
        if learning.window_size < 10 {
            warn!(
                "learning.window_size {} is below 10; using 10",
                learning.window_size
            );
        }
        QuietHours::parse(&self.policy.quiet_hours.start)?;
        QuietHours::parse(&self.policy.quiet_hours.end)?;
        Ok(())
    }

    /// Wrap into a handle that can be shared and reloaded
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "hitl-agent", "hitl-agent")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "hitl-agent", "hitl-agent")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}

/// Reloads the config file into a [`SharedConfig`] whenever it changes
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Start watching `path`; changes replace the contents of `shared`
    pub fn spawn(path: impl Into<PathBuf>, shared: SharedConfig) -> Result<Self> {
        let path = path.into();
        let watch_dir = path
            .parent()
            .map(Path::to_path_buf)
            .context("Config path has no parent")?;
        let target = path.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("Config watch error: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            if !event.paths.iter().any(|p| p.file_name() == target.file_name()) {
                return;
            }
            match Config::load_from(&target) {
                Ok(config) => {
                    *shared.blocking_write() = config;
                    info!("Reloaded configuration from {}", target.display());
                }
                Err(e) => warn!("Ignoring invalid configuration change: {:#}", e),
            }
        })
        .context("Failed to create config watcher")?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", watch_dir.display()))?;

        info!("Watching {} for configuration changes", path.display());
        Ok(Self {
            _watcher: watcher,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_default_roundtrip_toml() {
        let text = default_config_toml();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.policy.max_questions_per_day, 5);
        assert_eq!(parsed.learning.window(), 10);
        parsed.validate().unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[bus]\nlease_timeout_secs = 5\n").unwrap();
        assert_eq!(parsed.bus.lease_timeout_secs, 5);
        assert_eq!(parsed.bus.inflight_ceiling, 1000);
        assert_eq!(parsed.policy.quiet_hours, QuietHours::default());
    }

    #[test]
    fn test_topic_ceiling_override() {
        let mut bus = BusConfig::default();
        bus.topic_ceilings.insert("question.deliver".to_string(), 3);
        assert_eq!(bus.ceiling_for(Topic::DeliverQuestion), 3);
        assert_eq!(bus.ceiling_for(Topic::PatternDetected), 1000);
    }

    #[test]
    fn test_quiet_hours_wrapping_midnight() {
        let quiet = QuietHours::default();
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(quiet.contains(t(23, 0)).unwrap());
        assert!(quiet.contains(t(3, 0)).unwrap());
        assert!(!quiet.contains(t(8, 0)).unwrap());
        assert!(!quiet.contains(t(12, 0)).unwrap());
    }

    #[test]
    fn test_quiet_hours_next_open() {
        let quiet = QuietHours::default();
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            quiet.next_open(at("2026-03-02T23:30:00Z"), utc).unwrap(),
            at("2026-03-03T08:00:00Z")
        );
        assert_eq!(
            quiet.next_open(at("2026-03-02T02:00:00Z"), utc).unwrap(),
            at("2026-03-02T08:00:00Z")
        );
        assert_eq!(
            quiet.next_open(at("2026-03-02T09:00:00Z"), utc).unwrap(),
            at("2026-03-02T09:00:00Z")
        );
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = Config::default();
        config.learning.min_confidence_threshold = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.policy.max_questions_per_day = 7;
        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.policy.max_questions_per_day, 7);
    }
}
