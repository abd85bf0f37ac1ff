//! Shared fixture for integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use hitl_agent::{
    Config, HitlProtocol, ManualClock, MessageBus, Pattern, PreferenceEngine, SharedClock, Store,
};
use std::sync::Arc;
use tempfile::TempDir;

pub struct World {
    pub dir: TempDir,
    pub store: Arc<Store>,
    pub bus: Arc<MessageBus>,
    pub engine: Arc<PreferenceEngine>,
    pub protocol: HitlProtocol,
    pub clock: ManualClock,
}

pub fn monday(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.bus.poll_interval_ms = 10;
    config.runtime.operation_budget_ms = 5_000;
    config
}

pub async fn world(start: DateTime<Utc>) -> World {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();
    let store = Arc::new(Store::open(dir.path().join("hitl.db"), &config.store).await.unwrap());
    let config = config.into_shared();
    let clock = ManualClock::new(start);
    let shared: SharedClock = Arc::new(clock.clone());
    let (bus, _) = MessageBus::open(store.clone(), config.clone(), shared.clone())
        .await
        .unwrap();
    let engine = Arc::new(PreferenceEngine::new(store.clone(), config.clone(), shared.clone()));
    let protocol = HitlProtocol::new(store.clone(), bus.clone(), engine.clone(), config, shared);
    World {
        dir,
        store,
        bus,
        engine,
        protocol,
        clock,
    }
}

pub fn pattern(id: &str, category: &str, confidence: f64, evidence: u32, summary: &str) -> Pattern {
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
