//! Process runtime
//!
//! Wires the store, bus, learning engine and protocol together and runs
//! the background loops:
//! - pattern consumer: `pattern.detected` -> [`HitlProtocol::submit`]
//! - response consumer: `question.response` -> [`HitlProtocol::record_response`]
//! - scheduler: expiry, delivery and log purge on a fixed period
//! - recalculation: learns from responses missed while the engine was down

mod cancel;
mod workers;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{MessageBus, RecoveryReport, Topic};
use crate::clock::SharedClock;
use crate::config::{Config, ConfigWatcher, SharedConfig};
use crate::hitl::HitlProtocol;
use crate::preference::PreferenceEngine;
use crate::store::Store;

pub use cancel::CancellationToken;

/// All long-lived components of one process
pub struct Runtime {
    config: SharedConfig,
    store: Arc<Store>,
    bus: Arc<MessageBus>,
    engine: Arc<PreferenceEngine>,
    protocol: Arc<HitlProtocol>,
    clock: SharedClock,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    watcher: Option<ConfigWatcher>,
    recovery: RecoveryReport,
}

impl Runtime {
    /// Open the store, recover the bus log and build the components
    pub async fn bootstrap(config: Config, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let path = config.store.resolve_path()?;
        let store = Arc::new(
            Store::open(&path, &config.store)
                .await
                .with_context(|| format!("Failed to open store at {}", path.display()))?,
        );
        info!("Store opened at {}", path.display());

        let config = config.into_shared();
        let (bus, recovery) = MessageBus::open(store.clone(), config.clone(), clock.clone())
            .await
            .context("Failed to recover message bus")?;
        if recovery.released > 0 {
            warn!("Released {} stale leases from a previous run", recovery.released);
        }

        let engine = Arc::new(PreferenceEngine::new(store.clone(), config.clone(), clock.clone()));
        let protocol = Arc::new(HitlProtocol::new(
            store.clone(),
            bus.clone(),
            engine.clone(),
            config.clone(),
            clock.clone(),
        ));

        Ok(Self {
            config,
            store,
            bus,
            engine,
            protocol,
            clock,
            token: CancellationToken::new(),
            tasks: Vec::new(),
            watcher: None,
            recovery,
        })
    }

    /// Reload configuration from `path` whenever it changes
    pub fn with_config_watcher(mut self, path: impl Into<std::path::PathBuf>) -> Result<Self> {
        self.watcher = Some(ConfigWatcher::spawn(path, self.config.clone())?);
        Ok(self)
    }

    /// Spawn the background loops
    pub async fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            anyhow::bail!("Runtime already started");
        }

        let (group, sweep, recalc, poll) = {
            let config = self.config.read().await;
            (
                config.runtime.consumer_group.clone(),
                Duration::from_secs(config.runtime.sweep_interval_secs),
                Duration::from_secs(config.runtime.recalc_interval_secs),
                config.bus.poll_interval(),
            )
        };

        let patterns = self.bus.subscribe(Topic::PatternDetected, group.clone())?;
        let protocol = self.protocol.clone();
        self.tasks.push(tokio::spawn(workers::consume(
            "Pattern",
            patterns,
            self.token.clone(),
            poll,
            move |delivery| {
                let protocol = protocol.clone();
                async move { workers::handle_pattern(&protocol, &delivery).await }
            },
        )));

        let responses = self.bus.subscribe(Topic::QuestionResponse, group)?;
        let protocol = self.protocol.clone();
        self.tasks.push(tokio::spawn(workers::consume(
            "Response",
            responses,
            self.token.clone(),
            poll,
            move |delivery| {
                let protocol = protocol.clone();
                async move { workers::handle_response(&protocol, &delivery).await }
            },
        )));

        self.tasks.push(tokio::spawn(workers::scheduler_loop(
            self.protocol.clone(),
            self.bus.clone(),
            sweep,
            self.token.clone(),
        )));
        self.tasks.push(tokio::spawn(workers::recalc_loop(
            self.engine.clone(),
            recalc,
            self.token.clone(),
        )));

        info!("Runtime started with {} background tasks", self.tasks.len());
        Ok(())
    }

    /// Stop the loops, close the bus and wait for every task to finish
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down runtime");
        self.token.cancel();
        self.bus.close();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.watcher = None;
        info!("Runtime stopped");
        Ok(())
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<PreferenceEngine> {
        &self.engine
    }

    pub fn protocol(&self) -> &Arc<HitlProtocol> {
        &self.protocol
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Cancelled when shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// What bus recovery found at startup
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }
}
