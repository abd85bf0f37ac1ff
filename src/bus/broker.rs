//! Message bus over the store's message log

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::message::{Delivery, Message, Payload, Topic};
use super::{BusError, Publisher, Subscriber};
use crate::clock::SharedClock;
use crate::config::SharedConfig;
use crate::store::{AckOutcome, AppendOutcome, LogEntry, LogStats, Store};
use crate::types::Priority;

/// State of the log after [`MessageBus::recover`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale leases dropped so their messages can be redelivered
    pub released: usize,
    pub stats: LogStats,
}

/// Topic-based publish/subscribe with durable, leased delivery
pub struct MessageBus {
    store: Arc<Store>,
    config: SharedConfig,
    clock: SharedClock,
    /// Wakes subscribers after a local publish
    published: Notify,
    /// Wakes blocked publishers after an ack
    capacity: Notify,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new(store: Arc<Store>, config: SharedConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
            published: Notify::new(),
            capacity: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Create the bus and recover the log left by a previous process
    pub async fn open(
        store: Arc<Store>,
        config: SharedConfig,
        clock: SharedClock,
    ) -> Result<(Arc<Self>, RecoveryReport), BusError> {
        let bus = Arc::new(Self::new(store, config, clock));
        let report = bus.recover().await?;
        Ok((bus, report))
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// Publish, suspending under backpressure when the bus is in blocking mode
    pub async fn publish(
        &self,
        topic: Topic,
        payload: Payload,
        priority: Priority,
        correlation_id: Option<String>,
    ) -> Result<String, BusError> {
        let blocking = self.config.read().await.bus.blocking_publish;
        self.publish_inner(topic, payload, priority, correlation_id, blocking)
            .await
    }

    /// Publish, failing with [`BusError::Backpressure`] instead of waiting
    pub async fn try_publish(
        &self,
        topic: Topic,
        payload: Payload,
        priority: Priority,
        correlation_id: Option<String>,
    ) -> Result<String, BusError> {
        self.publish_inner(topic, payload, priority, correlation_id, false)
            .await
    }

    async fn publish_inner(
        &self,
        topic: Topic,
        payload: Payload,
        priority: Priority,
        correlation_id: Option<String>,
        blocking: bool,
    ) -> Result<String, BusError> {
        self.ensure_open()?;
        payload.validate(topic)?;

        let body = serde_json::to_string(&payload).map_err(crate::store::StoreError::from)?;
        let entry = LogEntry::new(
            Uuid::new_v4().to_string(),
            topic.as_str(),
            body,
            priority.rank(),
            correlation_id,
            self.clock.now(),
        );

        loop {
            let (ceiling, poll) = {
                let config = self.config.read().await;
                (config.bus.ceiling_for(topic), config.bus.poll_interval())
            };

            match self.store.append_message(&entry, ceiling).await? {
                AppendOutcome::Appended { seq } => {
                    debug!(
                        "Published {} on {} (seq {}, priority {})",
                        entry.message_id, topic, seq, priority
                    );
                    self.published.notify_waiters();
                    return Ok(entry.message_id);
                }
                AppendOutcome::Full(inflight) if !blocking => {
                    return Err(BusError::Backpressure { topic, inflight });
                }
                AppendOutcome::Full(inflight) => {
                    debug!("{} is full ({} in flight), waiting for capacity", topic, inflight);
                    let _ = tokio::time::timeout(poll, self.capacity.notified()).await;
                    self.ensure_open()?;
                }
            }
        }
    }

    /// Open a subscription for `group` on `topic`
    pub fn subscribe(self: &Arc<Self>, topic: Topic, group: impl Into<String>) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        let group = group.into();
        debug!("Subscribed {} to {}", group, topic);
        Ok(Subscription {
            bus: Arc::clone(self),
            topic,
            group,
        })
    }

    /// Acknowledge a delivered message, whoever holds its lease
    pub async fn ack(&self, message_id: &str) -> Result<(), BusError> {
        self.ack_for(message_id, None).await
    }

    async fn ack_for(&self, message_id: &str, holder: Option<&str>) -> Result<(), BusError> {
        match self.store.ack_message(message_id, holder, self.clock.now()).await? {
            AckOutcome::Acked => {
                self.capacity.notify_waiters();
                Ok(())
            }
            AckOutcome::AlreadyAcked => Ok(()),
            AckOutcome::LeaseExpired => Err(BusError::LeaseExpired(message_id.to_string())),
            AckOutcome::NotFound => Err(BusError::NotFound(message_id.to_string())),
        }
    }

    /// Release stale leases and report what the log holds
    pub async fn recover(&self) -> Result<RecoveryReport, BusError> {
        let now = self.clock.now();
        let released = self.store.release_expired_leases(now).await?;
        let stats = self.store.log_stats(None, now).await?;
        info!(
            "Bus recovered: {} pending, {} leased, {} acked, {} stale leases released",
            stats.pending, stats.leased, stats.acked, released
        );
        Ok(RecoveryReport { released, stats })
    }

    /// Refuse further publishes and subscriptions
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Message bus closed");
            self.published.notify_waiters();
            self.capacity.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Delete messages acked longer than `older_than` ago
    pub async fn purge_acked(&self, older_than: chrono::Duration) -> Result<usize, BusError> {
        let purged = self.store.purge_acked(self.clock.now() - older_than).await?;
        if purged > 0 {
            debug!("Purged {} acked messages", purged);
        }
        Ok(purged)
    }

    pub async fn stats(&self, topic: Option<Topic>) -> Result<LogStats, BusError> {
        Ok(self
            .store
            .log_stats(topic.map(|t| t.as_str()), self.clock.now())
            .await?)
    }

    /// Look up a message in the log
    pub async fn get(&self, message_id: &str) -> Result<Message, BusError> {
        let entry = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| BusError::NotFound(message_id.to_string()))?;
        Ok(Message {
            topic: entry.topic.parse()?,
            payload: decode_payload(&entry)?,
            priority: Priority::from_rank(entry.priority),
            message_id: entry.message_id,
            correlation_id: entry.correlation_id,
            created_at: entry.created_at,
            delivered_at: entry.delivered_at,
            ack_at: entry.ack_at,
        })
    }
}

fn decode_payload(entry: &LogEntry) -> Result<Payload, BusError> {
    serde_json::from_str(&entry.payload).map_err(|e| {
        BusError::InvalidPayload(format!("message {} payload: {}", entry.message_id, e))
    })
}

#[async_trait]
impl Publisher for MessageBus {
    async fn publish(
        &self,
        topic: Topic,
        payload: Payload,
        priority: Priority,
        correlation_id: Option<String>,
    ) -> Result<String, BusError> {
        MessageBus::publish(self, topic, payload, priority, correlation_id).await
    }
}

/// A consumer group's view of one topic.
///
/// Restartable: dropping it leaves unacked messages in the log, and a new
/// subscription picks them up once their leases run out.
pub struct Subscription {
    bus: Arc<MessageBus>,
    topic: Topic,
    group: String,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Lease the next message, waiting until one is available
    pub async fn next(&mut self) -> Result<Delivery, BusError> {
        let topic = self.topic.as_str();
        loop {
            self.bus.ensure_open()?;

            // Register before claiming so a publish in between is not missed
            let woken = self.bus.published.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            let (lease, poll) = {
                let config = self.bus.config.read().await;
                (config.bus.lease_timeout(), config.bus.poll_interval())
            };
            let now = self.bus.clock.now();

            if let Some(entry) = self
                .bus
                .store
                .claim_next(topic, &self.group, now, now + lease)
                .await?
            {
                let payload = match decode_payload(&entry) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Dropping undecodable message on {}: {}", topic, e);
                        self.ack(&entry.message_id).await?;
                        continue;
                    }
                };
                if entry.attempts > 1 {
                    warn!(
                        "Redelivering {} on {} to {} (attempt {})",
                        entry.message_id, topic, self.group, entry.attempts
                    );
                }
                return Ok(Delivery {
                    message_id: entry.message_id,
                    topic: self.topic,
                    payload,
                    priority: Priority::from_rank(entry.priority),
                    correlation_id: entry.correlation_id,
                    created_at: entry.created_at,
                    attempt: entry.attempts,
                    lease_expires_at: now + lease,
                });
            }

            let _ = tokio::time::timeout(poll, woken).await;
        }
    }

    /// Acknowledge a message this group leased
    pub async fn ack(&self, message_id: &str) -> Result<(), BusError> {
        self.bus.ack_for(message_id, Some(&self.group)).await
    }
}

#[async_trait]
impl Subscriber for Subscription {
    async fn next(&mut self) -> Result<Delivery, BusError> {
        Subscription::next(self).await
    }

    async fn ack(&self, message_id: &str) -> Result<(), BusError> {
        Subscription::ack(self, message_id).await
    }
}
