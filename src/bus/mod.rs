//! Durable message bus
//!
//! Topic-based publish/subscribe on top of the store's message log.
//! Delivery is at-least-once: a subscriber leases a message, and the
//! message becomes claimable again if the lease runs out before `ack`.
//! Consumer groups on one topic compete for messages; within a topic the
//! next message is always the highest priority, oldest first.

mod broker;
mod message;

use async_trait::async_trait;
use thiserror::Error;

use crate::retry::Transient;
use crate::store::StoreError;
use crate::types::Priority;

pub use broker::{MessageBus, RecoveryReport, Subscription};
pub use message::{Delivery, Message, Payload, Topic};

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    /// The topic's in-flight ceiling is reached
    #[error("topic {topic} is full ({inflight} unacked messages)")]
    Backpressure { topic: Topic, inflight: usize },

    #[error("lease on message {0} expired before ack")]
    LeaseExpired(String),

    #[error("bus is closed")]
    Closed,

    #[error("message {0} not found")]
    NotFound(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Transient for BusError {
    fn is_transient(&self) -> bool {
        match self {
            BusError::Backpressure { .. } | BusError::LeaseExpired(_) => true,
            BusError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Capability to publish onto the bus
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Durably enqueue `payload` on `topic`, returning the message id
    async fn publish(
        &self,
        topic: Topic,
        payload: Payload,
        priority: Priority,
        correlation_id: Option<String>,
    ) -> Result<String, BusError>;
}

/// Capability to consume one topic
#[async_trait]
pub trait Subscriber: Send {
    /// Wait for the next leased message
    async fn next(&mut self) -> Result<Delivery, BusError>;

    /// Acknowledge a delivery so it is never redelivered
    async fn ack(&self, message_id: &str) -> Result<(), BusError>;
}
