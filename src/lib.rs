//! hitl-agent - Human-in-the-Loop Coordination Library
//!
//! Decides when an assistant should interrupt its user with a question:
//! - Durable topic bus with leased, at-least-once delivery and backpressure
//! - SQLite store for patterns, questions, responses and profiles
//! - Question protocol with quiet hours, focus, rate limits and batching
//! - Preference learning that tunes when and how often to ask
//!
//! # Example
//!
//! ```ignore
//! use hitl_agent::{Config, Runtime, SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut runtime = Runtime::bootstrap(Config::load()?, Arc::new(SystemClock)).await?;
//!     runtime.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod clock;
pub mod retry;
pub mod config;
pub mod store;
pub mod bus;
pub mod preference;
pub mod hitl;
pub mod runtime;
pub mod cli;

pub use bus::{BusError, Delivery, Message, MessageBus, Payload, Publisher, Subscriber, Subscription, Topic};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Config, SharedConfig};
pub use hitl::{HitlError, HitlProtocol, QuestionFormulator};
pub use preference::{LearnError, PreferenceEngine, PreferenceProfile, Recommendation};
pub use runtime::{CancellationToken, Runtime};
pub use store::{Pattern, Question, ResponseRecord, Store, StoreError};
pub use types::{Answer, Priority, QuestionStatus, QuestionType, Sentiment};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Human-in-the-Loop Coordination Library", NAME, VERSION)
}
