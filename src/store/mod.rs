//! Persistent store
//!
//! SQLite (WAL mode) is the single source of truth for patterns, questions,
//! responses, preference profiles and the bus message log. Every other
//! component is stateless and rebuilds its view from here.
//!
//! Writes run in short `BEGIN IMMEDIATE` transactions on a dedicated writer
//! connection; reads use a second connection so they never queue behind a
//! writer. Conflicting writes retry with bounded backoff before surfacing
//! [`StoreError::Contention`]. Detected corruption raises
//! [`StoreError::Integrity`] and blocks writes until [`Store::repair`]
//! succeeds.

pub mod log;
pub mod model;
pub mod questions;
pub mod records;
mod sqlite;

use thiserror::Error;

use crate::retry::Transient;

pub use log::{AckOutcome, AppendOutcome, LogEntry, LogStats};
pub use model::{Pattern, Question, ResponseContext, ResponseRecord};
pub use questions::{AnswerOutcome, DeliveryMark};
pub use records::{Record, RecordQuery, Storable, StoredRecord};
pub use sqlite::Store;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write kept conflicting with another writer
    #[error("write contention: {0}")]
    Contention(String),

    /// The database failed an integrity check; writes are blocked
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// A referenced row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity(reason.into())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Contention(e.to_string())
            }
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StoreError::Integrity(e.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

/// Timestamp encoding shared by every table.
///
/// Fixed-width UTC RFC 3339 so that SQL string comparison orders instants.
pub(crate) fn ts(at: &chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::integrity(format!("bad timestamp '{}': {}", value, e)))
}

pub(crate) fn parse_opt_ts(
    value: Option<String>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts(&ts(&b)).unwrap(), b);
    }

    #[test]
    fn test_bad_timestamp_is_integrity_error() {
        assert!(matches!(parse_ts("yesterday"), Err(StoreError::Integrity(_))));
    }

    #[test]
    fn test_contention_is_transient() {
        assert!(StoreError::Contention("busy".into()).is_transient());
        assert!(!StoreError::integrity("corrupt").is_transient());
        assert!(!StoreError::not_found("q1").is_transient());
    }
}
