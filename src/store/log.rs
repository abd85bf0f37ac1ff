//! Durable message log backing the bus

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_opt_ts, parse_ts, ts, Store, StoreError};

const ENTRY_COLUMNS: &str = "seq, message_id, topic, payload, priority, correlation_id, created_at, \
     delivered_at, ack_at, lease_owner, lease_expires_at, attempts";

/// One row of the message log
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Enqueue order, assigned on append
    pub seq: i64,
    pub message_id: String,
    pub topic: String,
    /// Serialized payload
    pub payload: String,
    pub priority: i64,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub ack_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl LogEntry {
    /// A fresh, never delivered entry
    pub fn new(
        message_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<String>,
        priority: i64,
        correlation_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            message_id: message_id.into(),
            topic: topic.into(),
            payload: payload.into(),
            priority,
            correlation_id,
            created_at,
            delivered_at: None,
            ack_at: None,
            lease_owner: None,
            lease_expires_at: None,
            attempts: 0,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            seq: row.get(0)?,
            message_id: row.get(1)?,
            topic: row.get(2)?,
            payload: row.get(3)?,
            priority: row.get(4)?,
            correlation_id: row.get(5)?,
            created_at: row.get(6)?,
            delivered_at: row.get(7)?,
            ack_at: row.get(8)?,
            lease_owner: row.get(9)?,
            lease_expires_at: row.get(10)?,
            attempts: row.get(11)?,
        })
    }
}

struct RawEntry {
    seq: i64,
    message_id: String,
    topic: String,
    payload: String,
    priority: i64,
    correlation_id: Option<String>,
    created_at: String,
    delivered_at: Option<String>,
    ack_at: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    attempts: i64,
}

impl RawEntry {
    fn decode(self) -> Result<LogEntry, StoreError> {
        Ok(LogEntry {
            seq: self.seq,
            message_id: self.message_id,
            topic: self.topic,
            payload: self.payload,
            priority: self.priority,
            correlation_id: self.correlation_id,
            created_at: parse_ts(&self.created_at)?,
            delivered_at: parse_opt_ts(self.delivered_at)?,
            ack_at: parse_opt_ts(self.ack_at)?,
            lease_owner: self.lease_owner,
            lease_expires_at: parse_opt_ts(self.lease_expires_at)?,
            attempts: self.attempts.max(0) as u32,
        })
    }
}

/// Result of appending to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { seq: i64 },
    /// The topic already holds this many unacked messages
    Full(usize),
}

/// Result of acknowledging a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    AlreadyAcked,
    /// No live lease: the message stays redeliverable
    LeaseExpired,
    NotFound,
}

/// Message counts by delivery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Unacked and not currently leased
    pub pending: u64,
    /// Unacked under a live lease
    pub leased: u64,
    pub acked: u64,
}

fn load_entry(conn: &Connection, message_id: &str) -> Result<Option<LogEntry>, StoreError> {
    let sql = format!("SELECT {} FROM messages WHERE message_id = ?1", ENTRY_COLUMNS);
    conn.query_row(&sql, params![message_id], LogEntry::from_row)
        .optional()?
        .map(RawEntry::decode)
        .transpose()
}

fn count_inflight(conn: &Connection, topic: &str) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE topic = ?1 AND ack_at IS NULL",
        params![topic],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

impl Store {
    /// Commit a message to the log unless its topic is at `ceiling` unacked messages
    pub async fn append_message(
        &self,
        entry: &LogEntry,
        ceiling: usize,
    ) -> Result<AppendOutcome, StoreError> {
        self.write("append message", |tx| {
            let inflight = count_inflight(tx, &entry.topic)?;
            if inflight >= ceiling {
                return Ok(AppendOutcome::Full(inflight));
            }
            tx.execute(
                "INSERT INTO messages (message_id, topic, payload, priority, correlation_id, created_at, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    entry.message_id,
                    entry.topic,
                    entry.payload,
                    entry.priority,
                    entry.correlation_id,
                    ts(&entry.created_at),
                ],
            )?;
            Ok(AppendOutcome::Appended { seq: tx.last_insert_rowid() })
        })
        .await
    }

    /// Lease the next deliverable message on `topic` to `group`.
    ///
    /// Deliverable means unacked with no live lease; the highest priority
    /// wins, then the oldest enqueue.
    pub async fn claim_next(
        &self,
        topic: &str,
        group: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<LogEntry>, StoreError> {
        let now_s = ts(&now);
        let until_s = ts(&lease_until);
        self.write("claim message", |tx| {
            let seq: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM messages
                     WHERE topic = ?1 AND ack_at IS NULL
                        AND (lease_expires_at IS NULL OR lease_expires_at <= ?2)
                     ORDER BY priority DESC, seq ASC LIMIT 1",
                    params![topic, now_s],
                    |row| row.get(0),
                )
                .optional()?;
            let seq = match seq {
                Some(seq) => seq,
                None => return Ok(None),
            };

            tx.execute(
                "UPDATE messages SET lease_owner = ?1, lease_expires_at = ?2,
                    delivered_at = COALESCE(delivered_at, ?3), attempts = attempts + 1
                 WHERE seq = ?4",
                params![group, until_s, now_s, seq],
            )?;

            let sql = format!("SELECT {} FROM messages WHERE seq = ?1", ENTRY_COLUMNS);
            let raw = tx.query_row(&sql, params![seq], LogEntry::from_row)?;
            raw.decode().map(Some)
        })
        .await
    }

    /// Acknowledge a leased message.
    ///
    /// With `holder` set, only that group's live lease can be acked; a lease
    /// re-claimed by another group reports [`AckOutcome::LeaseExpired`].
    pub async fn ack_message(
        &self,
        message_id: &str,
        holder: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AckOutcome, StoreError> {
        self.write("ack message", |tx| {
            let entry = match load_entry(tx, message_id)? {
                Some(entry) => entry,
                None => return Ok(AckOutcome::NotFound),
            };
            if entry.ack_at.is_some() {
                return Ok(AckOutcome::AlreadyAcked);
            }
            match entry.lease_expires_at {
                Some(until) if until > now => {}
                _ => return Ok(AckOutcome::LeaseExpired),
            }
            if holder.is_some_and(|group| entry.lease_owner.as_deref() != Some(group)) {
                return Ok(AckOutcome::LeaseExpired);
            }
            tx.execute(
                "UPDATE messages SET ack_at = ?1 WHERE message_id = ?2",
                params![ts(&now), message_id],
            )?;
            Ok(AckOutcome::Acked)
        })
        .await
    }

    /// Drop every lease that has run out; returns how many were released
    pub async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.write("release leases", |tx| {
            let released = tx.execute(
                "UPDATE messages SET lease_owner = NULL, lease_expires_at = NULL
                 WHERE ack_at IS NULL AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
                params![ts(&now)],
            )?;
            Ok(released)
        })
        .await
    }

    pub async fn log_stats(
        &self,
        topic: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LogStats, StoreError> {
        self.read(|conn| {
            let (pending, leased, acked): (i64, i64, i64) = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN ack_at IS NULL AND (lease_expires_at IS NULL OR lease_expires_at <= ?2) THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ack_at IS NULL AND lease_expires_at > ?2 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ack_at IS NOT NULL THEN 1 ELSE 0 END), 0)
                 FROM messages WHERE ?1 IS NULL OR topic = ?1",
                params![topic, ts(&now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(LogStats {
                pending: pending as u64,
                leased: leased as u64,
                acked: acked as u64,
            })
        })
        .await
    }

    pub async fn inflight_count(&self, topic: &str) -> Result<usize, StoreError> {
        self.read(|conn| count_inflight(conn, topic)).await
    }

    /// Delete messages acked before `before`
    pub async fn purge_acked(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.write("purge acked", |tx| {
            Ok(tx.execute(
                "DELETE FROM messages WHERE ack_at IS NOT NULL AND ack_at < ?1",
                params![ts(&before)],
            )?)
        })
        .await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<LogEntry>, StoreError> {
        self.read(|conn| load_entry(conn, message_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn entry(id: &str, priority: i64) -> LogEntry {
        LogEntry::new(id, "question.deliver", "{}", priority, None, t0())
    }

    async fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(dir.path().join("bus.db"), &StoreConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_seq() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        for (id, priority) in [("a", 1), ("b", 2), ("c", 1)] {
            store.append_message(&entry(id, priority), 100).await.unwrap();
        }

        let lease = t0() + Duration::seconds(30);
        let mut order = Vec::new();
        while let Some(e) = store.claim_next("question.deliver", "g", t0(), lease).await.unwrap() {
            order.push(e.message_id);
        }
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_lease_expiry_makes_message_claimable_again() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store.append_message(&entry("m1", 1), 100).await.unwrap();

        let first = store
            .claim_next("question.deliver", "g1", t0(), t0() + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.attempts, 1);
        assert!(store
            .claim_next("question.deliver", "g2", t0() + Duration::seconds(10), t0() + Duration::seconds(40))
            .await
            .unwrap()
            .is_none());

        let later = t0() + Duration::seconds(31);
        assert_eq!(store.ack_message("m1", None, later).await.unwrap(), AckOutcome::LeaseExpired);

        let second = store
            .claim_next("question.deliver", "g2", later, later + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.lease_owner.as_deref(), Some("g2"));
        assert_eq!(second.delivered_at, Some(t0()));

        assert_eq!(store.ack_message("m1", None, later).await.unwrap(), AckOutcome::Acked);
        assert_eq!(store.ack_message("m1", None, later).await.unwrap(), AckOutcome::AlreadyAcked);
        assert_eq!(store.ack_message("nope", None, later).await.unwrap(), AckOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_ack_requires_the_group_holding_the_lease() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store.append_message(&entry("m1", 1), 100).await.unwrap();
        store
            .claim_next("question.deliver", "g1", t0(), t0() + Duration::seconds(30))
            .await
            .unwrap();

        // g1 lets its lease lapse and g2 picks the message up
        let later = t0() + Duration::seconds(31);
        store
            .claim_next("question.deliver", "g2", later, later + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            store.ack_message("m1", Some("g1"), later).await.unwrap(),
            AckOutcome::LeaseExpired
        );
        assert_eq!(
            store.ack_message("m1", Some("g2"), later).await.unwrap(),
            AckOutcome::Acked
        );
    }

    #[tokio::test]
    async fn test_append_refuses_past_ceiling() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store.append_message(&entry("m1", 1), 1).await.unwrap();
        assert_eq!(
            store.append_message(&entry("m2", 1), 1).await.unwrap(),
            AppendOutcome::Full(1)
        );
        assert!(store.get_message("m2").await.unwrap().is_none());
        assert_eq!(store.inflight_count("question.deliver").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_release_and_purge() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        for id in ["m1", "m2", "m3"] {
            store.append_message(&entry(id, 1), 100).await.unwrap();
        }
        let lease = t0() + Duration::seconds(30);
        let first = store.claim_next("question.deliver", "g", t0(), lease).await.unwrap().unwrap();
        store.ack_message(&first.message_id, Some("g"), t0()).await.unwrap();
        store.claim_next("question.deliver", "g", t0(), lease).await.unwrap();

        let stats = store.log_stats(None, t0()).await.unwrap();
        assert_eq!(stats, LogStats { pending: 1, leased: 1, acked: 1 });

        assert_eq!(store.release_expired_leases(lease).await.unwrap(), 1);
        let stats = store.log_stats(Some("question.deliver"), t0()).await.unwrap();
        assert_eq!(stats, LogStats { pending: 2, leased: 0, acked: 1 });

        assert_eq!(store.purge_acked(t0() + Duration::seconds(1)).await.unwrap(), 1);
        assert!(store.get_message(&first.message_id).await.unwrap().is_none());
    }
}
