//! SQLite connection management, schema and transaction discipline

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::StoreError;
use crate::config::StoreConfig;
use crate::retry::RetryPolicy;

/// Handle to the durable store.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    path: PathBuf,
    write_policy: RetryPolicy,
    write_blocked: AtomicBool,
}

impl Store {
    /// Open (or create) the store at `path`
    pub async fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let writer = Connection::open(&path)?;
        Self::configure(&writer, busy_timeout)?;
        Self::init_schema(&writer)?;

        let reader = Connection::open(&path)?;
        Self::configure(&reader, busy_timeout)?;

        let store = Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
            path,
            write_policy: RetryPolicy::new(
                config.max_write_attempts,
                Duration::from_millis(config.write_backoff_ms),
            ),
            write_blocked: AtomicBool::new(false),
        };

        if let Some(problem) = store.check_integrity(true).await? {
            error!(
                "Store {} failed its integrity check, writes blocked: {}",
                store.path.display(),
                problem
            );
            store.write_blocked.store(true, Ordering::SeqCst);
        }

        info!("Opened store at {}", store.path.display());
        Ok(store)
    }

    fn configure(conn: &Connection, busy_timeout: Duration) -> Result<(), StoreError> {
        // WAL gives one writer and many concurrent readers across processes
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.busy_timeout(busy_timeout)?;
        Ok(())
    }

    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            -- Generic tagged records (patterns, focus markers, ...)
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                confidence REAL,
                recorded_at TEXT NOT NULL,
                expired_at TEXT
            );

            CREATE TABLE IF NOT EXISTS record_tags (
                key TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (key, tag),
                FOREIGN KEY (key) REFERENCES records(key) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS questions (
                question_id TEXT PRIMARY KEY,
                pattern_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                question_text TEXT NOT NULL,
                question_type TEXT NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL,
                scheduled_for TEXT,
                delivered_at TEXT,
                expires_at TEXT NOT NULL,
                batch_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS responses (
                response_id TEXT PRIMARY KEY,
                question_id TEXT NOT NULL,
                answer TEXT NOT NULL,
                sentiment TEXT NOT NULL,
                responded_at TEXT NOT NULL,
                context TEXT NOT NULL,
                learned INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (question_id) REFERENCES questions(question_id)
            );

            CREATE TABLE IF NOT EXISTS preference_profiles (
                user_id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                confidence_threshold REAL NOT NULL,
                last_updated TEXT NOT NULL
            );

            -- Bus write-ahead log
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                topic TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                correlation_id TEXT,
                created_at TEXT NOT NULL,
                delivered_at TEXT,
                ack_at TEXT,
                lease_owner TEXT,
                lease_expires_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_records_rank ON records(confidence DESC, recorded_at DESC);
            CREATE INDEX IF NOT EXISTS idx_record_tags_tag ON record_tags(tag, key);
            CREATE INDEX IF NOT EXISTS idx_questions_user_type ON questions(user_id, question_type);
            CREATE INDEX IF NOT EXISTS idx_questions_status_expiry ON questions(status, expires_at);
            CREATE INDEX IF NOT EXISTS idx_questions_pattern ON questions(pattern_id);
            CREATE INDEX IF NOT EXISTS idx_responses_question ON responses(question_id);
            CREATE INDEX IF NOT EXISTS idx_responses_learned ON responses(learned, responded_at);
            CREATE INDEX IF NOT EXISTS idx_messages_claim ON messages(topic, ack_at, priority DESC, seq);
        "#,
        )?;

        Ok(())
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writes are currently blocked by an integrity failure
    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked.load(Ordering::SeqCst)
    }

    /// Block writes after corruption was detected outside SQLite itself
    pub(crate) fn flag_integrity_failure(&self, reason: &str) {
        if !self.write_blocked.swap(true, Ordering::SeqCst) {
            error!("Store integrity failure, blocking writes: {}", reason);
        }
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// Contention is retried with backoff; any error rolls the transaction
    /// back, so partial writes are never visible.
    pub(crate) async fn write<T, F>(&self, what: &str, f: F) -> Result<T, StoreError>
    where
        F: Fn(&Transaction<'_>) -> Result<T, StoreError>,
    {
        if self.is_write_blocked() {
            return Err(StoreError::integrity(format!(
                "writes blocked until repair (attempted {})",
                what
            )));
        }

        let this = self;
        let f = &f;
        let result = self
            .write_policy
            .run(what, move || async move {
                let mut conn = this.writer.lock().await;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })
            .await;

        match result {
            Err(StoreError::Integrity(reason)) => {
                self.flag_integrity_failure(&reason);
                Err(StoreError::Integrity(reason))
            }
            Err(StoreError::Contention(reason)) => {
                warn!("{} gave up after repeated contention: {}", what, reason);
                Err(StoreError::Contention(reason))
            }
            other => other,
        }
    }

    /// Run a read-only closure on the reader connection
    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.reader.lock().await;
        let result = f(&conn);
        if let Err(StoreError::Integrity(reason)) = &result {
            self.flag_integrity_failure(reason);
        }
        result
    }

    /// Returns the problem report, or `None` when the database is healthy
    async fn check_integrity(&self, quick: bool) -> Result<Option<String>, StoreError> {
        let pragma = if quick { "PRAGMA quick_check" } else { "PRAGMA integrity_check" };
        let conn = self.writer.lock().await;
        let mut stmt = conn.prepare(pragma)?;
        let lines = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if lines.len() == 1 && lines[0] == "ok" {
            Ok(None)
        } else {
            Ok(Some(lines.join("; ")))
        }
    }

    /// Re-verify the database and lift the write block when it is healthy
    pub async fn repair(&self) -> Result<(), StoreError> {
        if self.check_integrity(false).await?.is_none() {
            if self.write_blocked.swap(false, Ordering::SeqCst) {
                info!("Store integrity restored, writes unblocked");
            }
            return Ok(());
        }

        warn!("Integrity check failed, rebuilding indexes");
        {
            let conn = self.writer.lock().await;
            conn.execute_batch("REINDEX;")?;
        }

        match self.check_integrity(false).await? {
            None => {
                self.write_blocked.store(false, Ordering::SeqCst);
                info!("Store repaired by reindexing, writes unblocked");
                Ok(())
            }
            Some(problem) => {
                self.write_blocked.store(true, Ordering::SeqCst);
                Err(StoreError::integrity(problem))
            }
        }
    }
}
