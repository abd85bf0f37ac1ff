//! Questions, responses and preference profiles

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::model::{Question, ResponseContext, ResponseRecord};
use super::{parse_opt_ts, parse_ts, ts, Store, StoreError};
use crate::preference::PreferenceProfile;
use crate::types::{Priority, QuestionStatus, QuestionType};

const QUESTION_COLUMNS: &str = "question_id, pattern_id, user_id, topic, question_text, \
     question_type, priority, status, scheduled_for, delivered_at, expires_at, batch_id, \
     created_at, updated_at";

const RESPONSE_COLUMNS: &str =
    "response_id, question_id, answer, sentiment, responded_at, context, learned";

/// Result of trying to mark a question delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMark {
    Delivered,
    /// The user already has `delivered` questions in the window
    OverCap { delivered: u32 },
    /// Someone else moved the question first
    StatusChanged(QuestionStatus),
}

/// Result of recording an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Recorded,
    /// The response id was seen before; nothing changed
    Duplicate,
    /// The question is not awaiting an answer
    InvalidState(QuestionStatus),
}

struct RawQuestion {
    question_id: String,
    pattern_id: String,
    user_id: String,
    topic: String,
    question_text: String,
    question_type: String,
    priority: i64,
    status: String,
    scheduled_for: Option<String>,
    delivered_at: Option<String>,
    expires_at: String,
    batch_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawQuestion {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            question_id: row.get(0)?,
            pattern_id: row.get(1)?,
            user_id: row.get(2)?,
            topic: row.get(3)?,
            question_text: row.get(4)?,
            question_type: row.get(5)?,
            priority: row.get(6)?,
            status: row.get(7)?,
            scheduled_for: row.get(8)?,
            delivered_at: row.get(9)?,
            expires_at: row.get(10)?,
            batch_id: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn decode(self) -> Result<Question, StoreError> {
        Ok(Question {
            question_type: self
                .question_type
                .parse::<QuestionType>()
                .map_err(StoreError::integrity)?,
            priority: Priority::from_rank(self.priority),
            status: parse_status(&self.status)?,
            scheduled_for: parse_opt_ts(self.scheduled_for)?,
            delivered_at: parse_opt_ts(self.delivered_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            question_id: self.question_id,
            pattern_id: self.pattern_id,
            user_id: self.user_id,
            topic: self.topic,
            question_text: self.question_text,
            batch_id: self.batch_id,
        })
    }
}

struct RawResponse {
    response_id: String,
    question_id: String,
    answer: String,
    sentiment: String,
    responded_at: String,
    context: String,
    learned: bool,
}

impl RawResponse {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            response_id: row.get(0)?,
            question_id: row.get(1)?,
            answer: row.get(2)?,
            sentiment: row.get(3)?,
            responded_at: row.get(4)?,
            context: row.get(5)?,
            learned: row.get(6)?,
        })
    }

    fn decode(self) -> Result<ResponseRecord, StoreError> {
        let context: ResponseContext = serde_json::from_str(&self.context).map_err(|e| {
            StoreError::integrity(format!("response {} context: {}", self.response_id, e))
        })?;
        let sentiment = serde_json::from_value(serde_json::Value::String(self.sentiment))
            .map_err(|e| StoreError::integrity(format!("response {}: {}", self.response_id, e)))?;
        Ok(ResponseRecord {
            answer: self.answer.parse().map_err(StoreError::integrity)?,
            sentiment,
            responded_at: parse_ts(&self.responded_at)?,
            context,
            learned: self.learned,
            response_id: self.response_id,
            question_id: self.question_id,
        })
    }
}

fn parse_status(value: &str) -> Result<QuestionStatus, StoreError> {
    value.parse().map_err(StoreError::integrity)
}

fn load_question(conn: &Connection, question_id: &str) -> Result<Option<Question>, StoreError> {
    let sql = format!("SELECT {} FROM questions WHERE question_id = ?1", QUESTION_COLUMNS);
    conn.query_row(&sql, params![question_id], RawQuestion::from_row)
        .optional()?
        .map(RawQuestion::decode)
        .transpose()
}

fn load_questions<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<Question>, StoreError> {
    let sql = format!("SELECT {} FROM questions {}", QUESTION_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, RawQuestion::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RawQuestion::decode).collect()
}

fn count_delivered(conn: &Connection, user_id: &str, since: &DateTime<Utc>) -> Result<u32, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM questions WHERE user_id = ?1 AND delivered_at IS NOT NULL AND delivered_at >= ?2",
        params![user_id, ts(since)],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

fn load_profile_row(conn: &Connection, user_id: &str) -> Result<Option<PreferenceProfile>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM preference_profiles WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| {
        serde_json::from_str(&b)
            .map_err(|e| StoreError::integrity(format!("profile {} is undecodable: {}", user_id, e)))
    })
    .transpose()
}

fn upsert_profile(tx: &Transaction<'_>, profile: &PreferenceProfile) -> Result<(), StoreError> {
    let body = serde_json::to_string(profile)?;
    tx.execute(
        "INSERT INTO preference_profiles (user_id, body, confidence_threshold, last_updated)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
            body = excluded.body,
            confidence_threshold = excluded.confidence_threshold,
            last_updated = excluded.last_updated",
        params![
            profile.user_id,
            body,
            profile.confidence_threshold,
            ts(&profile.last_updated)
        ],
    )?;
    Ok(())
}

impl Store {
    pub async fn insert_question(&self, question: &Question) -> Result<(), StoreError> {
        self.write("insert question", |tx| {
            tx.execute(
                &format!(
                    "INSERT INTO questions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    QUESTION_COLUMNS
                ),
                params![
                    question.question_id,
                    question.pattern_id,
                    question.user_id,
                    question.topic,
                    question.question_text,
                    question.question_type.as_str(),
                    question.priority.rank(),
                    question.status.as_str(),
                    question.scheduled_for.as_ref().map(ts),
                    question.delivered_at.as_ref().map(ts),
                    ts(&question.expires_at),
                    question.batch_id,
                    ts(&question.created_at),
                    ts(&question.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_question(&self, question_id: &str) -> Result<Option<Question>, StoreError> {
        self.read(|conn| load_question(conn, question_id)).await
    }

    /// Overwrite the mutable fields of a question if it is still in `expected`.
    ///
    /// Returns `false` when another writer changed the status first.
    pub async fn update_question(
        &self,
        question: &Question,
        expected: QuestionStatus,
    ) -> Result<bool, StoreError> {
        self.write("update question", |tx| {
            let changed = tx.execute(
                "UPDATE questions SET status = ?1, scheduled_for = ?2, delivered_at = ?3,
                    batch_id = ?4, priority = ?5, updated_at = ?6
                 WHERE question_id = ?7 AND status = ?8",
                params![
                    question.status.as_str(),
                    question.scheduled_for.as_ref().map(ts),
                    question.delivered_at.as_ref().map(ts),
                    question.batch_id,
                    question.priority.rank(),
                    ts(&question.updated_at),
                    question.question_id,
                    expected.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// SCHEDULED questions whose slot has come, highest priority first
    pub async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Question>, StoreError> {
        self.read(|conn| {
            load_questions(
                conn,
                "WHERE status = 'SCHEDULED' AND scheduled_for <= ?1
                 ORDER BY priority DESC, scheduled_for ASC, created_at ASC",
                params![ts(&now)],
            )
        })
        .await
    }

    /// Most recent questions in `status`, newest first
    pub async fn questions_with_status(
        &self,
        status: QuestionStatus,
        limit: usize,
    ) -> Result<Vec<Question>, StoreError> {
        self.read(move |conn| {
            load_questions(
                conn,
                "WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                params![status.as_str(), limit as i64],
            )
        })
        .await
    }

    /// PENDING or SCHEDULED questions past their expiry
    pub async fn expiry_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Question>, StoreError> {
        self.read(|conn| {
            load_questions(
                conn,
                "WHERE status IN ('PENDING', 'SCHEDULED') AND expires_at <= ?1
                 ORDER BY expires_at ASC",
                params![ts(&now)],
            )
        })
        .await
    }

    /// Questions delivered to `user_id` at or after `since`, whatever their current status
    pub async fn count_delivered_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.read(|conn| count_delivered(conn, user_id, &since)).await
    }

    /// Earliest delivery to `user_id` at or after `since`
    pub async fn oldest_delivery_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.read(|conn| {
            let oldest: Option<String> = conn.query_row(
                "SELECT MIN(delivered_at) FROM questions
                 WHERE user_id = ?1 AND delivered_at IS NOT NULL AND delivered_at >= ?2",
                params![user_id, ts(&since)],
                |row| row.get(0),
            )?;
            parse_opt_ts(oldest)
        })
        .await
    }

    pub async fn count_scheduled(&self, user_id: &str) -> Result<u32, StoreError> {
        self.read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM questions WHERE user_id = ?1 AND status = 'SCHEDULED'",
                params![user_id],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
        .await
    }

    /// Latest delivery time for the user, optionally also counting pending slots
    pub async fn last_delivery_slot(
        &self,
        user_id: &str,
        include_scheduled: bool,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.read(|conn| {
            let sql = if include_scheduled {
                "SELECT MAX(slot) FROM (
                    SELECT delivered_at AS slot FROM questions
                        WHERE user_id = ?1 AND delivered_at IS NOT NULL
                    UNION ALL
                    SELECT scheduled_for AS slot FROM questions
                        WHERE user_id = ?1 AND status = 'SCHEDULED' AND scheduled_for IS NOT NULL
                 )"
            } else {
                "SELECT MAX(delivered_at) FROM questions WHERE user_id = ?1 AND delivered_at IS NOT NULL"
            };
            let slot: Option<String> = conn.query_row(sql, params![user_id], |row| row.get(0))?;
            parse_opt_ts(slot)
        })
        .await
    }

    /// Earliest SCHEDULED question a new one of the same kind could batch with
    pub async fn open_batch(
        &self,
        user_id: &str,
        question_type: QuestionType,
    ) -> Result<Option<Question>, StoreError> {
        self.read(|conn| {
            let mut found = load_questions(
                conn,
                "WHERE user_id = ?1 AND question_type = ?2 AND status = 'SCHEDULED'
                    AND delivered_at IS NULL
                 ORDER BY scheduled_for ASC LIMIT 1",
                params![user_id, question_type.as_str()],
            )?;
            Ok(found.pop())
        })
        .await
    }

    /// Non-suppressed questions for a user on a topic created at or after `since`
    pub async fn recent_questions(
        &self,
        user_id: &str,
        topic: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Question>, StoreError> {
        self.read(|conn| {
            load_questions(
                conn,
                "WHERE user_id = ?1 AND topic = ?2 AND status != 'SUPPRESSED' AND created_at >= ?3
                 ORDER BY created_at DESC",
                params![user_id, topic, ts(&since)],
            )
        })
        .await
    }

    /// Whether any question about `pattern_id` was answered NO at or after `since`
    pub async fn has_rejection(
        &self,
        pattern_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.read(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM responses r JOIN questions q ON q.question_id = r.question_id
                     WHERE q.pattern_id = ?1 AND r.answer = 'NO' AND r.responded_at >= ?2
                     LIMIT 1",
                    params![pattern_id, ts(&since)],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    /// Question counts for every status, in lifecycle order
    pub async fn status_counts(&self) -> Result<Vec<(QuestionStatus, u64)>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM questions GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts: Vec<(QuestionStatus, u64)> =
                QuestionStatus::ALL.iter().map(|s| (*s, 0)).collect();
            for (status, count) in rows {
                let status = parse_status(&status)?;
                if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                    slot.1 = count as u64;
                }
            }
            Ok(counts)
        })
        .await
    }

    /// Move a SCHEDULED question to DELIVERED unless the user's rolling cap is reached.
    ///
    /// The cap is counted inside the same write transaction, so concurrent
    /// sweeps cannot push a user past it.
    pub async fn mark_delivered(
        &self,
        question_id: &str,
        now: DateTime<Utc>,
        cap: u32,
        window_start: DateTime<Utc>,
    ) -> Result<DeliveryMark, StoreError> {
        self.write("mark delivered", |tx| {
            let question = load_question(tx, question_id)?
                .ok_or_else(|| StoreError::not_found(format!("question {}", question_id)))?;
            if question.status != QuestionStatus::Scheduled {
                return Ok(DeliveryMark::StatusChanged(question.status));
            }

            let delivered = count_delivered(tx, &question.user_id, &window_start)?;
            if delivered >= cap {
                return Ok(DeliveryMark::OverCap { delivered });
            }

            tx.execute(
                "UPDATE questions SET status = 'DELIVERED', delivered_at = ?1, updated_at = ?1
                 WHERE question_id = ?2",
                params![ts(&now), question_id],
            )?;
            Ok(DeliveryMark::Delivered)
        })
        .await
    }

    /// Insert a response and answer its question in one transaction
    pub async fn record_answer(&self, response: &ResponseRecord) -> Result<AnswerOutcome, StoreError> {
        let context = serde_json::to_string(&response.context)?;
        self.write("record answer", |tx| {
            let seen: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM responses WHERE response_id = ?1",
                    params![response.response_id],
                    |row| row.get(0),
                )
                .optional()?;
            if seen.is_some() {
                return Ok(AnswerOutcome::Duplicate);
            }

            let question = load_question(tx, &response.question_id)?
                .ok_or_else(|| StoreError::not_found(format!("question {}", response.question_id)))?;
            if !question.status.can_transition_to(QuestionStatus::Answered) {
                return Ok(AnswerOutcome::InvalidState(question.status));
            }

            tx.execute(
                &format!("INSERT INTO responses ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)", RESPONSE_COLUMNS),
                params![
                    response.response_id,
                    response.question_id,
                    response.answer.as_str(),
                    response.sentiment.to_string(),
                    ts(&response.responded_at),
                    context,
                ],
            )?;
            tx.execute(
                "UPDATE questions SET status = 'ANSWERED', updated_at = ?1 WHERE question_id = ?2",
                params![ts(&response.responded_at), response.question_id],
            )?;
            Ok(AnswerOutcome::Recorded)
        })
        .await
    }

    pub async fn get_response(&self, response_id: &str) -> Result<Option<ResponseRecord>, StoreError> {
        self.read(|conn| {
            let sql = format!("SELECT {} FROM responses WHERE response_id = ?1", RESPONSE_COLUMNS);
            conn.query_row(&sql, params![response_id], RawResponse::from_row)
                .optional()?
                .map(RawResponse::decode)
                .transpose()
        })
        .await
    }

    /// Oldest responses the learning engine has not folded in yet
    pub async fn unlearned_responses(&self, limit: usize) -> Result<Vec<ResponseRecord>, StoreError> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM responses WHERE learned = 0 ORDER BY responded_at ASC LIMIT ?1",
                RESPONSE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit as i64], RawResponse::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawResponse::decode).collect()
        })
        .await
    }

    pub async fn load_profile(&self, user_id: &str) -> Result<Option<PreferenceProfile>, StoreError> {
        self.read(|conn| load_profile_row(conn, user_id)).await
    }

    pub async fn save_profile(&self, profile: &PreferenceProfile) -> Result<(), StoreError> {
        self.write("save profile", |tx| upsert_profile(tx, profile)).await
    }

    /// Read-modify-write a profile and flag the response learned, atomically.
    ///
    /// Returns `None` without touching anything when the response was
    /// already learned.
    pub async fn apply_observation<F>(
        &self,
        user_id: &str,
        response_id: &str,
        update: F,
    ) -> Result<Option<PreferenceProfile>, StoreError>
    where
        F: Fn(Option<PreferenceProfile>) -> PreferenceProfile,
    {
        self.write("apply observation", |tx| {
            let learned: Option<bool> = tx
                .query_row(
                    "SELECT learned FROM responses WHERE response_id = ?1",
                    params![response_id],
                    |row| row.get(0),
                )
                .optional()?;
            match learned {
                None => return Err(StoreError::not_found(format!("response {}", response_id))),
                Some(true) => return Ok(None),
                Some(false) => {}
            }

            let profile = update(load_profile_row(tx, user_id)?);
            upsert_profile(tx, &profile)?;
            tx.execute(
                "UPDATE responses SET learned = 1 WHERE response_id = ?1",
                params![response_id],
            )?;
            Ok(Some(profile))
        })
        .await
    }
}
