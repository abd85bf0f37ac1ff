//! Generic tagged records: `put`, `get`, `query`, `expire`

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{parse_ts, ts, Store, StoreError};

/// Body and ranking metadata of a stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: String,
    pub body: serde_json::Value,
    pub confidence: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// A record as read back, with its key and tags
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: String,
    pub tags: Vec<String>,
    pub record: Record,
}

impl StoredRecord {
    /// Decode the body into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.record.body.clone()).map_err(|e| {
            StoreError::integrity(format!("record {} has an undecodable body: {}", self.key, e))
        })
    }
}

/// Types that can live in the generic record collection
pub trait Storable: Serialize + DeserializeOwned {
    const KIND: &'static str;

    fn storage_key(&self) -> String;

    fn tags(&self) -> Vec<String>;

    fn confidence(&self) -> Option<f64> {
        None
    }

    fn recorded_at(&self) -> DateTime<Utc>;

    fn to_record(&self) -> Result<Record, StoreError> {
        Ok(Record {
            kind: Self::KIND.to_string(),
            body: serde_json::to_value(self)?,
            confidence: self.confidence(),
            recorded_at: self.recorded_at(),
        })
    }
}

/// Filter for [`Store::query`]
#[derive(Debug, Clone)]
pub struct RecordQuery {
    /// Every tag must be present on a matching record
    pub tags: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub min_confidence: Option<f64>,
    /// Rows fetched per round trip
    pub page_size: usize,
}

impl RecordQuery {
    pub fn tagged<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            since: None,
            min_confidence: None,
            page_size: 64,
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = Some(min);
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }
}

impl Store {
    /// Insert or replace a record and its tags
    pub async fn put(&self, key: &str, record: &Record, tags: &[String]) -> Result<(), StoreError> {
        let body = serde_json::to_string(&record.body)?;
        let recorded_at = ts(&record.recorded_at);

        self.write("put record", |tx| {
            tx.execute(
                r#"INSERT INTO records (key, kind, body, confidence, recorded_at, expired_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                   ON CONFLICT(key) DO UPDATE SET
                       kind = excluded.kind,
                       body = excluded.body,
                       confidence = excluded.confidence,
                       recorded_at = excluded.recorded_at,
                       expired_at = NULL"#,
                params![key, record.kind, body, record.confidence, recorded_at],
            )?;
            tx.execute("DELETE FROM record_tags WHERE key = ?1", params![key])?;
            for tag in tags {
                tx.execute(
                    "INSERT OR IGNORE INTO record_tags (key, tag) VALUES (?1, ?2)",
                    params![key, tag],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Fetch a live (unexpired) record
    pub async fn get(&self, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        self.read(|conn| {
            let row = conn
                .query_row(
                    r#"SELECT key, kind, body, confidence, recorded_at
                       FROM records WHERE key = ?1 AND expired_at IS NULL"#,
                    params![key],
                    raw_record,
                )
                .optional()?;
            row.map(|raw| hydrate(conn, raw)).transpose()
        })
        .await
    }

    /// Hide a record from `get` and `query`; returns whether it was live
    pub async fn expire(&self, key: &str) -> Result<bool, StoreError> {
        let now = ts(&Utc::now());
        self.write("expire record", |tx| {
            let changed = tx.execute(
                "UPDATE records SET expired_at = ?2 WHERE key = ?1 AND expired_at IS NULL",
                params![key, now],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Lazily stream matching records, ordered by confidence then recency
    pub fn query(&self, query: RecordQuery) -> BoxStream<'_, Result<StoredRecord, StoreError>> {
        let page_size = query.page_size.max(1);
        stream::try_unfold((query, 0usize, false), move |(query, offset, done)| async move {
            if done {
                return Ok::<_, StoreError>(None);
            }
            let page = self.query_page(&query, offset, page_size).await?;
            let exhausted = page.len() < page_size;
            let next_offset = offset + page.len();
            let items = stream::iter(page.into_iter().map(Ok::<_, StoreError>));
            Ok(Some((items, (query, next_offset, exhausted))))
        })
        .try_flatten()
        .boxed()
    }

    /// Collect a whole query into memory
    pub async fn query_all(&self, query: RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        self.query(query).try_collect().await
    }

    async fn query_page(
        &self,
        query: &RecordQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let mut sql = String::from(
            r#"SELECT r.key, r.kind, r.body, r.confidence, r.recorded_at
               FROM records r
               WHERE r.expired_at IS NULL"#,
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(since) = &query.since {
            sql.push_str(" AND r.recorded_at >= ?");
            values.push(Value::Text(ts(since)));
        }
        if let Some(min) = query.min_confidence {
            sql.push_str(" AND r.confidence >= ?");
            values.push(Value::Real(min));
        }
        let mut tags = query.tags.clone();
        tags.sort();
        tags.dedup();
        if !tags.is_empty() {
            let placeholders = vec!["?"; tags.len()].join(", ");
            sql.push_str(&format!(
                " AND r.key IN (SELECT key FROM record_tags WHERE tag IN ({}) \
                 GROUP BY key HAVING COUNT(DISTINCT tag) = ?)",
                placeholders
            ));
            let count = tags.len() as i64;
            values.extend(tags.into_iter().map(Value::Text));
            values.push(Value::Integer(count));
        }
        sql.push_str(
            " ORDER BY COALESCE(r.confidence, -1.0) DESC, r.recorded_at DESC, r.key ASC LIMIT ? OFFSET ?",
        );
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));

        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let raws = stmt
                .query_map(params_from_iter(values.iter()), raw_record)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(|raw| hydrate(conn, raw)).collect()
        })
        .await
    }

    /// Store a typed record under its own key and tags
    pub async fn put_item<T: Storable>(&self, item: &T) -> Result<(), StoreError> {
        self.put(&item.storage_key(), &item.to_record()?, &item.tags()).await
    }

    /// Fetch and decode a typed record
    pub async fn get_item<T: Storable>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(stored) if stored.record.kind == T::KIND => Ok(Some(stored.decode()?)),
            Some(stored) => Err(StoreError::integrity(format!(
                "record {} has kind {}, expected {}",
                key,
                stored.record.kind,
                T::KIND
            ))),
            None => Ok(None),
        }
    }
}

type RawRecord = (String, String, String, Option<f64>, String);

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn hydrate(conn: &Connection, raw: RawRecord) -> Result<StoredRecord, StoreError> {
    let (key, kind, body, confidence, recorded_at) = raw;
    let body = serde_json::from_str(&body)
        .map_err(|e| StoreError::integrity(format!("record {} body is not JSON: {}", key, e)))?;
    let mut stmt = conn.prepare_cached("SELECT tag FROM record_tags WHERE key = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map(params![key], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(StoredRecord {
        record: Record {
            kind,
            body,
            confidence,
            recorded_at: parse_ts(&recorded_at)?,
        },
        tags,
        key,
    })
}
