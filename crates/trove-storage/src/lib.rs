//! Persistence seams + PostgreSQL/in-memory stores and the bounded HTTP fetch.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use trove_core::{
    ContentCandidate, ContentRecord, CronRunEntry, RunDetails, RunStatus, TriggeredBy,
    UsageCounter,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trove-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("decoding stored value: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one bulk upsert against the content collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: u64,
    pub updated: u64,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// One unordered bulk upsert keyed by (kind, natural_key). Mutable fields
    /// and `updated_at` are set on every match; `created_at` only on insert.
    async fn bulk_upsert(
        &self,
        batch: Vec<ContentCandidate>,
        now: DateTime<Utc>,
    ) -> Result<UpsertStats, StoreError>;

    async fn count_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<String, i64>, StoreError>;

    async fn count_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<String, i64>, StoreError>;

    async fn count_all_by_kind(&self) -> Result<BTreeMap<String, i64>, StoreError>;
}

#[async_trait]
pub trait CronJournal: Send + Sync {
    /// Appends one immutable entry. Entries are never mutated or deleted.
    async fn append(&self, entry: &CronRunEntry) -> Result<(), StoreError>;

    /// Entries with `started_at` in `[start, end)`, ascending, optionally
    /// filtered to a job-name allow-list.
    async fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        names: Option<&[String]>,
    ) -> Result<Vec<CronRunEntry>, StoreError>;
}

#[async_trait]
pub trait UsageCounters: Send + Sync {
    /// Atomically increments the day's kind/language/provider buckets,
    /// creating the day's counters on first touch.
    async fn bump(
        &self,
        day_key: &str,
        kind: &str,
        language: &str,
        provider: &str,
    ) -> Result<(), StoreError>;

    async fn for_day(&self, day_key: &str) -> Result<Option<UsageCounter>, StoreError>;
}

/// PostgreSQL-backed implementation of all three seams.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Safe to run on every boot.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS content_records (
              id            uuid PRIMARY KEY,
              kind          text NOT NULL,
              natural_key   text NOT NULL,
              provider      text NOT NULL,
              title         text,
              body_text     text,
              url           text NOT NULL,
              thumb_url     text,
              language      text,
              created_at    timestamptz NOT NULL,
              updated_at    timestamptz NOT NULL,
              last_shown_at timestamptz,
              like_count    bigint NOT NULL DEFAULT 0,
              dislike_count bigint NOT NULL DEFAULT 0,
              show_weight   bigint NOT NULL DEFAULT 0,
              is_suppressed boolean NOT NULL DEFAULT false,
              UNIQUE (kind, natural_key)
            );
            CREATE INDEX IF NOT EXISTS idx_content_created_at ON content_records (created_at);
            CREATE INDEX IF NOT EXISTS idx_content_updated_at ON content_records (updated_at);

            CREATE TABLE IF NOT EXISTS cron_runs (
              id           uuid PRIMARY KEY,
              name         text NOT NULL,
              status       text NOT NULL,
              started_at   timestamptz NOT NULL,
              finished_at  timestamptz NOT NULL,
              duration_ms  bigint NOT NULL,
              triggered_by text NOT NULL,
              details      jsonb NOT NULL,
              error        text
            );
            CREATE INDEX IF NOT EXISTS idx_cron_runs_started_at ON cron_runs (started_at);

            CREATE TABLE IF NOT EXISTS usage_counters (
              day_key   text NOT NULL,
              dimension text NOT NULL,
              bucket    text NOT NULL,
              count     bigint NOT NULL DEFAULT 0,
              PRIMARY KEY (day_key, dimension, bucket)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for PgStore {
    async fn bulk_upsert(
        &self,
        batch: Vec<ContentCandidate>,
        now: DateTime<Utc>,
    ) -> Result<UpsertStats, StoreError> {
        if batch.is_empty() {
            return Ok(UpsertStats::default());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut kinds = Vec::with_capacity(batch.len());
        let mut natural_keys = Vec::with_capacity(batch.len());
        let mut providers = Vec::with_capacity(batch.len());
        let mut titles: Vec<Option<String>> = Vec::with_capacity(batch.len());
        let mut texts: Vec<Option<String>> = Vec::with_capacity(batch.len());
        let mut urls = Vec::with_capacity(batch.len());
        let mut thumbs: Vec<Option<String>> = Vec::with_capacity(batch.len());
        let mut languages: Vec<Option<String>> = Vec::with_capacity(batch.len());
        for candidate in batch {
            ids.push(candidate.record_id());
            kinds.push(candidate.kind.as_str().to_string());
            natural_keys.push(candidate.natural_key);
            providers.push(candidate.provider);
            titles.push(candidate.title);
            texts.push(candidate.text);
            urls.push(candidate.url);
            thumbs.push(candidate.thumb);
            languages.push(candidate.language);
        }

        let rows = sqlx::query(
            r#"
            INSERT INTO content_records
              (id, kind, natural_key, provider, title, body_text, url, thumb_url, language,
               created_at, updated_at)
            SELECT u.id, u.kind, u.natural_key, u.provider, u.title, u.body_text, u.url,
                   u.thumb_url, u.language, $10, $10
              FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::text[], $5::text[],
                          $6::text[], $7::text[], $8::text[], $9::text[])
                AS u(id, kind, natural_key, provider, title, body_text, url, thumb_url, language)
            ON CONFLICT (kind, natural_key) DO UPDATE SET
              provider   = EXCLUDED.provider,
              title      = EXCLUDED.title,
              body_text  = EXCLUDED.body_text,
              url        = EXCLUDED.url,
              thumb_url  = EXCLUDED.thumb_url,
              language   = EXCLUDED.language,
              updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&ids)
        .bind(&kinds)
        .bind(&natural_keys)
        .bind(&providers)
        .bind(&titles)
        .bind(&texts)
        .bind(&urls)
        .bind(&thumbs)
        .bind(&languages)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = UpsertStats::default();
        for row in rows {
            if row.try_get::<bool, _>("inserted")? {
                stats.inserted += 1;
            } else {
                stats.updated += 1;
            }
        }
        debug!(inserted = stats.inserted, updated = stats.updated, "bulk upsert applied");
        Ok(stats)
    }

    async fn count_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        count_by_kind(&self.pool, "created_at", start, end).await
    }

    async fn count_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        count_by_kind(&self.pool, "updated_at", start, end).await
    }

    async fn count_all_by_kind(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT kind, COUNT(*) AS n FROM content_records GROUP BY kind"#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.try_get::<String, _>("kind")?, row.try_get::<i64, _>("n")?);
        }
        Ok(out)
    }
}

async fn count_by_kind(
    pool: &PgPool,
    column: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let sql = format!(
        "SELECT kind, COUNT(*) AS n FROM content_records \
         WHERE {column} >= $1 AND {column} < $2 GROUP BY kind"
    );
    let rows = sqlx::query(&sql).bind(start).bind(end).fetch_all(pool).await?;
    let mut out = BTreeMap::new();
    for row in rows {
        out.insert(row.try_get::<String, _>("kind")?, row.try_get::<i64, _>("n")?);
    }
    Ok(out)
}

#[async_trait]
impl CronJournal for PgStore {
    async fn append(&self, entry: &CronRunEntry) -> Result<(), StoreError> {
        let details = serde_json::to_value(&entry.details)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO cron_runs
              (id, name, status, started_at, finished_at, duration_ms, triggered_by, details, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.name)
        .bind(entry.status.as_str())
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .bind(entry.duration_ms)
        .bind(entry.triggered_by.as_str())
        .bind(details)
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        names: Option<&[String]>,
    ) -> Result<Vec<CronRunEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, status, started_at, finished_at, duration_ms, triggered_by,
                   details, error
              FROM cron_runs
             WHERE started_at >= $1
               AND started_at < $2
               AND ($3::text[] IS NULL OR name = ANY($3))
             ORDER BY started_at ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(names.map(<[String]>::to_vec))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let status = RunStatus::parse(&status)
                .ok_or_else(|| StoreError::Decode(format!("unknown run status {status}")))?;
            let triggered_by: String = row.try_get("triggered_by")?;
            let details: serde_json::Value = row.try_get("details")?;
            let details: RunDetails = serde_json::from_value(details)
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            out.push(CronRunEntry {
                id: row.try_get::<Uuid, _>("id")?,
                name: row.try_get("name")?,
                status,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                duration_ms: row.try_get("duration_ms")?,
                triggered_by: TriggeredBy::parse(&triggered_by),
                details,
                error: row.try_get("error")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl UsageCounters for PgStore {
    async fn bump(
        &self,
        day_key: &str,
        kind: &str,
        language: &str,
        provider: &str,
    ) -> Result<(), StoreError> {
        for (dimension, bucket) in [("kind", kind), ("language", language), ("provider", provider)]
        {
            sqlx::query(
                r#"
                INSERT INTO usage_counters (day_key, dimension, bucket, count)
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (day_key, dimension, bucket)
                  DO UPDATE SET count = usage_counters.count + 1
                "#,
            )
            .bind(day_key)
            .bind(dimension)
            .bind(bucket)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn for_day(&self, day_key: &str) -> Result<Option<UsageCounter>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT dimension, bucket, count FROM usage_counters WHERE day_key = $1"#,
        )
        .bind(day_key)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut counter = UsageCounter {
            day_key: day_key.to_string(),
            ..UsageCounter::default()
        };
        for row in rows {
            let dimension: String = row.try_get("dimension")?;
            let bucket: String = row.try_get("bucket")?;
            let count: i64 = row.try_get("count")?;
            match dimension.as_str() {
                "kind" => counter.by_kind.insert(bucket, count),
                "language" => counter.by_language.insert(bucket, count),
                "provider" => counter.by_provider.insert(bucket, count),
                other => {
                    return Err(StoreError::Decode(format!("unknown usage dimension {other}")))
                }
            };
        }
        Ok(Some(counter))
    }
}

/// In-memory implementation of the same seams; the test double every
/// downstream crate leans on.
#[derive(Debug, Default)]
pub struct MemoryStore {
    content: Mutex<BTreeMap<(String, String), ContentRecord>>,
    runs: Mutex<Vec<CronRunEntry>>,
    usage: Mutex<BTreeMap<(String, String, String), i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn content_len(&self) -> usize {
        self.content.lock().await.len()
    }

    pub async fn get_content(&self, kind: &str, natural_key: &str) -> Option<ContentRecord> {
        self.content
            .lock()
            .await
            .get(&(kind.to_string(), natural_key.to_string()))
            .cloned()
    }

    pub async fn run_count(&self) -> usize {
        self.runs.lock().await.len()
    }

    pub async fn last_run(&self) -> Option<CronRunEntry> {
        self.runs.lock().await.last().cloned()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn bulk_upsert(
        &self,
        batch: Vec<ContentCandidate>,
        now: DateTime<Utc>,
    ) -> Result<UpsertStats, StoreError> {
        let mut content = self.content.lock().await;
        let mut stats = UpsertStats::default();
        for candidate in batch {
            let key = (candidate.kind.as_str().to_string(), candidate.natural_key.clone());
            match content.get_mut(&key) {
                Some(existing) => {
                    existing.absorb(candidate, now);
                    stats.updated += 1;
                }
                None => {
                    content.insert(key, ContentRecord::from_candidate(candidate, now));
                    stats.inserted += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn count_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        let content = self.content.lock().await;
        let mut out = BTreeMap::new();
        for record in content.values() {
            if record.created_at >= start && record.created_at < end {
                *out.entry(record.kind.as_str().to_string()).or_default() += 1;
            }
        }
        Ok(out)
    }

    async fn count_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        let content = self.content.lock().await;
        let mut out = BTreeMap::new();
        for record in content.values() {
            if record.updated_at >= start && record.updated_at < end {
                *out.entry(record.kind.as_str().to_string()).or_default() += 1;
            }
        }
        Ok(out)
    }

    async fn count_all_by_kind(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let content = self.content.lock().await;
        let mut out = BTreeMap::new();
        for record in content.values() {
            *out.entry(record.kind.as_str().to_string()).or_default() += 1;
        }
        Ok(out)
    }
}

#[async_trait]
impl CronJournal for MemoryStore {
    async fn append(&self, entry: &CronRunEntry) -> Result<(), StoreError> {
        self.runs.lock().await.push(entry.clone());
        Ok(())
    }

    async fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        names: Option<&[String]>,
    ) -> Result<Vec<CronRunEntry>, StoreError> {
        let runs = self.runs.lock().await;
        let mut out: Vec<CronRunEntry> = runs
            .iter()
            .filter(|e| e.started_at >= start && e.started_at < end)
            .filter(|e| names.map_or(true, |allow| allow.contains(&e.name)))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.started_at);
        Ok(out)
    }
}

#[async_trait]
impl UsageCounters for MemoryStore {
    async fn bump(
        &self,
        day_key: &str,
        kind: &str,
        language: &str,
        provider: &str,
    ) -> Result<(), StoreError> {
        let mut usage = self.usage.lock().await;
        for (dimension, bucket) in [("kind", kind), ("language", language), ("provider", provider)]
        {
            *usage
                .entry((day_key.to_string(), dimension.to_string(), bucket.to_string()))
                .or_default() += 1;
        }
        Ok(())
    }

    async fn for_day(&self, day_key: &str) -> Result<Option<UsageCounter>, StoreError> {
        let usage = self.usage.lock().await;
        let mut counter = UsageCounter {
            day_key: day_key.to_string(),
            ..UsageCounter::default()
        };
        let mut seen = false;
        for ((day, dimension, bucket), count) in usage.iter() {
            if day != day_key {
                continue;
            }
            seen = true;
            let slot = match dimension.as_str() {
                "kind" => &mut counter.by_kind,
                "language" => &mut counter.by_language,
                _ => &mut counter.by_provider,
            };
            slot.insert(bucket.clone(), *count);
        }
        Ok(seen.then_some(counter))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded-wait JSON fetch. On timeout the call is abandoned and surfaces as
/// a [`FetchError::Request`]; there is no retry here, re-invocation belongs
/// to the external scheduler.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let mut request = self.client.get(url);
        if !query.is_empty() {
            request = request.query(query);
        }
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        debug!(url = %final_url, "fetched json");
        Ok(response.json::<serde_json::Value>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use trove_core::ContentKind;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).single().unwrap()
    }

    fn candidate(key: &str, title: &str) -> ContentCandidate {
        ContentCandidate {
            kind: ContentKind::Image,
            natural_key: key.to_string(),
            provider: "unsplash".into(),
            title: Some(title.to_string()),
            text: None,
            url: key.to_string(),
            thumb: None,
            language: Some("en".into()),
        }
    }

    fn run_entry(name: &str, started_at: DateTime<Utc>) -> CronRunEntry {
        CronRunEntry {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: RunStatus::Success,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            triggered_by: TriggeredBy::Manual,
            details: RunDetails::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn memory_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![candidate("https://a", "one"), candidate("https://b", "two")];

        let first = store.bulk_upsert(batch.clone(), ts(10, 0)).await.unwrap();
        assert_eq!(first, UpsertStats { inserted: 2, updated: 0 });

        let second = store.bulk_upsert(batch, ts(11, 0)).await.unwrap();
        assert_eq!(second, UpsertStats { inserted: 0, updated: 2 });
        assert_eq!(store.content_len().await, 2);

        let record = store.get_content("image", "https://a").await.unwrap();
        assert_eq!(record.created_at, ts(10, 0));
        assert_eq!(record.updated_at, ts(11, 0));
    }

    #[tokio::test]
    async fn memory_journal_range_is_half_open_and_ascending() {
        let store = MemoryStore::new();
        for (name, at) in [("b", ts(12, 0)), ("a", ts(10, 0)), ("a", ts(14, 0))] {
            store.append(&run_entry(name, at)).await.unwrap();
        }

        let entries = store.entries_between(ts(10, 0), ts(14, 0), None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].started_at, ts(10, 0));
        assert_eq!(entries[1].started_at, ts(12, 0));

        let only_a = store
            .entries_between(ts(9, 0), ts(15, 0), Some(&["a".to_string()]))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|e| e.name == "a"));
    }

    #[tokio::test]
    async fn memory_usage_counters_accumulate_per_day() {
        let store = MemoryStore::new();
        store.bump("2026-03-01", "image", "en", "unsplash").await.unwrap();
        store.bump("2026-03-01", "image", "en", "pexels").await.unwrap();
        store.bump("2026-03-01", "quote", "de", "quotable").await.unwrap();

        let counter = store.for_day("2026-03-01").await.unwrap().unwrap();
        assert_eq!(counter.by_kind.get("image"), Some(&2));
        assert_eq!(counter.by_kind.get("quote"), Some(&1));
        assert_eq!(counter.by_language.get("en"), Some(&2));
        assert_eq!(counter.by_provider.get("pexels"), Some(&1));

        assert!(store.for_day("2026-03-02").await.unwrap().is_none());
    }
}
