//! Deal persistence, fingerprinting and media fetching for DailyDeals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use dailydeals_core::{Deal, DealSummary, GalleryQuery, IngestionEvent, MediaPayload};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical timestamp form used inside fingerprints: RFC 3339, UTC, microseconds
/// only when non-zero.
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    ts.trunc_subsecs(6).to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Dedup key of an event: SHA-256 over `sender_id|sender_name|occurred_at|url`.
/// Absent fields contribute an empty string.
pub fn fingerprint(event: &IngestionEvent<'_>) -> String {
    let material = format!(
        "{}|{}|{}|{}",
        event.sender_id.unwrap_or_default(),
        event.sender_name.unwrap_or_default(),
        canonical_timestamp(event.occurred_at),
        event.url
    );
    sha256_hex(material.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// A deal with the same fingerprint already exists; nothing was written.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("DATABASE_URL is not configured")]
    NotConfigured,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait DealStore: Send + Sync {
    /// Insert the event unless a deal with `fingerprint` exists. Atomic at the store.
    async fn insert_if_absent(
        &self,
        event: &IngestionEvent<'_>,
        fingerprint: &str,
    ) -> Result<InsertOutcome, StoreError>;

    /// Deals with both image and url created since `query.since`, newest first.
    async fn list_gallery(&self, query: GalleryQuery) -> Result<Vec<DealSummary>, StoreError>;

    /// `None` for unknown ids and for deals stored without an image.
    async fn image_by_id(&self, id: i64) -> Result<Option<MediaPayload>, StoreError>;
}

const SCHEMA_STATEMENTS: [&str; 3] = [
    "CREATE SCHEMA IF NOT EXISTS whatsapp",
    r#"
    CREATE TABLE IF NOT EXISTS whatsapp.deals (
      id BIGSERIAL PRIMARY KEY,
      wa_from TEXT NULL,
      wa_name TEXT NULL,
      msg_time TIMESTAMPTZ NULL,
      url TEXT NULL,
      url_hash CHAR(64) NOT NULL UNIQUE,
      image_bytes BYTEA NULL,
      image_mime TEXT NULL,
      created_at TIMESTAMPTZ DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS deals_created_at_idx ON whatsapp.deals (created_at DESC)",
];

/// Postgres-backed store. The pool connects lazily, so a missing or unreachable
/// database only fails the operations that touch it.
#[derive(Debug, Clone)]
pub struct PgDealStore {
    pool: Option<PgPool>,
}

impl PgDealStore {
    pub fn connect_lazy(database_url: Option<&str>) -> Result<Self, StoreError> {
        let Some(url) = database_url.map(str::trim).filter(|u| !u.is_empty()) else {
            return Ok(Self { pool: None });
        };
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(url)?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool: Some(pool) }
    }

    fn pool(&self) -> Result<&PgPool, StoreError> {
        self.pool.as_ref().ok_or(StoreError::NotConfigured)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let pool = self.pool()?;
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DealStore for PgDealStore {
    async fn insert_if_absent(
        &self,
        event: &IngestionEvent<'_>,
        fingerprint: &str,
    ) -> Result<InsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO whatsapp.deals
              (wa_from, wa_name, msg_time, url, url_hash, image_bytes, image_mime)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (url_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event.sender_id)
        .bind(event.sender_name)
        .bind(event.occurred_at)
        .bind(event.url)
        .bind(fingerprint)
        .bind(event.media.map(|m| m.bytes.as_slice()))
        .bind(event.media.map(|m| m.mime_type.as_str()))
        .fetch_optional(self.pool()?)
        .await?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(row.try_get("id")?)),
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    async fn list_gallery(&self, query: GalleryQuery) -> Result<Vec<DealSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, created_at
              FROM whatsapp.deals
             WHERE image_bytes IS NOT NULL
               AND url IS NOT NULL
               AND created_at >= $1
             ORDER BY created_at DESC
             LIMIT $2
            "#,
        )
        .bind(query.since)
        .bind(query.limit)
        .fetch_all(self.pool()?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DealSummary {
                id: row.try_get("id")?,
                url: row.try_get("url")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn image_by_id(&self, id: i64) -> Result<Option<MediaPayload>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT image_bytes, image_mime
              FROM whatsapp.deals
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool()?)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let bytes: Option<Vec<u8>> = row.try_get("image_bytes")?;
        let mime: Option<String> = row.try_get("image_mime")?;
        Ok(bytes.map(|bytes| MediaPayload::new(bytes, mime)))
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Process-local store with the same uniqueness semantics as the Postgres table.
/// Used for tests and offline replays.
#[derive(Clone)]
pub struct InMemoryDealStore {
    deals: Arc<Mutex<Vec<Deal>>>,
    clock: Clock,
}

impl Default for InMemoryDealStore {
    fn default() -> Self {
        Self {
            deals: Arc::new(Mutex::new(Vec::new())),
            clock: Arc::new(Utc::now),
        }
    }
}

impl InMemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `created_at` from `clock` instead of the wall clock.
    pub fn with_clock(clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self {
            deals: Arc::new(Mutex::new(Vec::new())),
            clock: Arc::new(clock),
        }
    }

    pub async fn deals(&self) -> Vec<Deal> {
        self.deals.lock().await.clone()
    }
}

#[async_trait]
impl DealStore for InMemoryDealStore {
    async fn insert_if_absent(
        &self,
        event: &IngestionEvent<'_>,
        fingerprint: &str,
    ) -> Result<InsertOutcome, StoreError> {
        let mut deals = self.deals.lock().await;
        if deals.iter().any(|d| d.fingerprint == fingerprint) {
            return Ok(InsertOutcome::Duplicate);
        }
        let id = deals.last().map(|d| d.id + 1).unwrap_or(1);
        deals.push(Deal {
            id,
            sender_id: event.sender_id.map(ToString::to_string),
            sender_name: event.sender_name.map(ToString::to_string),
            occurred_at: Some(event.occurred_at),
            url: Some(event.url.to_string()),
            fingerprint: fingerprint.to_string(),
            image: event.media.cloned(),
            created_at: (self.clock)(),
        });
        Ok(InsertOutcome::Inserted(id))
    }

    async fn list_gallery(&self, query: GalleryQuery) -> Result<Vec<DealSummary>, StoreError> {
        let deals = self.deals.lock().await;
        let mut rows = deals
            .iter()
            .filter(|d| d.image.is_some() && d.created_at >= query.since)
            .filter_map(|d| {
                d.url.clone().map(|url| DealSummary {
                    id: d.id,
                    url,
                    created_at: d.created_at,
                })
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(usize::try_from(query.limit).unwrap_or(0));
        Ok(rows)
    }

    async fn image_by_id(&self, id: i64) -> Result<Option<MediaPayload>, StoreError> {
        let deals = self.deals.lock().await;
        Ok(deals.iter().find(|d| d.id == id).and_then(|d| d.image.clone()))
    }
}

/// Resolves an opaque platform media reference to bytes.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn fetch(&self, media_id: &str) -> Result<MediaPayload, MediaError>;
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("WHATSAPP_TOKEN is not configured")]
    MissingCredential,
    #[error("media request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("media {stage} call returned http status {status}")]
    HttpStatus { stage: &'static str, status: u16 },
    #[error("media metadata for {media_id} has no download url")]
    MissingDownloadUrl { media_id: String },
}

#[derive(Debug, Clone)]
pub struct MediaClientConfig {
    pub base_url: String,
    pub api_version: String,
    pub access_token: Option<String>,
    pub metadata_timeout: Duration,
    pub content_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for MediaClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v20.0".to_string(),
            access_token: None,
            metadata_timeout: Duration::from_secs(25),
            content_timeout: Duration::from_secs(40),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MediaMetadata {
    url: Option<String>,
    mime_type: Option<String>,
}

/// Graph API media client: metadata lookup by id, then a direct content download.
/// Failures are returned as-is; nothing is retried.
#[derive(Debug, Clone)]
pub struct GraphMediaFetcher {
    client: reqwest::Client,
    config: MediaClientConfig,
}

impl GraphMediaFetcher {
    pub fn new(config: MediaClientConfig) -> Result<Self, MediaError> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    pub fn metadata_url(&self, media_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version.trim_matches('/'),
            media_id
        )
    }

    async fn download(&self, media_id: &str) -> Result<MediaPayload, MediaError> {
        let token = self
            .config
            .access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(MediaError::MissingCredential)?;

        let resp = self
            .client
            .get(self.metadata_url(media_id))
            .bearer_auth(token)
            .timeout(self.config.metadata_timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(MediaError::HttpStatus {
                stage: "metadata",
                status: resp.status().as_u16(),
            });
        }
        let metadata: MediaMetadata = resp.json().await?;
        let download_url = metadata
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| MediaError::MissingDownloadUrl {
                media_id: media_id.to_string(),
            })?;

        let resp = self
            .client
            .get(&download_url)
            .bearer_auth(token)
            .timeout(self.config.content_timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(MediaError::HttpStatus {
                stage: "content",
                status: resp.status().as_u16(),
            });
        }
        let bytes = resp.bytes().await?.to_vec();
        debug!(byte_size = bytes.len(), "media downloaded");
        Ok(MediaPayload::new(bytes, metadata.mime_type))
    }
}

#[async_trait]
impl MediaSource for GraphMediaFetcher {
    async fn fetch(&self, media_id: &str) -> Result<MediaPayload, MediaError> {
        self.download(media_id)
            .instrument(info_span!("media_fetch", media_id))
            .await
    }
}
