//! Webhook ingestion pipeline: normalize → fetch media → extract links → dedup-insert.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dailydeals_adapters::{normalize, MessageRecord, WebhookPayload};
use dailydeals_storage::{fingerprint, DealStore, InsertOutcome, MediaClientConfig, MediaSource};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_APP_TITLE: &str = "DailyDeals - Seu grupo de Promoções";

#[derive(Debug, Clone)]
pub struct DealsConfig {
    pub verify_token: Option<String>,
    pub whatsapp_token: Option<String>,
    pub graph_api_version: String,
    pub graph_base_url: String,
    pub database_url: Option<String>,
    pub app_title: String,
    pub days_to_show: i64,
    pub max_items: i64,
    pub host: String,
    pub port: u16,
    pub media_metadata_timeout_secs: u64,
    pub media_content_timeout_secs: u64,
}

impl Default for DealsConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl DealsConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset and unparseable
    /// numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            verify_token: get("VERIFY_TOKEN"),
            whatsapp_token: get("WHATSAPP_TOKEN"),
            graph_api_version: get("GRAPH_API_VERSION").unwrap_or_else(|| "v20.0".to_string()),
            graph_base_url: get("GRAPH_BASE_URL")
                .unwrap_or_else(|| "https://graph.facebook.com".to_string()),
            database_url: get("DATABASE_URL"),
            app_title: get("APP_TITLE").unwrap_or_else(|| DEFAULT_APP_TITLE.to_string()),
            days_to_show: parse_or(get("DAYS_TO_SHOW"), 7),
            max_items: parse_or(get("MAX_ITEMS"), 200),
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(get("PORT"), 8000),
            media_metadata_timeout_secs: parse_or(get("MEDIA_METADATA_TIMEOUT_SECS"), 25),
            media_content_timeout_secs: parse_or(get("MEDIA_CONTENT_TIMEOUT_SECS"), 40),
        }
    }

    pub fn media_client_config(&self) -> MediaClientConfig {
        MediaClientConfig {
            base_url: self.graph_base_url.clone(),
            api_version: self.graph_api_version.clone(),
            access_token: self.whatsapp_token.clone(),
            metadata_timeout: Duration::from_secs(self.media_metadata_timeout_secs),
            content_timeout: Duration::from_secs(self.media_content_timeout_secs),
            user_agent: Some(format!("dailydeals/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn log_summary(&self) {
        fn secret(val: &Option<String>) -> String {
            match val {
                Some(v) => format!("<set, {} chars>", v.len()),
                None => "<not set>".to_string(),
            }
        }
        info!(
            verify_token = %secret(&self.verify_token),
            whatsapp_token = %secret(&self.whatsapp_token),
            database_url = %secret(&self.database_url),
            graph_api_version = %self.graph_api_version,
            graph_base_url = %self.graph_base_url,
            days_to_show = self.days_to_show,
            max_items = self.max_items,
            "config loaded"
        );
        if self.whatsapp_token.is_none() {
            warn!("WHATSAPP_TOKEN not set; image messages will be skipped");
        }
        if self.verify_token.is_none() {
            warn!("VERIFY_TOKEN not set; webhook verification will be rejected");
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Counters for one webhook delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub delivery_id: Uuid,
    pub messages: usize,
    pub links: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub media_failures: usize,
    pub store_failures: usize,
}

/// Drives deliveries into the store. Holds only shared handles, so one instance serves
/// concurrent deliveries.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn DealStore>,
    media: Arc<dyn MediaSource>,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn DealStore>, media: Arc<dyn MediaSource>) -> Self {
        Self { store, media }
    }

    pub async fn ingest_json(&self, value: JsonValue) -> IngestSummary {
        self.ingest_payload(&WebhookPayload::from_value(value), Utc::now())
            .await
    }

    /// Process every message of the delivery. Per-message failures are counted and
    /// logged, never returned.
    pub async fn ingest_payload(
        &self,
        payload: &WebhookPayload,
        received_at: DateTime<Utc>,
    ) -> IngestSummary {
        let delivery_id = Uuid::new_v4();
        let span = info_span!("webhook_delivery", %delivery_id);
        async move {
            let records = normalize(payload, received_at);
            let mut summary = IngestSummary {
                delivery_id,
                messages: records.len(),
                ..Default::default()
            };
            for record in &records {
                self.ingest_record(record, &mut summary).await;
            }
            info!(
                messages = summary.messages,
                links = summary.links,
                inserted = summary.inserted,
                duplicates = summary.duplicates,
                media_failures = summary.media_failures,
                store_failures = summary.store_failures,
                "webhook delivery processed"
            );
            summary
        }
        .instrument(span)
        .await
    }

    async fn ingest_record(&self, record: &MessageRecord, summary: &mut IngestSummary) {
        let links = record.links();
        summary.links += links.len();
        if links.is_empty() {
            return;
        }

        let media = match record.media_id() {
            Some(media_id) => match self.media.fetch(media_id).await {
                Ok(media) => Some(media),
                Err(err) => {
                    summary.media_failures += 1;
                    warn!(media_id, error = %err, "media fetch failed; skipping message");
                    return;
                }
            },
            None => None,
        };

        for event in record.events(&links, media.as_ref()) {
            let key = fingerprint(&event);
            match self.store.insert_if_absent(&event, &key).await {
                Ok(InsertOutcome::Inserted(id)) => {
                    summary.inserted += 1;
                    debug!(deal_id = id, url = event.url, "deal stored");
                }
                Ok(InsertOutcome::Duplicate) => {
                    summary.duplicates += 1;
                    debug!(fingerprint = %key, "duplicate deal skipped");
                }
                Err(err) => {
                    summary.store_failures += 1;
                    warn!(url = event.url, error = %err, "failed to store deal");
                }
            }
        }
    }
}

/// Replay a saved webhook body from disk.
pub async fn ingest_file(pipeline: &IngestPipeline, path: &Path) -> Result<IngestSummary> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(pipeline.ingest_json(value).await)
}
