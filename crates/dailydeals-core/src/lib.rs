//! Core domain model for DailyDeals: ingestion events, persisted deals and link extraction.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s<>()"']+"#).expect("url pattern is valid")
});

/// Raw image bytes plus the MIME type the platform declared for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl MediaPayload {
    pub fn new(bytes: Vec<u8>, mime_type: Option<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
        }
    }
}

/// One (sender, url, optional image) observation taken from a webhook message.
///
/// Borrows everything from the message record it was derived from; a message with
/// several links yields several events sharing the same `media`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionEvent<'a> {
    pub sender_id: Option<&'a str>,
    pub sender_name: Option<&'a str>,
    pub occurred_at: DateTime<Utc>,
    pub url: &'a str,
    pub media: Option<&'a MediaPayload>,
}

/// Durable record of one ingestion event. Never updated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: i64,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub fingerprint: String,
    pub image: Option<MediaPayload>,
    pub created_at: DateTime<Utc>,
}

/// Gallery row as returned by the store, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealSummary {
    pub id: i64,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for gallery listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GalleryQuery {
    pub since: DateTime<Utc>,
    pub limit: i64,
}

impl GalleryQuery {
    /// Window reaching `days` back from `now`. A window older than the representable
    /// range starts at `DateTime::<Utc>::MIN_UTC`.
    pub fn last_days(now: DateTime<Utc>, days: i64, limit: i64) -> Self {
        let since = chrono::Duration::try_days(days.max(0))
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            since,
            limit: limit.max(0),
        }
    }
}

/// What the gallery renderer needs for one card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryItem {
    pub id: i64,
    pub url: String,
    pub created_at: String,
    pub source_label: String,
    pub title: String,
}

impl From<DealSummary> for GalleryItem {
    fn from(summary: DealSummary) -> Self {
        Self {
            id: summary.id,
            source_label: source_label(&summary.url).to_string(),
            title: card_title(&summary.url),
            created_at: summary.created_at.format("%d/%m %H:%M").to_string(),
            url: summary.url,
        }
    }
}

/// Scan free text for `http(s)://` links, in order of appearance, duplicates kept.
pub fn extract_links(text: &str) -> Vec<&str> {
    URL_RE.find_iter(text).map(|m| m.as_str()).collect()
}

/// Marketplace badge shown on a gallery card.
pub fn source_label(url: &str) -> &'static str {
    let u = url.to_lowercase();
    if u.contains("amazon.") {
        "Amazon"
    } else if u.contains("mercadolivre") || u.contains("meli.") {
        "Mercado Livre"
    } else if u.contains("shopee.") {
        "Shopee"
    } else {
        "Link"
    }
}

pub fn card_title(url: &str) -> String {
    match url.split('/').nth(2) {
        Some(host) => format!("Oferta em {host}"),
        None => "Oferta".to_string(),
    }
}
