//! WhatsApp Cloud API webhook adapter: tolerant payload decoding and message normalization.
//!
//! Every list in the payload is decoded element by element; an element that does not
//! fit its shape is dropped on its own so siblings still get processed.

use chrono::{DateTime, TimeZone, Utc};
use dailydeals_core::{extract_links, IngestionEvent, MediaPayload};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default, deserialize_with = "lenient_list")]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEntry {
    #[serde(default, deserialize_with = "lenient_list")]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookChange {
    #[serde(default, deserialize_with = "lenient_object")]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeValue {
    /// Positional: a malformed contact stays as `None` so index 0 is always the first
    /// entry of the block.
    #[serde(default, deserialize_with = "lenient_slots")]
    pub contacts: Vec<Option<Contact>>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Contact {
    #[serde(default, deserialize_with = "lenient_object")]
    pub profile: ContactProfile,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactProfile {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(default, deserialize_with = "lenient_string")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "lenient_string")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_object")]
    pub text: TextBody,
    #[serde(default, deserialize_with = "lenient_object")]
    pub image: ImageBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextBody {
    #[serde(default, deserialize_with = "lenient_string")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageBody {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub caption: Option<String>,
}

impl WebhookPayload {
    /// Decode a payload that is already known to be valid JSON. Never fails: shapes that
    /// do not match collapse to empty collections.
    pub fn from_value(value: JsonValue) -> Self {
        serde_json::from_value(value).unwrap_or_else(|err| {
            debug!(%err, "webhook payload has no usable shape");
            Self::default()
        })
    }
}

fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = JsonValue::deserialize(deserializer)?;
    let JsonValue::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                debug!(%err, "skipping malformed webhook element");
                None
            }
        })
        .collect())
}

fn lenient_slots<'de, D, T>(deserializer: D) -> Result<Vec<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = JsonValue::deserialize(deserializer)?;
    let JsonValue::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .map(|item| serde_json::from_value(item).ok())
        .collect())
}

fn lenient_object<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = JsonValue::deserialize(deserializer)?;
    if !value.is_object() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Type-specific content of a supported message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text { body: String },
    Image { media_id: Option<String>, caption: String },
}

/// One supported message, flattened out of its entry/change/value nesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub content: MessageContent,
}

impl MessageRecord {
    /// Body for text messages, caption for images.
    pub fn text(&self) -> &str {
        match &self.content {
            MessageContent::Text { body } => body,
            MessageContent::Image { caption, .. } => caption,
        }
    }

    pub fn media_id(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Image { media_id, .. } => media_id.as_deref(),
            MessageContent::Text { .. } => None,
        }
    }

    pub fn links(&self) -> Vec<&str> {
        extract_links(self.text())
    }

    /// One event per link, all sharing `media`.
    pub fn events<'a>(
        &'a self,
        links: &[&'a str],
        media: Option<&'a MediaPayload>,
    ) -> Vec<IngestionEvent<'a>> {
        links
            .iter()
            .map(|&url| IngestionEvent {
                sender_id: self.sender_id.as_deref(),
                sender_name: self.sender_name.as_deref(),
                occurred_at: self.occurred_at,
                url,
                media,
            })
            .collect()
    }
}

/// Platform epoch seconds, or `fallback` when absent or unparseable.
pub fn parse_timestamp(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or(fallback)
}

/// Flatten a delivery into message records in payload order.
///
/// The first contact's name in a value block is applied to every message of that
/// block. Unknown message types are skipped.
pub fn normalize(payload: &WebhookPayload, received_at: DateTime<Utc>) -> Vec<MessageRecord> {
    let mut records = Vec::new();
    for entry in &payload.entry {
        for change in &entry.changes {
            let value = &change.value;
            let sender_name = value
                .contacts
                .first()
                .and_then(Option::as_ref)
                .and_then(|c| c.profile.name.clone());

            for message in &value.messages {
                let content = match message.kind.as_deref() {
                    Some("text") => MessageContent::Text {
                        body: message.text.body.clone().unwrap_or_default(),
                    },
                    Some("image") => MessageContent::Image {
                        media_id: message.image.id.clone().filter(|id| !id.is_empty()),
                        caption: message.image.caption.clone().unwrap_or_default(),
                    },
                    other => {
                        debug!(kind = ?other, "ignoring unsupported message type");
                        continue;
                    }
                };
                records.push(MessageRecord {
                    sender_id: message.from.clone(),
                    sender_name: sender_name.clone(),
                    occurred_at: parse_timestamp(message.timestamp.as_deref(), received_at),
                    content,
                });
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn records(value: JsonValue) -> Vec<MessageRecord> {
        normalize(&WebhookPayload::from_value(value), received_at())
    }

    #[test]
    fn normalizes_text_message_with_contact_name() {
        let out = records(json!({
            "entry": [{"changes": [{"value": {
                "contacts": [{"profile": {"name": "Ana"}}],
                "messages": [{
                    "from": "5511987654321",
                    "timestamp": "1700000000",
                    "type": "text",
                    "text": {"body": "promo top https://loja.com/p/1"}
                }]
            }}]}]
        }));

        assert_eq!(
            out,
            vec![MessageRecord {
                sender_id: Some("5511987654321".into()),
                sender_name: Some("Ana".into()),
                occurred_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
                content: MessageContent::Text {
                    body: "promo top https://loja.com/p/1".into()
                },
            }]
        );
        assert_eq!(out[0].links(), vec!["https://loja.com/p/1"]);
    }

    #[test]
    fn image_message_uses_caption_as_text() {
        let out = records(json!({
            "entry": [{"changes": [{"value": {"messages": [{
                "from": "1",
                "timestamp": 1700000000,
                "type": "image",
                "image": {"id": "MEDIA-1", "caption": "confira https://shop.example/x"}
            }]}}]}]
        }));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].media_id(), Some("MEDIA-1"));
        assert_eq!(out[0].text(), "confira https://shop.example/x");
        assert_eq!(out[0].sender_name, None);
        assert_eq!(out[0].occurred_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn first_contact_name_applies_to_whole_block() {
        let out = records(json!({
            "entry": [{"changes": [{"value": {
                "contacts": [{"profile": {"name": "Ana"}}, {"profile": {"name": "Bia"}}],
                "messages": [
                    {"from": "1", "type": "text", "text": {"body": "a"}},
                    {"from": "2", "type": "text", "text": {"body": "b"}}
                ]
            }}]}]
        }));
        assert!(out.iter().all(|r| r.sender_name.as_deref() == Some("Ana")));
    }

    #[test]
    fn malformed_first_contact_leaves_block_unnamed() {
        let out = records(json!({
            "entry": [{"changes": [{"value": {
                "contacts": [42, {"profile": {"name": "Bia"}}],
                "messages": [{"from": "1", "type": "text", "text": {"body": "a"}}]
            }}]}]
        }));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sender_name, None);
    }

    #[test]
    fn unknown_types_are_skipped() {
        let out = records(json!({
            "entry": [{"changes": [{"value": {"messages": [
                {"from": "1", "type": "sticker", "sticker": {"id": "s"}},
                {"from": "1"},
                {"from": "1", "type": "text", "text": {"body": "ok"}}
            ]}}]}]
        }));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "ok");
    }

    #[test]
    fn malformed_siblings_do_not_block_valid_ones() {
        let out = records(json!({
            "entry": [
                "not-an-object",
                {"changes": "nope"},
                {"changes": [
                    {"value": null},
                    {"value": {"contacts": {"oops": true}, "messages": [
                        42,
                        {"from": ["bad"], "type": "text", "text": "not-an-object"},
                        {"from": "2", "type": "text", "text": {"body": "https://a.com"}}
                    ]}}
                ]}
            ]
        }));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sender_id, None);
        assert_eq!(out[0].text(), "");
        assert_eq!(out[1].links(), vec!["https://a.com"]);
    }

    #[test]
    fn missing_or_bad_timestamp_falls_back_to_receipt_time() {
        let out = records(json!({
            "entry": [{"changes": [{"value": {"messages": [
                {"type": "text", "text": {"body": "x"}},
                {"type": "text", "timestamp": "yesterday", "text": {"body": "y"}}
            ]}}]}]
        }));
        assert!(out.iter().all(|r| r.occurred_at == received_at()));
    }

    #[test]
    fn non_object_payload_yields_nothing() {
        assert!(records(json!([1, 2, 3])).is_empty());
        assert!(records(json!({})).is_empty());
        assert!(records(json!({"entry": null})).is_empty());
    }

    #[test]
    fn events_share_media_and_differ_by_url() {
        let record = MessageRecord {
            sender_id: Some("1".into()),
            sender_name: None,
            occurred_at: received_at(),
            content: MessageContent::Image {
                media_id: Some("m".into()),
                caption: "https://a.com https://b.com https://a.com".into(),
            },
        };
        let media = MediaPayload::new(vec![9], Some("image/png".into()));
        let links = record.links();
        let events = record.events(&links, Some(&media));
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.media == Some(&media)));
        assert_eq!(
            events.iter().map(|e| e.url).collect::<Vec<_>>(),
            vec!["https://a.com", "https://b.com", "https://a.com"]
        );
    }
}
