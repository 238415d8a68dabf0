use std::path::Path;

use chrono::{TimeZone, Utc};
use dailydeals_adapters::{normalize, MessageContent, WebhookPayload};

fn load_fixture(name: &str) -> WebhookPayload {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    let text = std::fs::read_to_string(&path).unwrap();
    WebhookPayload::from_value(serde_json::from_str(&text).unwrap())
}

#[test]
fn group_delivery_fixture_normalizes_supported_messages() {
    let received_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
    let records = normalize(&load_fixture("group_delivery.json"), received_at);

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.sender_name.as_deref() == Some("Ana")));
    assert_eq!(records[0].links(), vec!["https://loja.com/p/1"]);

    assert_eq!(
        records[1].content,
        MessageContent::Image {
            media_id: Some("1003383421387256".into()),
            caption: "confira https://shop.example/x e https://www.amazon.com.br/dp/B0".into(),
        }
    );
    assert_eq!(records[1].links().len(), 2);
    assert_eq!(records[1].occurred_at.timestamp(), 1_700_000_060);
}
