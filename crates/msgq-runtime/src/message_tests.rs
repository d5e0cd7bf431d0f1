//! Tests for message types.

use super::*;
use serde::Deserialize;

#[test]
fn test_message_builder() {
    let message = Message::text("hello")
        .with_property("region", "eu")
        .with_correlation_id("corr-123")
        .with_message_type("greeting");

    assert_eq!(message.body_text().unwrap(), "hello");
    assert_eq!(message.properties.get("region"), Some(&"eu".to_string()));
    assert_eq!(message.correlation_id.as_deref(), Some("corr-123"));
    assert_eq!(message.message_type.as_deref(), Some("greeting"));
    assert_eq!(message.priority, Priority::DEFAULT);
    assert_eq!(message.delivery_mode, DeliveryMode::Persistent);
    assert!(!message.redelivered);
    assert!(message.message_id.is_none());
}

#[test]
fn test_json_body() {
    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Order {
        id: u32,
        item: String,
    }

    let order = Order {
        id: 7,
        item: "widget".to_string(),
    };
    let message = Message::json(&order).unwrap();
    let decoded: Order = message.body_json().unwrap();
    assert_eq!(decoded, order);
}

#[test]
fn test_invalid_utf8_body() {
    let message = Message::new(Bytes::from_static(&[0xff, 0xfe]));
    assert!(matches!(
        message.body_text(),
        Err(SerializationError::InvalidUtf8)
    ));
}

#[test]
fn test_expiration() {
    let mut message = Message::text("x");
    assert!(!message.is_expired());

    message.expiration = Some(Timestamp::now().add(Duration::milliseconds(-10)));
    assert!(message.is_expired());

    message.expiration = Some(Timestamp::now().add(Duration::minutes(5)));
    assert!(!message.is_expired());
}

#[test]
fn test_priority_range() {
    assert!(Priority::new(0).is_ok());
    assert!(Priority::new(9).is_ok());
    assert!(Priority::new(10).is_err());
    assert_eq!(Priority::default().value(), 4);
}

#[test]
fn test_broker_ids_reject_empty() {
    assert!(ConsumerId::new("").is_err());
    assert_eq!(ConsumerId::new("consumer-1").unwrap().as_str(), "consumer-1");
    assert!("".parse::<ConnectionId>().is_err());
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::new();
    let id2 = MessageId::new();
    assert_ne!(id1, id2);
    assert!(id1.as_str().starts_with("ID:"));
}

#[test]
fn test_ack_token_ordering() {
    assert!(AckToken::new(1) < AckToken::new(2));
    assert_eq!(AckToken::new(5).sequence(), 5);
}

#[test]
fn test_message_serialization_encodes_body() {
    let message = Message::text("payload").with_property("k", "v");
    let json = serde_json::to_string(&message).unwrap();
    let restored: Message = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.body, message.body);
    assert_eq!(restored.properties, message.properties);
}
