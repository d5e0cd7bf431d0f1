//! Tests for destination value types.

use super::*;

#[test]
fn test_queue_and_topic_name_validation() {
    assert!(Queue::new("orders").is_ok());
    assert!(Queue::new("").is_err());

    assert!(Topic::new("sensors.kitchen.temperature").is_ok());
    assert!(Topic::new("").is_err());
    assert!(Topic::new("a..b").is_err());
    assert!(Topic::new(".a").is_err());
}

#[test]
fn test_topic_literal_and_wildcard_matching() {
    let literal = Topic::new("a.b").unwrap();
    assert!(!literal.is_wildcard());
    assert!(literal.matches("a.b"));
    assert!(!literal.matches("a.b.c"));

    let pattern = Topic::new("a.**").unwrap();
    assert!(pattern.is_wildcard());
    assert!(pattern.matches("a"));
    assert!(pattern.matches("a.b.c"));
}

/// Malformed wildcard names are treated as literal names.
#[test]
fn test_mixed_wildcard_token_matches_literally() {
    let topic = Topic::new("a*b").unwrap();
    assert!(!topic.is_wildcard());
    assert!(topic.matches("a*b"));
    assert!(!topic.matches("axb"));
}

#[test]
fn test_destination_classification() {
    let queue: Destination = Queue::new("q").unwrap().into();
    let topic: Destination = Topic::new("t").unwrap().into();

    assert!(queue.is_queue());
    assert!(!queue.is_topic());
    assert!(queue.is_persistent());
    assert!(queue.owner().is_none());

    assert!(topic.is_topic());
    assert!(!topic.is_temporary());
    assert_eq!(topic.name(), "t");
}

#[test]
fn test_temporary_destination_identity_ignores_back_reference() {
    let owner = ConnectionId::new("conn-1").unwrap();
    let first = TemporaryQueue::new("tmp-1".to_string(), owner.clone(), Weak::new());
    let second = TemporaryQueue::new("tmp-1".to_string(), owner.clone(), Weak::new());
    assert_eq!(first, second);

    let destination: Destination = first.into();
    assert!(destination.is_temporary());
    assert!(!destination.is_persistent());
    assert_eq!(destination.owner(), Some(&owner));
}

#[test]
fn test_temporary_destination_serialization_drops_connection() {
    let owner = ConnectionId::new("conn-9").unwrap();
    let topic = TemporaryTopic::new("tmp-topic".to_string(), owner, Weak::new());
    let json = serde_json::to_string(&Destination::from(topic.clone())).unwrap();
    let restored: Destination = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, Destination::TemporaryTopic(topic));
}

#[tokio::test]
async fn test_delete_without_live_connection_fails() {
    let owner = ConnectionId::new("conn-2").unwrap();
    let queue = TemporaryQueue::new("tmp-2".to_string(), owner, Weak::new());
    let result = queue.delete().await;
    assert!(matches!(result, Err(MessagingError::InvalidState { .. })));
}

#[test]
fn test_subscription_coverage() {
    let published: Destination = Topic::new("a.b.c").unwrap().into();
    let pattern: Destination = Topic::new("a.*.c").unwrap().into();
    let other: Destination = Topic::new("x.*.c").unwrap().into();
    assert!(published.is_covered_by(&pattern));
    assert!(!published.is_covered_by(&other));

    let queue: Destination = Queue::new("a.b.c").unwrap().into();
    assert!(!queue.is_covered_by(&pattern));
    assert!(queue.is_covered_by(&queue.clone()));
}

#[test]
fn test_display() {
    let queue: Destination = Queue::new("jobs").unwrap().into();
    assert_eq!(queue.to_string(), "queue://jobs");
}
