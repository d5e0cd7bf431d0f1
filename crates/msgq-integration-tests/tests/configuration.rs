//! Integration tests for file-based factory configuration

mod common;

use common::{queue, Harness};
use msgq_runtime::{
    AckMode, ConnectionFactory, DeliveryMode, FactoryConfig, Message, MessagingError,
};
use std::io::Write;
use std::time::Duration;

fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_yaml_config_drives_runtime_defaults() {
    // Arrange
    let file = write_config(
        ".yaml",
        r#"
client_id: billing
forced_ack_mode: dups_ok
producer:
  priority: 6
  delivery_mode: non_persistent
  time_to_live_ms: 60000
in_memory:
  max_queue_size: 2
"#,
    );
    let config = FactoryConfig::load(Some(file.path())).unwrap();
    let harness = Harness::with_config(config);

    // Act
    let (connection, session) = harness.session(false, AckMode::Client).await;
    let invoices = queue("invoices");
    let producer = session.create_producer(Some(&invoices)).unwrap();
    producer.send(Message::text("first")).await.unwrap();
    producer.send(Message::text("second")).await.unwrap();
    let overflow = producer.send(Message::text("third")).await;

    // Assert
    assert_eq!(connection.client_id().as_deref(), Some("billing"));
    assert_eq!(session.ack_mode(), AckMode::DupsOk);
    match overflow {
        Err(MessagingError::ProviderError { code, .. }) => assert_eq!(code, "QueueFull"),
        other => panic!("expected QueueFull, got {:?}", other),
    }

    let consumer = session.create_consumer(&invoices, None, false).await.unwrap();
    let message = consumer.receive(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(message.priority.value(), 6);
    assert_eq!(message.delivery_mode, DeliveryMode::NonPersistent);
    assert!(message.expiration.is_some());
}

#[tokio::test]
async fn test_factory_from_toml_file() {
    let file = write_config(
        ".toml",
        r#"
scheme = "in_memory"

[producer]
priority = 2
"#,
    );
    let factory = ConnectionFactory::from_config_file(Some(file.path())).unwrap();
    assert_eq!(factory.config().producer.priority, 2);

    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(false, AckMode::Auto).await.unwrap();
    let producer = session.create_producer(Some(&queue("low"))).unwrap();
    assert_eq!(producer.priority().value(), 2);
}

#[test]
fn test_invalid_files_are_rejected() {
    let bad_mode = write_config(".toml", "forced_ack_mode = \"transacted\"\n");
    assert!(FactoryConfig::load(Some(bad_mode.path())).is_err());

    let remote_without_address = write_config(".toml", "scheme = \"tcp\"\n");
    assert!(FactoryConfig::load(Some(remote_without_address.path())).is_err());

    let missing = std::path::Path::new("/nonexistent/msgq.toml");
    assert!(FactoryConfig::load(Some(missing)).is_err());
}
