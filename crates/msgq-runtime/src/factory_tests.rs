//! Tests for the connection factory and connector registry.

use super::*;
use crate::broker::{BrokerConnection, ExceptionSink};
use crate::error::ConfigurationError;
use crate::provider::AckMode;
use async_trait::async_trait;
use std::io::Write;

fn tcp_config() -> FactoryConfig {
    FactoryConfig {
        scheme: ConnectorScheme::Tcp,
        address: Some("broker.local:61616".to_string()),
        ..FactoryConfig::default()
    }
}

/// Tcp-scheme connector that loops back into an in-memory broker
struct LoopbackConnector {
    inner: InMemoryConnector,
}

#[async_trait]
impl Connector for LoopbackConnector {
    fn scheme(&self) -> ConnectorScheme {
        ConnectorScheme::Tcp
    }

    async fn connect(
        &self,
        config: &FactoryConfig,
        events: Arc<dyn ExceptionSink>,
    ) -> Result<Arc<dyn BrokerConnection>, MessagingError> {
        self.inner.connect(config, events).await
    }
}

#[tokio::test]
async fn test_unregistered_scheme_is_unsupported() {
    let factory = ConnectionFactory::new(tcp_config()).unwrap();

    let result = factory.create_connection().await;
    match result {
        Err(MessagingError::ConfigurationError(ConfigurationError::UnsupportedConnector {
            scheme,
        })) => assert_eq!(scheme, "tcp"),
        other => panic!("expected unsupported connector, got {:?}", other.map(|c| c.id().clone())),
    }
}

#[tokio::test]
async fn test_registered_connector_is_used_for_its_scheme() {
    let factory = ConnectionFactory::new(tcp_config()).unwrap();
    let broker = InMemoryBroker::default();
    factory.register_connector(Arc::new(LoopbackConnector {
        inner: InMemoryConnector::new(broker.clone()),
    }));

    let connection = factory.create_connection().await.unwrap();
    assert_eq!(broker.connection_count(), 1);

    connection.close().await.unwrap();
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_connections_of_one_factory_share_a_broker() {
    let broker = InMemoryBroker::default();
    let factory = ConnectionFactory::with_broker(FactoryConfig::default(), broker.clone()).unwrap();

    let first = factory.create_connection().await.unwrap();
    let _second = factory.create_queue_connection().await.unwrap();
    let _third = factory.create_topic_connection().await.unwrap();
    assert_eq!(broker.connection_count(), 3);
    assert_eq!(factory.open_connection_count(), 3);

    first.close().await.unwrap();
    assert_eq!(factory.open_connection_count(), 2);
}

#[tokio::test]
async fn test_dropped_connection_handles_are_not_counted() {
    let factory = ConnectionFactory::new(FactoryConfig::default()).unwrap();
    {
        let _connection = factory.create_connection().await.unwrap();
        assert_eq!(factory.open_connection_count(), 1);
    }
    assert_eq!(factory.open_connection_count(), 0);
}

#[tokio::test]
async fn test_forced_ack_mode_applies_to_sessions() {
    let config = FactoryConfig {
        forced_ack_mode: Some(AckMode::DupsOk),
        ..FactoryConfig::default()
    };
    let factory = ConnectionFactory::new(config).unwrap();
    let connection = factory.create_connection().await.unwrap();

    let session = connection.create_session(false, AckMode::Client).await.unwrap();
    assert_eq!(session.ack_mode(), AckMode::DupsOk);
    let transacted = connection.create_session(true, AckMode::Client).await.unwrap();
    assert_eq!(transacted.ack_mode(), AckMode::Transacted);
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let config = FactoryConfig {
        scheme: ConnectorScheme::Tcp,
        address: None,
        ..FactoryConfig::default()
    };

    let result = ConnectionFactory::new(config);
    assert!(matches!(
        result,
        Err(MessagingError::ConfigurationError(ConfigurationError::Missing { .. }))
    ));
}

#[tokio::test]
async fn test_factory_from_config_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "client_id = \"from-file\"").unwrap();
    writeln!(file, "[producer]").unwrap();
    writeln!(file, "priority = 7").unwrap();

    let factory = ConnectionFactory::from_config_file(Some(file.path())).unwrap();
    assert_eq!(factory.config().producer.priority, 7);

    let connection = factory.create_connection().await.unwrap();
    assert_eq!(connection.client_id().as_deref(), Some("from-file"));
}
