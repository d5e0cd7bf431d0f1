//! Connection factory and connector registry.

use crate::broker::Connector;
use crate::connection::{Connection, ConnectionInner};
use crate::error::{ConfigurationError, MessagingError};
use crate::message::ConnectionId;
use crate::provider::{ConnectorScheme, FactoryConfig, SessionCapabilities};
use crate::providers::{InMemoryBroker, InMemoryConnector};
use crate::sync::{lock, read, write};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

#[cfg(test)]
#[path = "factory_tests.rs"]
mod tests;

pub(crate) struct FactoryInner {
    config: FactoryConfig,
    connectors: RwLock<HashMap<ConnectorScheme, Arc<dyn Connector>>>,
    connections: Mutex<HashMap<ConnectionId, Weak<ConnectionInner>>>,
}

impl FactoryInner {
    pub(crate) fn forget_connection(&self, connection: &ConnectionId) {
        lock(&self.connections).remove(connection);
    }
}

/// Creates connections against the configured connector scheme
#[derive(Clone)]
pub struct ConnectionFactory {
    inner: Arc<FactoryInner>,
}

impl ConnectionFactory {
    /// Create a factory with the in-memory connector registered.
    ///
    /// Every connection of this factory on the in-memory scheme shares one
    /// broker.
    pub fn new(config: FactoryConfig) -> Result<Self, MessagingError> {
        let broker = InMemoryBroker::new(config.in_memory.clone());
        Self::with_broker(config, broker)
    }

    /// Create a factory whose in-memory scheme uses `broker`
    pub fn with_broker(config: FactoryConfig, broker: InMemoryBroker) -> Result<Self, MessagingError> {
        config.validate()?;
        let mut connectors: HashMap<ConnectorScheme, Arc<dyn Connector>> = HashMap::new();
        connectors.insert(
            ConnectorScheme::InMemory,
            Arc::new(InMemoryConnector::new(broker)),
        );

        Ok(Self {
            inner: Arc::new(FactoryInner {
                config,
                connectors: RwLock::new(connectors),
                connections: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Load configuration with [`FactoryConfig::load`] and build a factory
    pub fn from_config_file(path: Option<&Path>) -> Result<Self, MessagingError> {
        Self::new(FactoryConfig::load(path)?)
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.inner.config
    }

    /// Register (or replace) the connector for its scheme
    pub fn register_connector(&self, connector: Arc<dyn Connector>) {
        let scheme = connector.scheme();
        write(&self.inner.connectors).insert(scheme, connector);
        debug!(scheme = %scheme, "Connector registered");
    }

    /// Number of connections created by this factory and not yet closed
    pub fn open_connection_count(&self) -> usize {
        lock(&self.inner.connections)
            .values()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Connection supporting both queues and topics
    pub async fn create_connection(&self) -> Result<Connection, MessagingError> {
        self.open(SessionCapabilities::generic()).await
    }

    /// Connection whose sessions only operate on queues
    pub async fn create_queue_connection(&self) -> Result<Connection, MessagingError> {
        self.open(SessionCapabilities::queue_only()).await
    }

    /// Connection whose sessions only operate on topics
    pub async fn create_topic_connection(&self) -> Result<Connection, MessagingError> {
        self.open(SessionCapabilities::topic_only()).await
    }

    async fn open(&self, capabilities: SessionCapabilities) -> Result<Connection, MessagingError> {
        let config = &self.inner.config;
        let connector = read(&self.inner.connectors)
            .get(&config.scheme)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnsupportedConnector {
                scheme: config.scheme.to_string(),
            })?;

        let capabilities = capabilities.with_forced_ack_mode(config.forced_ack_mode);
        let connection = Connection::open(&self.inner, &connector, config, capabilities).await?;
        lock(&self.inner.connections).insert(connection.id().clone(), connection.downgrade());
        Ok(connection)
    }
}
