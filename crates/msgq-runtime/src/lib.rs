//! # msgq runtime
//!
//! Session-based messaging client runtime supporting point-to-point queues and
//! publish/subscribe topics.
//!
//! This library provides:
//! - Connections, sessions, producers and consumers with enforced lifecycles
//! - Auto, client, duplicates-ok and transacted acknowledgment modes
//! - Blocking receive with single-blocker exclusion and listener dispatch
//! - Connection consumers that feed a pool of server sessions
//! - Hierarchical topic names with `*` and `**` wildcards
//! - Temporary destinations scoped to their creating connection
//! - An in-memory broker for tests and development
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all messaging operations
//! - [`message`] - Messages, identifiers and header types
//! - [`destination`] - Queues, topics and temporary destinations
//! - [`wildcard`] - Topic wildcard validation and matching
//! - [`provider`] - Acknowledgment modes, capabilities and configuration
//! - [`broker`] - Broker proxy traits implemented by connectors
//! - [`factory`], [`connection`], [`session`], [`producer`], [`consumer`] - Client API
//! - [`connection_consumer`] - Server session pool bridge
//! - [`providers`] - In-memory broker
//!
//! ## Example
//!
//! ```rust
//! use msgq_runtime::{AckMode, ConnectionFactory, Destination, FactoryConfig, Message, Queue};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let factory = ConnectionFactory::new(FactoryConfig::default()).unwrap();
//! let connection = factory.create_connection().await.unwrap();
//! connection.start().await.unwrap();
//!
//! let session = connection.create_session(false, AckMode::Auto).await.unwrap();
//! let orders: Destination = Queue::new("orders").unwrap().into();
//! let producer = session.create_producer(Some(&orders)).unwrap();
//! producer.send(Message::text("order-1")).await.unwrap();
//!
//! let consumer = session.create_consumer(&orders, None, false).await.unwrap();
//! let message = consumer.receive(Duration::from_secs(1)).await.unwrap().unwrap();
//! assert_eq!(message.body_text().unwrap(), "order-1");
//!
//! connection.close().await.unwrap();
//! # });
//! ```

pub mod broker;
pub mod connection;
pub mod connection_consumer;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod factory;
pub mod message;
pub mod producer;
pub mod provider;
pub mod providers;
pub mod session;
pub mod wildcard;

mod sync;

// Re-export commonly used types at crate root for convenience
pub use broker::{BrokerConnection, BrokerSession, Connector, DeliverySink, ExceptionSink};
pub use connection::{Connection, ConnectionMetadata, ExceptionListener, METADATA};
pub use connection_consumer::{
    ConnectionConsumer, ServerSession, ServerSessionPool, SimpleServerSession,
    SimpleServerSessionPool,
};
pub use consumer::{MessageConsumer, MessageListener, QueueBrowser, BROWSE_BATCH_SIZE};
pub use destination::{Destination, Queue, TemporaryQueue, TemporaryTopic, Topic};
pub use error::{ConfigurationError, MessagingError, SerializationError, ValidationError};
pub use factory::ConnectionFactory;
pub use message::{
    AckToken, ConnectionId, ConsumerId, DeliveryMode, Message, MessageId, Priority, SessionId,
    Timestamp,
};
pub use producer::{MessageProducer, SendOptions};
pub use provider::{
    AckMode, ConnectorScheme, FactoryConfig, InMemoryConfig, ProducerDefaults,
    SessionCapabilities,
};
pub use providers::{InMemoryBroker, InMemoryConnector, Selector};
pub use session::Session;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
