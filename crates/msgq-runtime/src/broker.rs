//! Broker proxy interface consumed by connections and sessions.
//!
//! A broker implementation supplies one [`BrokerConnection`] per client
//! connection and one [`BrokerSession`] per client session. Messages and
//! errors flow back to the client through the [`DeliverySink`] and
//! [`ExceptionSink`] handed over at creation time.

use crate::destination::{Destination, Topic};
use crate::error::MessagingError;
use crate::message::{AckToken, ConnectionId, ConsumerId, Message, SessionId};
use crate::provider::{AckMode, ConnectorScheme, FactoryConfig};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock, Weak};

/// Connection-level broker operations
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Broker-assigned identity of this connection
    fn connection_id(&self) -> &ConnectionId;

    /// Create a broker session that pushes deliveries into `sink`
    async fn create_session(
        &self,
        ack_mode: AckMode,
        transacted: bool,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Arc<dyn BrokerSession>, MessagingError>;

    /// Register the client identifier
    async fn set_client_id(&self, client_id: &str) -> Result<(), MessagingError>;

    /// Release the connection and every session created on it
    async fn close(&self) -> Result<(), MessagingError>;
}

/// Session-level broker operations
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Broker-assigned identity of this session
    fn session_id(&self) -> &SessionId;

    /// Send (or, for transacted sessions, stage) a message
    async fn send(&self, message: &Message) -> Result<(), MessagingError>;

    /// Return an immediately available message for a synchronous consumer
    async fn receive_no_wait(
        &self,
        consumer: &ConsumerId,
    ) -> Result<Option<Message>, MessagingError>;

    /// Return up to `count` further messages for a browser, without consuming them
    async fn browse(
        &self,
        browser: &ConsumerId,
        count: usize,
    ) -> Result<Vec<Message>, MessagingError>;

    /// Acknowledge `token` and every earlier delivery on this session
    async fn acknowledge(&self, consumer: &ConsumerId, token: AckToken)
        -> Result<(), MessagingError>;

    /// Publish staged sends and consume delivered messages
    async fn commit(&self) -> Result<(), MessagingError>;

    /// Discard staged sends and redeliver consumed messages
    async fn rollback(&self) -> Result<(), MessagingError>;

    /// Redeliver every unacknowledged message
    async fn recover(&self) -> Result<(), MessagingError>;

    /// Begin pushing to asynchronous consumers
    async fn start(&self) -> Result<(), MessagingError>;

    /// Stop pushing to asynchronous consumers
    async fn stop(&self) -> Result<(), MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<ConsumerId, MessagingError>;

    async fn create_durable_consumer(
        &self,
        topic: &Topic,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<ConsumerId, MessagingError>;

    async fn create_browser(
        &self,
        queue: &Destination,
        selector: Option<&str>,
    ) -> Result<ConsumerId, MessagingError>;

    async fn close_consumer(&self, consumer: &ConsumerId) -> Result<(), MessagingError>;

    /// Switch a consumer between push delivery and polling
    async fn set_asynchronous(
        &self,
        consumer: &ConsumerId,
        enabled: bool,
    ) -> Result<(), MessagingError>;

    /// Remove a durable subscription
    async fn unsubscribe(&self, name: &str) -> Result<(), MessagingError>;
}

/// Receives broker pushes for one session
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Deliver a message to an asynchronous consumer
    async fn deliver(&self, message: Message);

    /// Signal that a synchronous consumer may now find a message
    fn message_available(&self);
}

/// Receives asynchronous broker failures for one connection
#[async_trait]
pub trait ExceptionSink: Send + Sync {
    async fn on_exception(&self, error: MessagingError);
}

/// Opens broker connections for one [`ConnectorScheme`]
#[async_trait]
pub trait Connector: Send + Sync {
    fn scheme(&self) -> ConnectorScheme;

    async fn connect(
        &self,
        config: &FactoryConfig,
        events: Arc<dyn ExceptionSink>,
    ) -> Result<Arc<dyn BrokerConnection>, MessagingError>;
}

/// Late-bound weak link from a broker-side sink to its client object.
///
/// The broker needs its sink before the client object exists, and must not
/// keep the client object alive.
pub(crate) struct Relay<T> {
    target: OnceLock<Weak<T>>,
}

impl<T> Relay<T> {
    pub(crate) fn new() -> Self {
        Self {
            target: OnceLock::new(),
        }
    }

    pub(crate) fn bind(&self, target: &Arc<T>) {
        let _ = self.target.set(Arc::downgrade(target));
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        self.target.get().and_then(Weak::upgrade)
    }
}
