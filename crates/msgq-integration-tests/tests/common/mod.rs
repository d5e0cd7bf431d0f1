//! Common test utilities for msgq integration tests
//!
//! This module provides:
//! - Factories sharing one inspectable in-memory broker
//! - Recording listeners for messages and connection errors
//! - Destination shorthands

use async_trait::async_trait;
use msgq_runtime::{
    AckMode, Connection, ConnectionFactory, Destination, ExceptionListener, FactoryConfig,
    InMemoryBroker, Message, MessageListener, MessagingError, Queue, Session, Topic,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Fixtures
// ============================================================================

/// A factory and the broker behind it
#[allow(dead_code)]
pub struct Harness {
    pub factory: ConnectionFactory,
    pub broker: InMemoryBroker,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(FactoryConfig::default())
    }

    pub fn with_config(config: FactoryConfig) -> Self {
        let broker = InMemoryBroker::new(config.in_memory.clone());
        let factory = ConnectionFactory::with_broker(config, broker.clone()).unwrap();
        Self { factory, broker }
    }

    pub async fn connection(&self) -> Connection {
        self.factory.create_connection().await.unwrap()
    }

    pub async fn started_connection(&self) -> Connection {
        let connection = self.connection().await;
        connection.start().await.unwrap();
        connection
    }

    /// A started connection with one session
    pub async fn session(&self, transacted: bool, ack_mode: AckMode) -> (Connection, Session) {
        let connection = self.started_connection().await;
        let session = connection.create_session(transacted, ack_mode).await.unwrap();
        (connection, session)
    }
}

#[allow(dead_code)]
pub fn queue(name: &str) -> Destination {
    Queue::new(name).unwrap().into()
}

#[allow(dead_code)]
pub fn topic(name: &str) -> Destination {
    Topic::new(name).unwrap().into()
}

#[allow(dead_code)]
pub async fn send_texts(session: &Session, destination: &Destination, texts: &[&str]) {
    let producer = session.create_producer(Some(destination)).unwrap();
    for text in texts {
        producer.send(Message::text(*text)).await.unwrap();
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Forwards message bodies to a channel
#[allow(dead_code)]
pub struct Collector {
    tx: mpsc::UnboundedSender<String>,
}

#[allow(dead_code)]
impl Collector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl MessageListener for Collector {
    async fn on_message(&self, message: Message) -> anyhow::Result<()> {
        let _ = self.tx.send(message.body_text()?.to_string());
        Ok(())
    }
}

/// Take the next collected body, failing after one second
#[allow(dead_code)]
pub async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("listener should receive a message")
        .expect("collector channel closed")
}

/// Records every error reported to a connection
#[derive(Default)]
#[allow(dead_code)]
pub struct ErrorRecorder {
    errors: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl ErrorRecorder {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl ExceptionListener for ErrorRecorder {
    fn on_exception(&self, error: &MessagingError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}
