//! Connections: the client's link to a broker and owner of its sessions.

use crate::broker::{BrokerConnection, Connector, ExceptionSink, Relay};
use crate::connection_consumer::{ConnectionConsumer, ServerSessionPool};
use crate::destination::Destination;
use crate::error::{MessagingError, ValidationError};
use crate::factory::FactoryInner;
use crate::message::{ConnectionId, SessionId};
use crate::provider::{AckMode, FactoryConfig, ProducerDefaults, SessionCapabilities};
use crate::session::{Session, SessionInner};
use crate::sync::lock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Static description of this client runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub provider_name: &'static str,
    pub provider_version: &'static str,
    pub api_version: &'static str,
    /// Message properties set by the provider
    pub supported_properties: &'static [&'static str],
}

/// Shared by every connection in the process
pub const METADATA: ConnectionMetadata = ConnectionMetadata {
    provider_name: "msgq",
    provider_version: env!("CARGO_PKG_VERSION"),
    api_version: "1.1",
    supported_properties: &["JMSXDeliveryCount", "JMSXGroupID", "JMSXGroupSeq"],
};

/// Receives asynchronous errors reported by the broker
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, error: &MessagingError);
}

#[derive(Default)]
struct ConnectionState {
    client_id: Option<String>,
    client_id_locked: bool,
    started: bool,
    closing: bool,
    closed: bool,
    sessions: HashMap<SessionId, Arc<SessionInner>>,
    exception_listener: Option<Arc<dyn ExceptionListener>>,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    broker: Arc<dyn BrokerConnection>,
    capabilities: SessionCapabilities,
    producer_defaults: ProducerDefaults,
    state: Mutex<ConnectionState>,
    lifecycle: tokio::sync::Mutex<()>,
    factory: Mutex<Weak<FactoryInner>>,
    temp_counter: AtomicU64,
}

impl ConnectionInner {
    pub(crate) fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) fn broker(&self) -> &Arc<dyn BrokerConnection> {
        &self.broker
    }

    fn ensure_open(state: &ConnectionState) -> Result<(), MessagingError> {
        if state.closed || state.closing {
            return Err(MessagingError::invalid_state("connection is closed"));
        }
        Ok(())
    }

    /// Check the connection is open and freeze the client identifier
    fn begin_operation(&self) -> Result<ConnectionStateSnapshot, MessagingError> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        state.client_id_locked = true;
        Ok(ConnectionStateSnapshot {
            started: state.started,
        })
    }

    pub(crate) fn allocate_temporary_name(&self, kind: &str) -> Result<String, MessagingError> {
        self.begin_operation()?;
        let sequence = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{}-tmp-{}-{}", self.id, kind, sequence))
    }

    pub(crate) fn remove_session(&self, session: &SessionId) {
        lock(&self.state).sessions.remove(session);
    }
}

struct ConnectionStateSnapshot {
    started: bool,
}

/// Handle to a broker connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("capabilities", &self.inner.capabilities)
            .finish()
    }
}

impl Connection {
    /// Connect through `connector` and register the configured client id
    pub(crate) async fn open(
        factory: &Arc<FactoryInner>,
        connector: &Arc<dyn Connector>,
        config: &FactoryConfig,
        capabilities: SessionCapabilities,
    ) -> Result<Self, MessagingError> {
        let relay = Arc::new(Relay::<ConnectionInner>::new());
        let broker = connector.connect(config, relay.clone()).await?;

        let inner = Arc::new(ConnectionInner {
            id: broker.connection_id().clone(),
            broker,
            capabilities,
            producer_defaults: config.producer.clone(),
            state: Mutex::new(ConnectionState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            factory: Mutex::new(Arc::downgrade(factory)),
            temp_counter: AtomicU64::new(1),
        });
        relay.bind(&inner);
        let connection = Self { inner };

        if let Some(client_id) = &config.client_id {
            connection.set_client_id(client_id).await?;
        }

        info!(
            connection_id = %connection.inner.id,
            scheme = %connector.scheme(),
            "Connection opened"
        );
        Ok(connection)
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn capabilities(&self) -> SessionCapabilities {
        self.inner.capabilities
    }

    pub fn metadata(&self) -> &'static ConnectionMetadata {
        &METADATA
    }

    pub fn client_id(&self) -> Option<String> {
        lock(&self.inner.state).client_id.clone()
    }

    pub fn is_started(&self) -> bool {
        lock(&self.inner.state).started
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.state).sessions.len()
    }

    /// Set the client identifier.
    ///
    /// Allowed once, and only before any other operation on the connection.
    pub async fn set_client_id(&self, client_id: &str) -> Result<(), MessagingError> {
        if client_id.is_empty() {
            return Err(ValidationError::Required {
                field: "client_id".to_string(),
            }
            .into());
        }

        {
            let mut state = lock(&self.inner.state);
            ConnectionInner::ensure_open(&state)?;
            if state.client_id_locked {
                return Err(MessagingError::invalid_state(
                    "client id can only be set once, before any other connection operation",
                ));
            }
            state.client_id_locked = true;
            state.client_id = Some(client_id.to_string());
        }

        if let Err(e) = self.inner.broker.set_client_id(client_id).await {
            let mut state = lock(&self.inner.state);
            state.client_id = None;
            state.client_id_locked = false;
            return Err(e);
        }

        debug!(connection_id = %self.inner.id, client_id, "Client id set");
        Ok(())
    }

    pub fn exception_listener(&self) -> Option<Arc<dyn ExceptionListener>> {
        lock(&self.inner.state).exception_listener.clone()
    }

    pub fn set_exception_listener(
        &self,
        listener: Option<Arc<dyn ExceptionListener>>,
    ) -> Result<(), MessagingError> {
        let mut state = lock(&self.inner.state);
        ConnectionInner::ensure_open(&state)?;
        state.client_id_locked = true;
        state.exception_listener = listener;
        Ok(())
    }

    /// Start delivery on every session; idempotent.
    ///
    /// A failing session start is returned as is; sessions already started
    /// stay started.
    pub async fn start(&self) -> Result<(), MessagingError> {
        let _guard = self.inner.lifecycle.lock().await;
        let sessions: Vec<_> = {
            let mut state = lock(&self.inner.state);
            ConnectionInner::ensure_open(&state)?;
            state.client_id_locked = true;
            if state.started {
                return Ok(());
            }
            state.sessions.values().cloned().collect()
        };

        for session in sessions {
            session.start().await?;
        }

        lock(&self.inner.state).started = true;
        info!(connection_id = %self.inner.id, "Connection started");
        Ok(())
    }

    /// Stop delivery on every session; idempotent.
    ///
    /// Returns once in-flight receives and listener callbacks have finished.
    pub async fn stop(&self) -> Result<(), MessagingError> {
        let sessions: Vec<_> = {
            let _guard = self.inner.lifecycle.lock().await;
            let mut state = lock(&self.inner.state);
            ConnectionInner::ensure_open(&state)?;
            state.client_id_locked = true;
            if !state.started {
                return Ok(());
            }
            state.started = false;
            state.sessions.values().cloned().collect()
        };

        for session in sessions {
            session.stop().await?;
        }

        info!(connection_id = %self.inner.id, "Connection stopped");
        Ok(())
    }

    /// Stop, close every session, release the broker connection and detach
    /// from the factory; idempotent
    pub async fn close(&self) -> Result<(), MessagingError> {
        let (was_started, sessions) = {
            let mut state = lock(&self.inner.state);
            if state.closed || state.closing {
                return Ok(());
            }
            state.closing = true;
            let was_started = std::mem::replace(&mut state.started, false);
            let sessions: Vec<_> = state.sessions.drain().map(|(_, s)| s).collect();
            (was_started, sessions)
        };

        if was_started {
            for session in &sessions {
                if let Err(e) = session.stop().await {
                    warn!(
                        connection_id = %self.inner.id,
                        session_id = %session.id(),
                        error = %e,
                        "Failed to stop session during close"
                    );
                }
            }
        }

        for session in sessions {
            if let Err(e) = session.close().await {
                warn!(
                    connection_id = %self.inner.id,
                    session_id = %session.id(),
                    error = %e,
                    "Failed to close session"
                );
            }
        }

        if let Err(e) = self.inner.broker.close().await {
            warn!(connection_id = %self.inner.id, error = %e, "Failed to close broker connection");
        }

        let factory = std::mem::take(&mut *lock(&self.inner.factory));
        if let Some(factory) = factory.upgrade() {
            factory.forget_connection(&self.inner.id);
        }

        {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            state.closing = false;
        }
        info!(connection_id = %self.inner.id, "Connection closed");
        Ok(())
    }

    /// Create a session; it starts immediately if the connection is started.
    ///
    /// `transacted` overrides `ack_mode`, and a configured forced mode
    /// overrides it for non-transacted sessions.
    pub async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Session, MessagingError> {
        let _guard = self.inner.lifecycle.lock().await;
        let snapshot = self.inner.begin_operation()?;

        let mode = self
            .inner
            .capabilities
            .effective_ack_mode(transacted, ack_mode);
        let session = SessionInner::open(
            &self.inner,
            mode,
            self.inner.capabilities,
            self.inner.producer_defaults.clone(),
        )
        .await?;
        let admitted = {
            let mut state = lock(&self.inner.state);
            let admitted = !(state.closed || state.closing);
            if admitted {
                state.sessions.insert(session.id().clone(), session.clone());
            }
            admitted
        };
        if !admitted {
            if let Err(e) = session.close().await {
                warn!(
                    connection_id = %self.inner.id,
                    session_id = %session.id(),
                    error = %e,
                    "Failed to close session opened during connection close"
                );
            }
            return Err(MessagingError::invalid_state("connection is closed"));
        }

        if snapshot.started {
            session.start().await?;
        }

        debug!(
            connection_id = %self.inner.id,
            session_id = %session.id(),
            ack_mode = %mode,
            "Session created"
        );
        Ok(Session::from_inner(session))
    }

    /// Validate deletion of a temporary destination owned by this connection
    pub async fn delete_temporary_destination(
        &self,
        destination: &Destination,
    ) -> Result<(), MessagingError> {
        self.inner.begin_operation()?;
        match destination.owner() {
            None => Err(MessagingError::invalid_destination(format!(
                "{} is not a temporary destination",
                destination
            ))),
            Some(owner) if owner != &self.inner.id => {
                Err(MessagingError::invalid_destination(format!(
                    "temporary destination {} belongs to connection {}",
                    destination, owner
                )))
            }
            Some(_) => {
                debug!(
                    connection_id = %self.inner.id,
                    destination = %destination,
                    "Temporary destination deleted"
                );
                Ok(())
            }
        }
    }

    /// Bridge deliveries from `destination` into sessions drawn from `pool`
    pub async fn create_connection_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        pool: Arc<dyn ServerSessionPool>,
    ) -> Result<ConnectionConsumer, MessagingError> {
        self.inner.begin_operation()?;
        ConnectionConsumer::open(self, destination, None, selector, pool).await
    }

    /// Bridge deliveries from a durable subscription into sessions drawn from `pool`
    pub async fn create_durable_connection_consumer(
        &self,
        topic: &Destination,
        subscription_name: &str,
        selector: Option<&str>,
        pool: Arc<dyn ServerSessionPool>,
    ) -> Result<ConnectionConsumer, MessagingError> {
        self.inner.begin_operation()?;
        ConnectionConsumer::open(self, topic, Some(subscription_name), selector, pool).await
    }

    /// Close on connection loss, then forward to the exception listener
    async fn handle_exception(&self, error: MessagingError) {
        warn!(connection_id = %self.inner.id, error = %error, "Broker reported an error");

        if error.is_connection_lost() {
            if let Err(e) = self.close().await {
                warn!(connection_id = %self.inner.id, error = %e, "Failed to close lost connection");
            }
        }

        let Some(listener) = self.exception_listener() else {
            return;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_exception(&error))).is_err() {
            error!(connection_id = %self.inner.id, "Exception listener panicked");
        }
    }
}

#[async_trait]
impl ExceptionSink for Relay<ConnectionInner> {
    async fn on_exception(&self, error: MessagingError) {
        match self.get() {
            Some(inner) => Connection::from_inner(inner).handle_exception(error).await,
            None => debug!(error = %error, "Exception for a dropped connection discarded"),
        }
    }
}
