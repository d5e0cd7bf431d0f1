//! Sessions: the single-threaded delivery context for consumers and producers.
//!
//! A session owns its consumers and producers, applies its acknowledgment
//! mode, enforces the one-blocked-receiver rule and buffers outbound messages
//! while transacted. Broker pushes arrive through [`DeliverySink`] and are
//! dispatched to the session listener or the addressed consumer's listener.
//!
//! Start, stop and close are coordinated through a [`DeliveryGate`]: receive
//! polls and listener callbacks run only while the gate is open, and stop and
//! close wait for the ones already running to finish.

use crate::broker::{BrokerSession, DeliverySink, Relay};
use crate::connection::ConnectionInner;
use crate::consumer::{ConsumerKind, ConsumerState, MessageConsumer, MessageListener, QueueBrowser};
use crate::destination::{Destination, TemporaryQueue, TemporaryTopic};
use crate::error::{MessagingError, ValidationError};
use crate::message::{ConnectionId, ConsumerId, Message, SessionId};
use crate::producer::{MessageProducer, ProducerState};
use crate::provider::{AckMode, ProducerDefaults, SessionCapabilities};
use crate::sync::{lock, read, write};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

tokio::task_local! {
    /// Sessions whose listeners are running on the current task, outermost first
    static DISPATCHING: Vec<SessionId>;
}

// ============================================================================
// Delivery Gate
// ============================================================================

#[derive(Debug, Default)]
struct GateState {
    started: bool,
    closed: bool,
    in_flight: usize,
}

/// Admission control for receive polls and listener callbacks
#[derive(Default)]
struct DeliveryGate {
    state: Mutex<GateState>,
    changed: Notify,
}

/// Proof of admission; dropping it releases the in-flight slot
struct GatePass<'a> {
    gate: &'a DeliveryGate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.gate.state);
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.changed.notify_waiters();
        }
    }
}

impl DeliveryGate {
    fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    /// Admit only if delivery is currently running
    fn try_enter(&self) -> Option<GatePass<'_>> {
        let mut state = lock(&self.state);
        if !state.started || state.closed {
            return None;
        }
        state.in_flight += 1;
        Some(GatePass { gate: self })
    }

    /// Admit once delivery is running; `None` if the gate is sealed first
    async fn enter(&self) -> Option<GatePass<'_>> {
        loop {
            let changed = self.changed.notified();
            {
                let mut state = lock(&self.state);
                if state.closed {
                    return None;
                }
                if state.started {
                    state.in_flight += 1;
                    return Some(GatePass { gate: self });
                }
            }
            changed.await;
        }
    }

    /// Admit regardless of started state; `None` once sealed
    fn admit(&self) -> Option<GatePass<'_>> {
        let mut state = lock(&self.state);
        if state.closed {
            return None;
        }
        state.in_flight += 1;
        Some(GatePass { gate: self })
    }

    fn open(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.started = true;
        }
        self.changed.notify_waiters();
    }

    fn halt(&self) {
        lock(&self.state).started = false;
        self.changed.notify_waiters();
    }

    fn seal(&self) {
        let mut state = lock(&self.state);
        state.started = false;
        state.closed = true;
        self.changed.notify_waiters();
    }

    /// Wait until no admitted work remains
    async fn drain(&self) {
        loop {
            let changed = self.changed.notified();
            if lock(&self.state).in_flight == 0 {
                return;
            }
            changed.await;
        }
    }
}

// ============================================================================
// Session internals
// ============================================================================

#[derive(Default)]
struct SessionState {
    consumers: HashMap<ConsumerId, Arc<ConsumerState>>,
    /// Every consumer ever created here; deliveries of closed consumers stay acknowledgeable
    issued: HashSet<ConsumerId>,
    producers: HashMap<u64, Arc<ProducerState>>,
    pending_sends: Vec<Message>,
    blocker: Option<ConsumerId>,
}

/// Marks a consumer as the session's blocked receiver until dropped
struct BlockerGuard<'a> {
    session: &'a SessionInner,
}

impl<'a> BlockerGuard<'a> {
    fn register(session: &'a SessionInner, consumer: &ConsumerId) -> Result<Self, MessagingError> {
        let mut state = lock(&session.state);
        if let Some(current) = &state.blocker {
            return Err(MessagingError::invalid_state(format!(
                "consumer {} is already blocked in receive on this session",
                current
            )));
        }
        state.blocker = Some(consumer.clone());
        Ok(Self { session })
    }
}

impl Drop for BlockerGuard<'_> {
    fn drop(&mut self) {
        lock(&self.session.state).blocker = None;
    }
}

pub(crate) struct SessionInner {
    id: SessionId,
    ack_mode: AckMode,
    capabilities: SessionCapabilities,
    broker: Arc<dyn BrokerSession>,
    connection: Weak<ConnectionInner>,
    connection_id: ConnectionId,
    producer_defaults: ProducerDefaults,
    state: Mutex<SessionState>,
    gate: DeliveryGate,
    wakeup: Notify,
    closing: Mutex<bool>,
    closed: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    session_listener: RwLock<Option<Arc<dyn MessageListener>>>,
    run_queue: Mutex<VecDeque<Message>>,
    next_producer_id: AtomicU64,
}

impl SessionInner {
    /// Create the broker session and wire its delivery sink back to us
    pub(crate) async fn open(
        connection: &Arc<ConnectionInner>,
        ack_mode: AckMode,
        capabilities: SessionCapabilities,
        producer_defaults: ProducerDefaults,
    ) -> Result<Arc<Self>, MessagingError> {
        let relay = Arc::new(Relay::<SessionInner>::new());
        let broker = connection
            .broker()
            .create_session(ack_mode, ack_mode == AckMode::Transacted, relay.clone())
            .await?;

        let inner = Arc::new(Self {
            id: broker.session_id().clone(),
            ack_mode,
            capabilities,
            broker,
            connection: Arc::downgrade(connection),
            connection_id: connection.id().clone(),
            producer_defaults,
            state: Mutex::new(SessionState::default()),
            gate: DeliveryGate::default(),
            wakeup: Notify::new(),
            closing: Mutex::new(false),
            closed: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            session_listener: RwLock::new(None),
            run_queue: Mutex::new(VecDeque::new()),
            next_producer_id: AtomicU64::new(1),
        });
        relay.bind(&inner);

        debug!(
            session_id = %inner.id,
            connection_id = %inner.connection_id,
            ack_mode = %ack_mode,
            "Session opened"
        );
        Ok(inner)
    }

    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn broker(&self) -> &Arc<dyn BrokerSession> {
        &self.broker
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        *lock(&self.closing)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.is_closed() || self.is_closing() {
            return Err(MessagingError::invalid_state("session is closed"));
        }
        Ok(())
    }

    fn is_transacted(&self) -> bool {
        self.ack_mode == AckMode::Transacted
    }

    /// A listener of this session is running on the current task, possibly
    /// with listeners of other sessions nested inside it
    fn in_own_callback(&self) -> bool {
        DISPATCHING
            .try_with(|ids| ids.contains(&self.id))
            .unwrap_or(false)
    }

    async fn drain(&self) {
        if self.in_own_callback() {
            return;
        }
        self.gate.drain().await;
    }

    /// Lifecycle lock, skipped from inside this session's own listener where
    /// a concurrent stop may be draining that very callback
    async fn lifecycle_guard(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.in_own_callback() {
            return None;
        }
        Some(self.lifecycle.lock().await)
    }

    /// Reject temporary destinations of other connections and destination
    /// kinds this session does not support
    pub(crate) fn check_destination(&self, destination: &Destination) -> Result<(), MessagingError> {
        self.check_destination_kind(destination)?;
        if let Some(owner) = destination.owner() {
            if owner != &self.connection_id {
                return Err(MessagingError::invalid_destination(format!(
                    "temporary destination {} belongs to connection {}",
                    destination, owner
                )));
            }
        }
        Ok(())
    }

    /// Reject destination kinds this session does not support
    pub(crate) fn check_destination_kind(&self, destination: &Destination) -> Result<(), MessagingError> {
        if destination.is_queue() && !self.capabilities.allows_queue_ops {
            return Err(MessagingError::invalid_destination(format!(
                "{} is a queue; this session only supports topics",
                destination
            )));
        }
        if destination.is_topic() && !self.capabilities.allows_topic_ops {
            return Err(MessagingError::invalid_destination(format!(
                "{} is a topic; this session only supports queues",
                destination
            )));
        }
        Ok(())
    }

    pub(crate) fn is_blocked_on(&self, consumer: &ConsumerId) -> bool {
        lock(&self.state).blocker.as_ref() == Some(consumer)
    }

    fn register_consumer(&self, consumer: Arc<ConsumerState>) {
        let mut state = lock(&self.state);
        state.issued.insert(consumer.id.clone());
        state.consumers.insert(consumer.id.clone(), consumer);
    }

    fn issued_consumer(&self, consumer: &ConsumerId) -> bool {
        lock(&self.state).issued.contains(consumer)
    }

    pub(crate) async fn remove_consumer(&self, consumer: &ConsumerId) -> Result<(), MessagingError> {
        let removed = lock(&self.state).consumers.remove(consumer);
        self.wakeup.notify_waiters();
        if removed.is_none() || self.is_closed() {
            return Ok(());
        }
        self.broker.close_consumer(consumer).await?;
        debug!(session_id = %self.id, consumer_id = %consumer, "Consumer closed");
        Ok(())
    }

    pub(crate) fn remove_producer(&self, producer: u64) {
        lock(&self.state).producers.remove(&producer);
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    pub(crate) async fn send(&self, message: Message) -> Result<(), MessagingError> {
        self.ensure_open()?;
        if self.is_transacted() {
            let mut state = lock(&self.state);
            state.pending_sends.push(message);
            debug!(
                session_id = %self.id,
                pending = state.pending_sends.len(),
                "Message buffered for commit"
            );
            return Ok(());
        }
        self.broker.send(&message).await
    }

    // ------------------------------------------------------------------------
    // Synchronous receive
    // ------------------------------------------------------------------------

    pub(crate) async fn receive(
        &self,
        consumer: &ConsumerState,
        timeout: Duration,
    ) -> Result<Option<Message>, MessagingError> {
        self.ensure_open()?;
        let _blocker = BlockerGuard::register(self, &consumer.id)?;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            let woken = self.wakeup.notified();
            if self.is_closed() || self.is_closing() || consumer.is_closed() {
                return Ok(None);
            }

            match self.poll(consumer).await {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                // The broker may drop its side before the session learns it is closing
                Err(_) if self.is_closing() || self.is_closed() || consumer.is_closed() => {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }

            match deadline {
                None => woken.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, woken).await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    pub(crate) async fn receive_no_wait(
        &self,
        consumer: &ConsumerState,
    ) -> Result<Option<Message>, MessagingError> {
        self.ensure_open()?;
        if consumer.is_closed() {
            return Ok(None);
        }
        self.poll(consumer).await
    }

    /// One broker poll, only while delivery is running
    async fn poll(&self, consumer: &ConsumerState) -> Result<Option<Message>, MessagingError> {
        let Some(_pass) = self.gate.try_enter() else {
            return Ok(None);
        };

        let message = self.broker.receive_no_wait(&consumer.id).await?;
        if let Some(message) = &message {
            if self.ack_mode.acknowledges_on_delivery() {
                self.acknowledge_delivery(message).await?;
            }
        }
        Ok(message)
    }

    async fn acknowledge_delivery(&self, message: &Message) -> Result<(), MessagingError> {
        match (&message.consumer_id, message.ack_token) {
            (Some(consumer), Some(token)) => self.broker.acknowledge(consumer, token).await,
            _ => Ok(()),
        }
    }

    /// Acknowledge on behalf of the connection-consumer bridge
    pub(crate) async fn acknowledge_now(&self, message: &Message) -> Result<(), MessagingError> {
        self.acknowledge_delivery(message).await
    }

    // ------------------------------------------------------------------------
    // Asynchronous dispatch
    // ------------------------------------------------------------------------

    async fn dispatch_pushed(&self, message: Message) {
        let Some(_pass) = self.gate.enter().await else {
            debug!(session_id = %self.id, "Session closed, dropping pushed message");
            return;
        };
        self.dispatch(message, true).await;
    }

    fn session_listener(&self) -> Option<Arc<dyn MessageListener>> {
        read(&self.session_listener).clone()
    }

    /// Hand one message to its listener; the session listener takes
    /// precedence over consumer listeners
    async fn dispatch(&self, message: Message, acknowledge: bool) {
        let consumer_id = message.consumer_id.clone();
        let listener = self.session_listener().or_else(|| {
            let consumer = consumer_id
                .as_ref()
                .and_then(|id| lock(&self.state).consumers.get(id).cloned())?;
            if consumer.is_closed() || consumer.kind == ConsumerKind::Browser {
                return None;
            }
            consumer.listener()
        });

        let Some(listener) = listener else {
            warn!(
                session_id = %self.id,
                consumer_id = ?consumer_id,
                "No listener for delivered message, dropping it"
            );
            return;
        };

        let message_id = message.message_id.clone();
        let ack_token = message.ack_token;
        let mut dispatching = DISPATCHING.try_with(Vec::clone).unwrap_or_default();
        dispatching.push(self.id.clone());
        let outcome = DISPATCHING
            .scope(
                dispatching,
                AssertUnwindSafe(listener.on_message(message)).catch_unwind(),
            )
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                session_id = %self.id,
                message_id = ?message_id,
                error = %e,
                "Message listener failed"
            ),
            Err(_) => error!(
                session_id = %self.id,
                message_id = ?message_id,
                "Message listener panicked"
            ),
        }

        if !acknowledge || !self.ack_mode.acknowledges_on_delivery() || self.is_closed() {
            return;
        }
        if let (Some(consumer), Some(token)) = (consumer_id, ack_token) {
            if let Err(e) = self.broker.acknowledge(&consumer, token).await {
                warn!(session_id = %self.id, error = %e, "Acknowledgment after dispatch failed");
            }
        }
    }

    pub(crate) fn enqueue(&self, message: Message) {
        lock(&self.run_queue).push_back(message);
    }

    async fn run(&self) {
        let Some(_pass) = self.gate.admit() else {
            return;
        };
        loop {
            let next = lock(&self.run_queue).pop_front();
            let Some(message) = next else {
                break;
            };
            self.dispatch(message, false).await;
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub(crate) async fn start(&self) -> Result<(), MessagingError> {
        let _guard = self.lifecycle_guard().await;
        self.ensure_open()?;
        if self.gate.is_started() {
            return Ok(());
        }

        self.broker.start().await?;
        self.gate.open();
        self.wakeup.notify_waiters();
        debug!(session_id = %self.id, "Session started");
        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<(), MessagingError> {
        let _guard = self.lifecycle_guard().await;
        if self.is_closed() || !self.gate.is_started() {
            return Ok(());
        }

        self.gate.halt();
        self.broker.stop().await?;
        self.drain().await;
        debug!(session_id = %self.id, "Session stopped");
        Ok(())
    }

    pub(crate) async fn close(&self) -> Result<(), MessagingError> {
        {
            let mut closing = lock(&self.closing);
            if *closing {
                return Ok(());
            }
            *closing = true;
        }

        self.gate.halt();
        self.wakeup.notify_waiters();
        if let Err(e) = self.broker.stop().await {
            warn!(session_id = %self.id, error = %e, "Failed to stop broker session during close");
        }
        self.drain().await;

        self.closed.store(true, Ordering::Release);
        self.gate.seal();
        self.wakeup.notify_waiters();

        let (producers, consumers) = {
            let mut state = lock(&self.state);
            state.pending_sends.clear();
            let producers: Vec<_> = state.producers.drain().map(|(_, p)| p).collect();
            let consumers: Vec<_> = state.consumers.drain().map(|(_, c)| c).collect();
            (producers, consumers)
        };

        for producer in producers {
            producer.mark_closed();
        }
        for consumer in consumers {
            consumer.mark_closed();
            if let Err(e) = self.broker.close_consumer(&consumer.id).await {
                warn!(
                    session_id = %self.id,
                    consumer_id = %consumer.id,
                    error = %e,
                    "Failed to close consumer"
                );
            }
        }
        lock(&self.run_queue).clear();

        if let Some(connection) = self.connection.upgrade() {
            connection.remove_session(&self.id);
        }

        self.broker.close().await?;
        info!(session_id = %self.id, connection_id = %self.connection_id, "Session closed");
        Ok(())
    }
}

#[async_trait]
impl DeliverySink for Relay<SessionInner> {
    async fn deliver(&self, message: Message) {
        match self.get() {
            Some(session) => session.dispatch_pushed(message).await,
            None => debug!("Delivery for a dropped session discarded"),
        }
    }

    fn message_available(&self) {
        if let Some(session) = self.get() {
            session.wakeup.notify_waiters();
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Handle to a session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("ack_mode", &self.inner.ack_mode)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    pub fn is_transacted(&self) -> bool {
        self.inner.is_transacted()
    }

    pub fn capabilities(&self) -> SessionCapabilities {
        self.inner.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    pub fn create_message(&self, body: Bytes) -> Result<Message, MessagingError> {
        self.inner.ensure_open()?;
        Ok(Message::new(body))
    }

    pub fn create_text_message(&self, text: impl Into<String>) -> Result<Message, MessagingError> {
        self.inner.ensure_open()?;
        Ok(Message::text(text))
    }

    pub fn create_json_message<T: Serialize>(&self, value: &T) -> Result<Message, MessagingError> {
        self.inner.ensure_open()?;
        Ok(Message::json(value)?)
    }

    // ------------------------------------------------------------------------
    // Producers and consumers
    // ------------------------------------------------------------------------

    /// Create a producer; `None` gives an unidentified producer
    pub fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> Result<MessageProducer, MessagingError> {
        self.inner.ensure_open()?;
        if let Some(destination) = destination {
            self.inner.check_destination(destination)?;
            if destination.is_wildcard() {
                return Err(MessagingError::invalid_destination(format!(
                    "cannot publish to wildcard topic {}",
                    destination
                )));
            }
        }

        let id = self.inner.next_producer_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ProducerState::new(id));
        lock(&self.inner.state).producers.insert(id, state.clone());

        Ok(MessageProducer::new(
            state,
            self.inner.clone(),
            destination.cloned(),
            &self.inner.producer_defaults,
        ))
    }

    /// Create a queue receiver or topic subscriber
    pub async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<MessageConsumer, MessagingError> {
        self.inner.ensure_open()?;
        self.inner.check_destination(destination)?;

        let kind = if destination.is_queue() {
            ConsumerKind::Receiver
        } else {
            ConsumerKind::Subscriber
        };
        let id = self
            .inner
            .broker
            .create_consumer(destination, selector, no_local)
            .await?;

        debug!(
            session_id = %self.inner.id,
            consumer_id = %id,
            destination = %destination,
            "Consumer created"
        );
        let state = Arc::new(ConsumerState::new(
            id,
            destination.clone(),
            selector.map(str::to_owned),
            no_local,
            kind,
        ));
        self.inner.register_consumer(state.clone());
        Ok(MessageConsumer::new(state, self.inner.clone()))
    }

    pub async fn create_durable_subscriber(
        &self,
        destination: &Destination,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<MessageConsumer, MessagingError> {
        self.inner.ensure_open()?;
        if !self.inner.capabilities.allows_topic_ops {
            return Err(MessagingError::invalid_state(
                "durable subscriptions require a topic-capable session",
            ));
        }

        let topic = match destination {
            Destination::Topic(topic) => topic,
            Destination::TemporaryTopic(_) => {
                return Err(MessagingError::invalid_destination(
                    "durable subscriptions cannot use temporary topics",
                ))
            }
            other => {
                return Err(MessagingError::invalid_destination(format!(
                    "durable subscriptions require a topic, got {}",
                    other
                )))
            }
        };
        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "subscription_name".to_string(),
            }
            .into());
        }

        let id = self
            .inner
            .broker
            .create_durable_consumer(topic, name, selector, no_local)
            .await?;

        debug!(
            session_id = %self.inner.id,
            consumer_id = %id,
            subscription = name,
            "Durable subscriber created"
        );
        let state = Arc::new(ConsumerState::new(
            id,
            destination.clone(),
            selector.map(str::to_owned),
            no_local,
            ConsumerKind::Durable {
                name: name.to_string(),
            },
        ));
        self.inner.register_consumer(state.clone());
        Ok(MessageConsumer::new(state, self.inner.clone()))
    }

    /// Remove a durable subscription that no consumer of this session is using
    pub async fn unsubscribe(&self, name: &str) -> Result<(), MessagingError> {
        self.inner.ensure_open()?;
        let active = lock(&self.inner.state)
            .consumers
            .values()
            .any(|c| !c.is_closed() && c.subscription_name() == Some(name));
        if active {
            return Err(MessagingError::invalid_state(format!(
                "durable subscription '{}' has an active subscriber",
                name
            )));
        }
        self.inner.broker.unsubscribe(name).await
    }

    pub async fn create_browser(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<QueueBrowser, MessagingError> {
        self.inner.ensure_open()?;
        if !self.inner.capabilities.allows_queue_ops {
            return Err(MessagingError::invalid_state(
                "queue browsers require a queue-capable session",
            ));
        }
        if !destination.is_queue() {
            return Err(MessagingError::invalid_destination(format!(
                "only queues can be browsed, got {}",
                destination
            )));
        }
        self.inner.check_destination(destination)?;

        let id = self.inner.broker.create_browser(destination, selector).await?;
        let state = Arc::new(ConsumerState::new(
            id,
            destination.clone(),
            selector.map(str::to_owned),
            false,
            ConsumerKind::Browser,
        ));
        self.inner.register_consumer(state.clone());
        Ok(QueueBrowser::new(state, self.inner.clone()))
    }

    // ------------------------------------------------------------------------
    // Temporary destinations
    // ------------------------------------------------------------------------

    fn owning_connection(&self) -> Result<Arc<ConnectionInner>, MessagingError> {
        self.inner
            .connection
            .upgrade()
            .ok_or_else(|| MessagingError::invalid_state("connection is closed"))
    }

    pub fn create_temporary_queue(&self) -> Result<TemporaryQueue, MessagingError> {
        self.inner.ensure_open()?;
        if !self.inner.capabilities.allows_queue_ops {
            return Err(MessagingError::invalid_state(
                "temporary queues require a queue-capable session",
            ));
        }
        let connection = self.owning_connection()?;
        let name = connection.allocate_temporary_name("queue")?;
        Ok(TemporaryQueue::new(
            name,
            self.inner.connection_id.clone(),
            Arc::downgrade(&connection),
        ))
    }

    pub fn create_temporary_topic(&self) -> Result<TemporaryTopic, MessagingError> {
        self.inner.ensure_open()?;
        if !self.inner.capabilities.allows_topic_ops {
            return Err(MessagingError::invalid_state(
                "temporary topics require a topic-capable session",
            ));
        }
        let connection = self.owning_connection()?;
        let name = connection.allocate_temporary_name("topic")?;
        Ok(TemporaryTopic::new(
            name,
            self.inner.connection_id.clone(),
            Arc::downgrade(&connection),
        ))
    }

    // ------------------------------------------------------------------------
    // Acknowledgment and transactions
    // ------------------------------------------------------------------------

    /// Acknowledge `message` and every earlier delivery on this session.
    ///
    /// Only meaningful in client-acknowledge mode; a no-op otherwise.
    pub async fn acknowledge(&self, message: &Message) -> Result<(), MessagingError> {
        self.inner.ensure_open()?;
        if self.inner.ack_mode != AckMode::Client {
            return Ok(());
        }
        let (Some(consumer), Some(token)) = (&message.consumer_id, message.ack_token) else {
            return Err(MessagingError::invalid_state(
                "message was not delivered by this runtime and cannot be acknowledged",
            ));
        };
        if !self.inner.issued_consumer(consumer) {
            return Err(MessagingError::invalid_state(format!(
                "message was delivered to consumer {} of another session",
                consumer
            )));
        }
        self.inner.broker.acknowledge(consumer, token).await
    }

    /// Publish buffered sends in order, then commit consumed messages.
    ///
    /// The buffer is cleared even if a send or the commit fails, so a partial
    /// failure cannot be retried.
    pub async fn commit(&self) -> Result<(), MessagingError> {
        self.inner.ensure_open()?;
        if !self.inner.is_transacted() {
            return Err(MessagingError::invalid_state(
                "commit requires a transacted session",
            ));
        }

        let pending = std::mem::take(&mut lock(&self.inner.state).pending_sends);
        let count = pending.len();
        for message in &pending {
            self.inner.broker.send(message).await?;
        }
        self.inner.broker.commit().await?;
        debug!(session_id = %self.inner.id, sent = count, "Transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), MessagingError> {
        self.inner.ensure_open()?;
        if !self.inner.is_transacted() {
            return Err(MessagingError::invalid_state(
                "rollback requires a transacted session",
            ));
        }

        let discarded = std::mem::take(&mut lock(&self.inner.state).pending_sends).len();
        self.inner.broker.rollback().await?;
        debug!(session_id = %self.inner.id, discarded, "Transaction rolled back");
        Ok(())
    }

    /// Redeliver every unacknowledged message
    pub async fn recover(&self) -> Result<(), MessagingError> {
        self.inner.ensure_open()?;
        if self.inner.is_transacted() {
            return Err(MessagingError::invalid_state(
                "recover is not available on a transacted session",
            ));
        }
        self.inner.broker.recover().await
    }

    // ------------------------------------------------------------------------
    // Session listener
    // ------------------------------------------------------------------------

    /// Register a listener that receives every message delivered to this
    /// session, in place of the consumers' own listeners
    pub fn set_message_listener(
        &self,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<(), MessagingError> {
        self.inner.ensure_open()?;
        *write(&self.inner.session_listener) = listener;
        Ok(())
    }

    pub fn message_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.inner.session_listener()
    }

    /// Dispatch every message queued by a connection consumer to the session
    /// listener, on the calling task
    pub async fn run(&self) {
        self.inner.run().await;
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.inner.close().await
    }
}
