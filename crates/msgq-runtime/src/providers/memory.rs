//! In-memory broker for testing and development.
//!
//! This module provides a fully functional in-process broker that:
//! - Routes queue messages to competing consumers in FIFO order
//! - Fans topic messages out to subscribers, honouring wildcard patterns
//! - Retains messages for inactive durable subscriptions
//! - Applies selectors, `no_local` filtering and message expiration
//! - Tracks cumulative acknowledgment, transactions and redelivery per session
//! - Pushes to asynchronous consumers from one tokio task per session
//!
//! All broker state lives behind one mutex that is never held across an
//! `.await`; sinks are invoked after the lock has been released.

use super::selector::Selector;
use crate::broker::{BrokerConnection, BrokerSession, Connector, DeliverySink, ExceptionSink};
use crate::destination::{Destination, Topic};
use crate::error::MessagingError;
use crate::message::{AckToken, ConnectionId, ConsumerId, Message, SessionId};
use crate::provider::{AckMode, ConnectorScheme, FactoryConfig, InMemoryConfig};
use crate::sync::lock;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const PROVIDER: &str = "in_memory";

fn provider_error(code: &str, message: impl Into<String>) -> MessagingError {
    MessagingError::ProviderError {
        provider: PROVIDER.to_string(),
        code: code.to_string(),
        message: message.into(),
    }
}

fn unknown(kind: &str, id: impl std::fmt::Display) -> MessagingError {
    MessagingError::invalid_state(format!("unknown {} {}", kind, id))
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message together with the connection that published it
#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    origin: ConnectionId,
}

impl StoredMessage {
    fn is_expired(&self) -> bool {
        self.message.is_expired()
    }
}

/// Durable subscriptions are scoped by client id
type DurableKey = (Option<String>, String);

/// Where a delivered message returns to on redelivery
#[derive(Debug, Clone)]
enum Origin {
    Queue(Destination),
    Subscriber(ConsumerId),
    Durable(DurableKey),
}

#[derive(Debug)]
struct Unacknowledged {
    token: AckToken,
    stored: StoredMessage,
    origin: Origin,
}

enum ConsumerSource {
    Queue,
    Subscriber(VecDeque<StoredMessage>),
    Durable(DurableKey),
    Browser(HashSet<String>),
}

struct ConsumerRecord {
    session: SessionId,
    connection: ConnectionId,
    destination: Destination,
    selector: Option<Selector>,
    no_local: bool,
    asynchronous: bool,
    source: ConsumerSource,
}

impl ConsumerRecord {
    /// Topic routing filter applied when a message is published
    fn accepts(&self, stored: &StoredMessage) -> bool {
        if self.no_local && stored.origin == self.connection {
            return false;
        }
        self.selector
            .as_ref()
            .map_or(true, |s| s.matches(&stored.message))
    }
}

struct DurableSubscription {
    topic: Topic,
    selector: Option<Selector>,
    no_local: bool,
    subscriber_connection: ConnectionId,
    pending: VecDeque<StoredMessage>,
    active: Option<ConsumerId>,
}

impl DurableSubscription {
    fn accepts(&self, destination: &Destination, stored: &StoredMessage) -> bool {
        if !destination.is_covered_by(&Destination::Topic(self.topic.clone())) {
            return false;
        }
        if self.no_local && stored.origin == self.subscriber_connection {
            return false;
        }
        self.selector
            .as_ref()
            .map_or(true, |s| s.matches(&stored.message))
    }
}

struct SessionRecord {
    connection: ConnectionId,
    sink: Arc<dyn DeliverySink>,
    transacted: bool,
    started: bool,
    next_token: u64,
    unacknowledged: VecDeque<Unacknowledged>,
    staged: Vec<StoredMessage>,
    consumers: Vec<ConsumerId>,
    kick: mpsc::Sender<()>,
}

struct ConnectionRecord {
    client_id: Option<String>,
    events: Arc<dyn ExceptionSink>,
    sessions: Vec<SessionId>,
}

/// Wake-ups collected under the lock and fired after releasing it
#[derive(Default)]
struct Wakeups {
    kicks: Vec<mpsc::Sender<()>>,
    sinks: Vec<Arc<dyn DeliverySink>>,
}

impl Wakeups {
    fn fire(self) {
        for kick in self.kicks {
            // A full channel already holds a pending kick
            let _ = kick.try_send(());
        }
        for sink in self.sinks {
            sink.message_available();
        }
    }
}

struct BrokerState {
    config: InMemoryConfig,
    next_id: u64,
    queues: HashMap<Destination, VecDeque<StoredMessage>>,
    durables: HashMap<DurableKey, DurableSubscription>,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    sessions: HashMap<SessionId, SessionRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

/// Drop expired messages, then take the first one `selector` accepts
fn take_matching(
    queue: &mut VecDeque<StoredMessage>,
    selector: Option<&Selector>,
) -> Option<StoredMessage> {
    queue.retain(|stored| !stored.is_expired());
    let index = queue
        .iter()
        .position(|stored| selector.map_or(true, |s| s.matches(&stored.message)))?;
    queue.remove(index)
}

impl BrokerState {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            config,
            next_id: 1,
            queues: HashMap::new(),
            durables: HashMap::new(),
            connections: HashMap::new(),
            sessions: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn session(&self, id: &SessionId) -> Result<&SessionRecord, MessagingError> {
        self.sessions.get(id).ok_or_else(|| unknown("session", id))
    }

    fn session_mut(&mut self, id: &SessionId) -> Result<&mut SessionRecord, MessagingError> {
        self.sessions.get_mut(id).ok_or_else(|| unknown("session", id))
    }

    fn owned_consumer(
        &mut self,
        session: &SessionId,
        consumer: &ConsumerId,
    ) -> Result<&mut ConsumerRecord, MessagingError> {
        match self.consumers.get_mut(consumer) {
            Some(record) if &record.session == session => Ok(record),
            _ => Err(unknown("consumer", consumer)),
        }
    }

    fn client_id(&self, connection: &ConnectionId) -> Option<String> {
        self.connections
            .get(connection)
            .and_then(|c| c.client_id.clone())
    }

    /// Every session may now find a message
    fn wake_all(&self) -> Wakeups {
        let mut wakeups = Wakeups::default();
        for session in self.sessions.values() {
            if session.started {
                wakeups.kicks.push(session.kick.clone());
            }
            wakeups.sinks.push(session.sink.clone());
        }
        wakeups
    }

    fn wake_session(&self, id: &SessionId) -> Wakeups {
        let mut wakeups = Wakeups::default();
        if let Some(session) = self.sessions.get(id) {
            if session.started {
                wakeups.kicks.push(session.kick.clone());
            }
            wakeups.sinks.push(session.sink.clone());
        }
        wakeups
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    fn publish(&mut self, stored: StoredMessage) -> Result<(), MessagingError> {
        let destination = stored
            .message
            .destination
            .clone()
            .ok_or_else(|| MessagingError::invalid_destination("message has no destination"))?;
        let limit = self.config.max_queue_size;

        if destination.is_queue() {
            let queue = self.queues.entry(destination.clone()).or_default();
            if queue.len() >= limit {
                return Err(provider_error(
                    "QueueFull",
                    format!("{} holds {} messages", destination, queue.len()),
                ));
            }
            queue.push_back(stored);
            return Ok(());
        }

        for (id, consumer) in self.consumers.iter_mut() {
            let routed = matches!(consumer.source, ConsumerSource::Subscriber(_))
                && destination.is_covered_by(&consumer.destination)
                && consumer.accepts(&stored);
            if !routed {
                continue;
            }
            let ConsumerSource::Subscriber(buffer) = &mut consumer.source else {
                continue;
            };
            if buffer.len() >= limit {
                warn!(consumer_id = %id, "Subscriber buffer full, dropping message");
                continue;
            }
            buffer.push_back(stored.clone());
        }

        for ((_, name), durable) in self.durables.iter_mut() {
            if !durable.accepts(&destination, &stored) {
                continue;
            }
            if durable.pending.len() >= limit {
                warn!(subscription = %name, "Durable subscription full, dropping message");
                continue;
            }
            durable.pending.push_back(stored.clone());
        }
        Ok(())
    }

    /// Next message for `consumer` from its queue or subscription buffer
    fn take_next(&mut self, consumer: &ConsumerId) -> Option<(StoredMessage, Origin)> {
        let record = self.consumers.get_mut(consumer)?;
        match &mut record.source {
            ConsumerSource::Queue => {
                let queue = self.queues.get_mut(&record.destination)?;
                let stored = take_matching(queue, record.selector.as_ref())?;
                Some((stored, Origin::Queue(record.destination.clone())))
            }
            ConsumerSource::Subscriber(buffer) => {
                let stored = take_matching(buffer, None)?;
                Some((stored, Origin::Subscriber(consumer.clone())))
            }
            ConsumerSource::Durable(key) => {
                let durable = self.durables.get_mut(key)?;
                let stored = take_matching(&mut durable.pending, None)?;
                Some((stored, Origin::Durable(key.clone())))
            }
            ConsumerSource::Browser(_) => None,
        }
    }

    /// Stamp the delivery and remember it until acknowledged
    fn record_delivery(
        &mut self,
        session: &SessionId,
        consumer: &ConsumerId,
        stored: StoredMessage,
        origin: Origin,
    ) -> Option<Message> {
        let record = self.sessions.get_mut(session)?;
        let token = AckToken::new(record.next_token);
        record.next_token += 1;

        let mut message = stored.message.clone();
        message.consumer_id = Some(consumer.clone());
        message.ack_token = Some(token);
        record.unacknowledged.push_back(Unacknowledged {
            token,
            stored,
            origin,
        });
        Some(message)
    }

    /// Next push for one of the session's asynchronous consumers
    fn next_push(&mut self, session: &SessionId) -> Option<(Arc<dyn DeliverySink>, Message)> {
        let record = self.sessions.get(session)?;
        if !record.started {
            return None;
        }
        let sink = record.sink.clone();
        let candidates: Vec<ConsumerId> = record
            .consumers
            .iter()
            .filter(|id| self.consumers.get(*id).is_some_and(|c| c.asynchronous))
            .cloned()
            .collect();

        for consumer in candidates {
            if let Some((stored, origin)) = self.take_next(&consumer) {
                let message = self.record_delivery(session, &consumer, stored, origin)?;
                return Some((sink, message));
            }
        }
        None
    }

    /// Return unacknowledged deliveries to their origin, oldest first in line
    fn redeliver(&mut self, entries: VecDeque<Unacknowledged>) {
        for entry in entries.into_iter().rev() {
            let mut stored = entry.stored;
            stored.message.redelivered = true;
            match entry.origin {
                Origin::Queue(destination) => {
                    self.queues.entry(destination).or_default().push_front(stored);
                }
                Origin::Subscriber(consumer) => {
                    if let Some(ConsumerRecord {
                        source: ConsumerSource::Subscriber(buffer),
                        ..
                    }) = self.consumers.get_mut(&consumer)
                    {
                        buffer.push_front(stored);
                    }
                }
                Origin::Durable(key) => {
                    if let Some(durable) = self.durables.get_mut(&key) {
                        durable.pending.push_front(stored);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    fn remove_consumer(&mut self, consumer: &ConsumerId) {
        let Some(record) = self.consumers.remove(consumer) else {
            return;
        };
        if let ConsumerSource::Durable(key) = &record.source {
            if let Some(durable) = self.durables.get_mut(key) {
                durable.active = None;
            }
        }
        if let Some(session) = self.sessions.get_mut(&record.session) {
            session.consumers.retain(|id| id != consumer);
        }
    }

    fn remove_session(&mut self, session: &SessionId) {
        let Some(record) = self.sessions.remove(session) else {
            return;
        };
        for consumer in &record.consumers {
            self.remove_consumer(consumer);
        }
        self.redeliver(record.unacknowledged);
        if let Some(connection) = self.connections.get_mut(&record.connection) {
            connection.sessions.retain(|id| id != session);
        }
    }

    fn remove_connection(&mut self, connection: &ConnectionId) -> Option<ConnectionRecord> {
        let record = self.connections.remove(connection)?;
        for session in &record.sessions {
            self.remove_session(session);
        }
        Some(record)
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl InMemoryBroker {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(config))),
        }
    }

    /// Messages waiting on a queue
    pub fn queue_depth(&self, queue: &Destination) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Messages retained by a durable subscription
    pub fn durable_depth(&self, client_id: Option<&str>, name: &str) -> Option<usize> {
        let key = (client_id.map(str::to_owned), name.to_string());
        lock(&self.state).durables.get(&key).map(|d| d.pending.len())
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Simulate the broker dropping a connection.
    ///
    /// The connection's sessions are discarded and its exception sink is told
    /// the connection was lost. Returns `false` for an unknown connection.
    pub async fn drop_connection(&self, connection: &ConnectionId) -> bool {
        let (record, wakeups) = {
            let mut state = lock(&self.state);
            let Some(record) = state.remove_connection(connection) else {
                return false;
            };
            (record, state.wake_all())
        };
        wakeups.fire();

        warn!(connection_id = %connection, "Dropping connection");
        record
            .events
            .on_exception(MessagingError::ConnectionLost {
                message: format!("broker dropped connection {}", connection),
            })
            .await;
        true
    }

    /// Push pending messages to a session until none remain
    async fn pump(state: Arc<Mutex<BrokerState>>, session: SessionId, mut kicks: mpsc::Receiver<()>) {
        while kicks.recv().await.is_some() {
            loop {
                let next = lock(&state).next_push(&session);
                let Some((sink, message)) = next else {
                    break;
                };
                sink.deliver(message).await;
            }
        }
        debug!(session_id = %session, "Delivery task finished");
    }
}

// ============================================================================
// Connector and broker proxies
// ============================================================================

/// Connects to an [`InMemoryBroker`]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    fn scheme(&self) -> ConnectorScheme {
        ConnectorScheme::InMemory
    }

    async fn connect(
        &self,
        _config: &FactoryConfig,
        events: Arc<dyn ExceptionSink>,
    ) -> Result<Arc<dyn BrokerConnection>, MessagingError> {
        let id = {
            let mut state = lock(&self.broker.state);
            let id = ConnectionId::new(format!("conn-{}", state.next_id()))?;
            state.connections.insert(
                id.clone(),
                ConnectionRecord {
                    client_id: None,
                    events,
                    sessions: Vec::new(),
                },
            );
            id
        };
        debug!(connection_id = %id, "In-memory connection accepted");
        Ok(Arc::new(InMemoryConnection {
            id,
            broker: self.broker.clone(),
        }))
    }
}

struct InMemoryConnection {
    id: ConnectionId,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    async fn create_session(
        &self,
        ack_mode: AckMode,
        transacted: bool,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Arc<dyn BrokerSession>, MessagingError> {
        let (kick, kicks) = mpsc::channel(1);
        let id = {
            let mut state = lock(&self.broker.state);
            if !state.connections.contains_key(&self.id) {
                return Err(unknown("connection", &self.id));
            }
            let id = SessionId::new(format!("{}-sess-{}", self.id, state.next_id()))?;
            state.sessions.insert(
                id.clone(),
                SessionRecord {
                    connection: self.id.clone(),
                    sink,
                    transacted,
                    started: false,
                    next_token: 1,
                    unacknowledged: VecDeque::new(),
                    staged: Vec::new(),
                    consumers: Vec::new(),
                    kick,
                },
            );
            if let Some(connection) = state.connections.get_mut(&self.id) {
                connection.sessions.push(id.clone());
            }
            id
        };

        tokio::spawn(InMemoryBroker::pump(
            self.broker.state.clone(),
            id.clone(),
            kicks,
        ));
        debug!(session_id = %id, ack_mode = %ack_mode, transacted, "In-memory session created");

        Ok(Arc::new(InMemorySession {
            id,
            connection: self.id.clone(),
            broker: self.broker.clone(),
        }))
    }

    async fn set_client_id(&self, client_id: &str) -> Result<(), MessagingError> {
        let mut state = lock(&self.broker.state);
        let in_use = state
            .connections
            .iter()
            .any(|(id, c)| id != &self.id && c.client_id.as_deref() == Some(client_id));
        if in_use {
            return Err(provider_error(
                "InvalidClientId",
                format!("client id '{}' is already in use", client_id),
            ));
        }
        let record = state
            .connections
            .get_mut(&self.id)
            .ok_or_else(|| unknown("connection", &self.id))?;
        record.client_id = Some(client_id.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let wakeups = {
            let mut state = lock(&self.broker.state);
            if state.remove_connection(&self.id).is_none() {
                return Ok(());
            }
            state.wake_all()
        };
        wakeups.fire();
        info!(connection_id = %self.id, "In-memory connection closed");
        Ok(())
    }
}

struct InMemorySession {
    id: SessionId,
    connection: ConnectionId,
    broker: InMemoryBroker,
}

impl InMemorySession {
    fn register_consumer(
        &self,
        state: &mut BrokerState,
        destination: Destination,
        selector: Option<Selector>,
        no_local: bool,
        source: ConsumerSource,
    ) -> Result<ConsumerId, MessagingError> {
        state.session(&self.id)?;
        let id = ConsumerId::new(format!("{}-cons-{}", self.id, state.next_id()))?;
        state.consumers.insert(
            id.clone(),
            ConsumerRecord {
                session: self.id.clone(),
                connection: self.connection.clone(),
                destination,
                selector,
                no_local,
                asynchronous: false,
                source,
            },
        );
        state.session_mut(&self.id)?.consumers.push(id.clone());
        Ok(id)
    }
}

fn parse_selector(selector: Option<&str>) -> Result<Option<Selector>, MessagingError> {
    selector
        .filter(|s| !s.trim().is_empty())
        .map(Selector::parse)
        .transpose()
}

#[async_trait]
impl BrokerSession for InMemorySession {
    fn session_id(&self) -> &SessionId {
        &self.id
    }

    async fn send(&self, message: &Message) -> Result<(), MessagingError> {
        let wakeups = {
            let mut state = lock(&self.broker.state);
            let stored = StoredMessage {
                message: message.clone(),
                origin: self.connection.clone(),
            };
            let session = state.session_mut(&self.id)?;
            if session.transacted {
                session.staged.push(stored);
                return Ok(());
            }
            state.publish(stored)?;
            state.wake_all()
        };
        wakeups.fire();
        Ok(())
    }

    async fn receive_no_wait(
        &self,
        consumer: &ConsumerId,
    ) -> Result<Option<Message>, MessagingError> {
        let mut state = lock(&self.broker.state);
        let record = state.owned_consumer(&self.id, consumer)?;
        if record.asynchronous {
            return Err(MessagingError::invalid_state(format!(
                "consumer {} is asynchronous",
                consumer
            )));
        }
        let Some((stored, origin)) = state.take_next(consumer) else {
            return Ok(None);
        };
        Ok(state.record_delivery(&self.id, consumer, stored, origin))
    }

    async fn browse(
        &self,
        browser: &ConsumerId,
        count: usize,
    ) -> Result<Vec<Message>, MessagingError> {
        let mut state = lock(&self.broker.state);
        let BrokerState {
            queues, consumers, ..
        } = &mut *state;

        let record = match consumers.get_mut(browser) {
            Some(record) if record.session == self.id => record,
            _ => return Err(unknown("browser", browser)),
        };
        let ConsumerSource::Browser(seen) = &mut record.source else {
            return Err(MessagingError::invalid_state(format!(
                "consumer {} is not a browser",
                browser
            )));
        };
        let Some(queue) = queues.get(&record.destination) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for stored in queue.iter() {
            if batch.len() >= count {
                break;
            }
            if stored.is_expired()
                || !record
                    .selector
                    .as_ref()
                    .map_or(true, |s| s.matches(&stored.message))
            {
                continue;
            }
            let key = stored
                .message
                .message_id
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default();
            if seen.insert(key) {
                batch.push(stored.message.clone());
            }
        }
        Ok(batch)
    }

    async fn acknowledge(
        &self,
        _consumer: &ConsumerId,
        token: AckToken,
    ) -> Result<(), MessagingError> {
        let mut state = lock(&self.broker.state);
        let session = state.session_mut(&self.id)?;
        session.unacknowledged.retain(|entry| entry.token > token);
        Ok(())
    }

    async fn commit(&self) -> Result<(), MessagingError> {
        let (result, wakeups) = {
            let mut state = lock(&self.broker.state);
            let session = state.session_mut(&self.id)?;
            let staged = std::mem::take(&mut session.staged);
            session.unacknowledged.clear();

            let mut result = Ok(());
            for stored in staged {
                if let Err(e) = state.publish(stored) {
                    result = Err(e);
                    break;
                }
            }
            (result, state.wake_all())
        };
        wakeups.fire();
        result
    }

    async fn rollback(&self) -> Result<(), MessagingError> {
        let wakeups = {
            let mut state = lock(&self.broker.state);
            let session = state.session_mut(&self.id)?;
            session.staged.clear();
            let entries = std::mem::take(&mut session.unacknowledged);
            state.redeliver(entries);
            state.wake_all()
        };
        wakeups.fire();
        Ok(())
    }

    async fn recover(&self) -> Result<(), MessagingError> {
        let wakeups = {
            let mut state = lock(&self.broker.state);
            let entries = std::mem::take(&mut state.session_mut(&self.id)?.unacknowledged);
            state.redeliver(entries);
            state.wake_all()
        };
        wakeups.fire();
        Ok(())
    }

    async fn start(&self) -> Result<(), MessagingError> {
        let wakeups = {
            let mut state = lock(&self.broker.state);
            state.session_mut(&self.id)?.started = true;
            state.wake_session(&self.id)
        };
        wakeups.fire();
        Ok(())
    }

    async fn stop(&self) -> Result<(), MessagingError> {
        let mut state = lock(&self.broker.state);
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.started = false;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let wakeups = {
            let mut state = lock(&self.broker.state);
            state.remove_session(&self.id);
            state.wake_all()
        };
        wakeups.fire();
        Ok(())
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<ConsumerId, MessagingError> {
        let selector = parse_selector(selector)?;
        let mut state = lock(&self.broker.state);
        let source = if destination.is_queue() {
            ConsumerSource::Queue
        } else {
            ConsumerSource::Subscriber(VecDeque::new())
        };
        self.register_consumer(&mut state, destination.clone(), selector, no_local, source)
    }

    async fn create_durable_consumer(
        &self,
        topic: &Topic,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<ConsumerId, MessagingError> {
        let parsed = parse_selector(selector)?;
        let mut state = lock(&self.broker.state);
        let key = (state.client_id(&self.connection), name.to_string());

        let reusable = match state.durables.get(&key) {
            Some(existing) if existing.active.is_some() => {
                return Err(MessagingError::invalid_state(format!(
                    "durable subscription '{}' is already active",
                    name
                )));
            }
            Some(existing) => {
                existing.topic == *topic
                    && existing.no_local == no_local
                    && existing.selector.as_ref().map(Selector::as_str)
                        == parsed.as_ref().map(Selector::as_str)
            }
            None => false,
        };

        // A changed topic or filter replaces the subscription and its backlog
        if !reusable {
            state.durables.insert(
                key.clone(),
                DurableSubscription {
                    topic: topic.clone(),
                    selector: parsed.clone(),
                    no_local,
                    subscriber_connection: self.connection.clone(),
                    pending: VecDeque::new(),
                    active: None,
                },
            );
        }

        let id = self.register_consumer(
            &mut state,
            Destination::Topic(topic.clone()),
            parsed,
            no_local,
            ConsumerSource::Durable(key.clone()),
        )?;
        if let Some(durable) = state.durables.get_mut(&key) {
            durable.active = Some(id.clone());
            durable.subscriber_connection = self.connection.clone();
        }
        Ok(id)
    }

    async fn create_browser(
        &self,
        queue: &Destination,
        selector: Option<&str>,
    ) -> Result<ConsumerId, MessagingError> {
        let selector = parse_selector(selector)?;
        let mut state = lock(&self.broker.state);
        self.register_consumer(
            &mut state,
            queue.clone(),
            selector,
            false,
            ConsumerSource::Browser(HashSet::new()),
        )
    }

    async fn close_consumer(&self, consumer: &ConsumerId) -> Result<(), MessagingError> {
        lock(&self.broker.state).remove_consumer(consumer);
        Ok(())
    }

    async fn set_asynchronous(
        &self,
        consumer: &ConsumerId,
        enabled: bool,
    ) -> Result<(), MessagingError> {
        let wakeups = {
            let mut state = lock(&self.broker.state);
            let record = state.owned_consumer(&self.id, consumer)?;
            if matches!(record.source, ConsumerSource::Browser(_)) {
                return Err(MessagingError::invalid_state(
                    "queue browsers cannot deliver asynchronously",
                ));
            }
            record.asynchronous = enabled;
            state.wake_session(&self.id)
        };
        wakeups.fire();
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) -> Result<(), MessagingError> {
        let mut state = lock(&self.broker.state);
        let key = (state.client_id(&self.connection), name.to_string());
        let active = match state.durables.get(&key) {
            None => {
                return Err(MessagingError::invalid_destination(format!(
                    "no durable subscription named '{}'",
                    name
                )))
            }
            Some(durable) => durable.active.is_some(),
        };
        if active {
            return Err(MessagingError::invalid_state(format!(
                "durable subscription '{}' has an active subscriber",
                name
            )));
        }
        state.durables.remove(&key);
        debug!(subscription = name, "Durable subscription removed");
        Ok(())
    }
}
