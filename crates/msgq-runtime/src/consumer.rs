//! Message consumers, queue browsers and the listener callback trait.
//!
//! A consumer is either polled with [`MessageConsumer::receive`] or driven by
//! a registered [`MessageListener`], never both at once. The session keeps a
//! [`ConsumerState`] per consumer as the dispatch target for pushed messages;
//! [`MessageConsumer`] is the application-facing handle to it.

use crate::destination::Destination;
use crate::error::MessagingError;
use crate::message::{ConsumerId, Message};
use crate::session::SessionInner;
use crate::sync::{read, write};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Number of messages a queue browser prefetches per broker round trip
pub const BROWSE_BATCH_SIZE: usize = 20;

/// Callback target for asynchronously delivered messages.
///
/// Errors and panics raised by a listener are logged by the session and do
/// not affect delivery of later messages.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: Message) -> anyhow::Result<()>;
}

/// The subscription flavour behind a consumer id
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsumerKind {
    Receiver,
    Subscriber,
    Durable { name: String },
    Browser,
}

/// Dispatch-side state of one consumer, registered with its session
pub(crate) struct ConsumerState {
    pub(crate) id: ConsumerId,
    pub(crate) destination: Destination,
    pub(crate) selector: Option<String>,
    pub(crate) no_local: bool,
    pub(crate) kind: ConsumerKind,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    closed: AtomicBool,
}

impl ConsumerState {
    pub(crate) fn new(
        id: ConsumerId,
        destination: Destination,
        selector: Option<String>,
        no_local: bool,
        kind: ConsumerKind,
    ) -> Self {
        Self {
            id,
            destination,
            selector,
            no_local,
            kind,
            listener: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn MessageListener>> {
        read(&self.listener).clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `false` if the consumer was already closed
    pub(crate) fn mark_closed(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::AcqRel);
        write(&self.listener).take();
        was_open
    }

    pub(crate) fn subscription_name(&self) -> Option<&str> {
        match &self.kind {
            ConsumerKind::Durable { name } => Some(name),
            _ => None,
        }
    }
}

// ============================================================================
// MessageConsumer
// ============================================================================

/// Receives messages from a queue, topic or durable subscription
pub struct MessageConsumer {
    state: Arc<ConsumerState>,
    session: Arc<SessionInner>,
}

impl MessageConsumer {
    pub(crate) fn new(state: Arc<ConsumerState>, session: Arc<SessionInner>) -> Self {
        Self { state, session }
    }

    pub fn id(&self) -> &ConsumerId {
        &self.state.id
    }

    pub fn destination(&self) -> &Destination {
        &self.state.destination
    }

    pub fn selector(&self) -> Option<&str> {
        self.state.selector.as_deref()
    }

    pub fn no_local(&self) -> bool {
        self.state.no_local
    }

    /// Name of the durable subscription, if this is a durable subscriber
    pub fn subscription_name(&self) -> Option<&str> {
        self.state.subscription_name()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn message_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.state.listener()
    }

    /// Switch between listener-driven and synchronous delivery.
    ///
    /// `Some` registers the listener for push delivery; `None` returns the
    /// consumer to synchronous receive. Fails while a receive is in progress
    /// on this consumer.
    pub async fn set_message_listener(
        &self,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.session.ensure_open()?;

        if self.session.is_blocked_on(&self.state.id) {
            return Err(MessagingError::invalid_state(
                "cannot change the listener while a receive is in progress",
            ));
        }

        let had_listener = read(&self.state.listener).is_some();

        match listener {
            Some(listener) => {
                *write(&self.state.listener) = Some(listener);
                if !had_listener {
                    if let Err(e) = self
                        .session
                        .broker()
                        .set_asynchronous(&self.state.id, true)
                        .await
                    {
                        write(&self.state.listener).take();
                        return Err(e);
                    }
                }
            }
            None => {
                if had_listener {
                    self.session
                        .broker()
                        .set_asynchronous(&self.state.id, false)
                        .await?;
                }
                write(&self.state.listener).take();
            }
        }

        debug!(
            consumer_id = %self.state.id,
            asynchronous = self.state.listener().is_some(),
            "Consumer delivery mode changed"
        );
        Ok(())
    }

    /// Wait for the next message.
    ///
    /// A zero `timeout` waits until a message arrives or the consumer or its
    /// session is closed. Returns `None` on timeout or close.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, MessagingError> {
        self.ensure_synchronous()?;
        self.session.receive(&self.state, timeout).await
    }

    /// Return a message only if one is immediately available
    pub async fn receive_no_wait(&self) -> Result<Option<Message>, MessagingError> {
        self.ensure_synchronous()?;
        self.session.receive_no_wait(&self.state).await
    }

    /// Close the consumer; a receive blocked on it returns `None`
    pub async fn close(&self) -> Result<(), MessagingError> {
        if !self.state.mark_closed() {
            return Ok(());
        }
        self.session.remove_consumer(&self.state.id).await
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.state.is_closed() {
            return Err(MessagingError::invalid_state("consumer is closed"));
        }
        Ok(())
    }

    fn ensure_synchronous(&self) -> Result<(), MessagingError> {
        self.ensure_open()?;
        if self.state.listener().is_some() {
            return Err(MessagingError::invalid_state(
                "cannot receive synchronously while a message listener is registered",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// QueueBrowser
// ============================================================================

struct BrowseCursor {
    prefetched: VecDeque<Message>,
    exhausted: bool,
}

/// Forward-only view of the messages pending on a queue.
///
/// Browsing never consumes or acknowledges messages. Once the end of the
/// queue has been reached the browser stays exhausted.
pub struct QueueBrowser {
    state: Arc<ConsumerState>,
    session: Arc<SessionInner>,
    cursor: tokio::sync::Mutex<BrowseCursor>,
}

impl QueueBrowser {
    pub(crate) fn new(state: Arc<ConsumerState>, session: Arc<SessionInner>) -> Self {
        Self {
            state,
            session,
            cursor: tokio::sync::Mutex::new(BrowseCursor {
                prefetched: VecDeque::new(),
                exhausted: false,
            }),
        }
    }

    pub fn id(&self) -> &ConsumerId {
        &self.state.id
    }

    pub fn queue(&self) -> &Destination {
        &self.state.destination
    }

    pub fn selector(&self) -> Option<&str> {
        self.state.selector.as_deref()
    }

    /// Next message in queue order, prefetching in batches of
    /// [`BROWSE_BATCH_SIZE`]
    pub async fn next(&self) -> Result<Option<Message>, MessagingError> {
        if self.state.is_closed() {
            return Err(MessagingError::invalid_state("browser is closed"));
        }
        self.session.ensure_open()?;

        let mut cursor = self.cursor.lock().await;
        if cursor.prefetched.is_empty() && !cursor.exhausted {
            let batch = self
                .session
                .broker()
                .browse(&self.state.id, BROWSE_BATCH_SIZE)
                .await?;
            debug!(browser_id = %self.state.id, fetched = batch.len(), "Browser batch fetched");
            if batch.is_empty() {
                cursor.exhausted = true;
            }
            cursor.prefetched.extend(batch);
        }

        Ok(cursor.prefetched.pop_front())
    }

    /// Drain the rest of the browse sequence
    pub async fn remaining(&self) -> Result<Vec<Message>, MessagingError> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await? {
            messages.push(message);
        }
        Ok(messages)
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        if !self.state.mark_closed() {
            return Ok(());
        }
        self.session.remove_consumer(&self.state.id).await
    }
}
