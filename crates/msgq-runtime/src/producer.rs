//! Message producers.

use crate::destination::Destination;
use crate::error::MessagingError;
use crate::message::{DeliveryMode, Message, MessageId, Priority, Timestamp};
use crate::provider::ProducerDefaults;
use crate::session::SessionInner;
use crate::sync::lock;
use chrono::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Session-side record of a producer
pub(crate) struct ProducerState {
    pub(crate) id: u64,
    closed: AtomicBool,
}

impl ProducerState {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `false` if the producer was already closed
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Per-send overrides of the producer's header defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: Option<Priority>,
    /// Zero or negative means the message never expires
    pub time_to_live: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct ProducerSettings {
    delivery_mode: DeliveryMode,
    priority: Priority,
    time_to_live: Duration,
}

/// Stamps outgoing messages and hands them to the owning session.
///
/// A producer created without a destination is "unidentified": every send
/// names its destination explicitly.
pub struct MessageProducer {
    state: Arc<ProducerState>,
    session: Arc<SessionInner>,
    destination: Option<Destination>,
    settings: Mutex<ProducerSettings>,
}

impl MessageProducer {
    pub(crate) fn new(
        state: Arc<ProducerState>,
        session: Arc<SessionInner>,
        destination: Option<Destination>,
        defaults: &ProducerDefaults,
    ) -> Self {
        let settings = ProducerSettings {
            delivery_mode: defaults.delivery_mode,
            priority: Priority::new(defaults.priority).unwrap_or_default(),
            time_to_live: Duration::milliseconds(defaults.time_to_live_ms),
        };
        Self {
            state,
            session,
            destination,
            settings: Mutex::new(settings),
        }
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        lock(&self.settings).delivery_mode
    }

    pub fn set_delivery_mode(&self, mode: DeliveryMode) -> Result<(), MessagingError> {
        self.ensure_open()?;
        lock(&self.settings).delivery_mode = mode;
        Ok(())
    }

    pub fn priority(&self) -> Priority {
        lock(&self.settings).priority
    }

    pub fn set_priority(&self, priority: Priority) -> Result<(), MessagingError> {
        self.ensure_open()?;
        lock(&self.settings).priority = priority;
        Ok(())
    }

    pub fn time_to_live(&self) -> Duration {
        lock(&self.settings).time_to_live
    }

    /// Zero or negative means messages never expire
    pub fn set_time_to_live(&self, ttl: Duration) -> Result<(), MessagingError> {
        self.ensure_open()?;
        lock(&self.settings).time_to_live = ttl;
        Ok(())
    }

    /// Send to the producer's own destination with its default headers
    pub async fn send(&self, message: Message) -> Result<MessageId, MessagingError> {
        self.send_with(None, message, SendOptions::default()).await
    }

    /// Send to an explicit destination (unidentified producers only)
    pub async fn send_to(
        &self,
        destination: &Destination,
        message: Message,
    ) -> Result<MessageId, MessagingError> {
        self.send_with(Some(destination), message, SendOptions::default())
            .await
    }

    /// Send with a destination and header overrides
    pub async fn send_with(
        &self,
        destination: Option<&Destination>,
        mut message: Message,
        options: SendOptions,
    ) -> Result<MessageId, MessagingError> {
        self.ensure_open()?;

        let destination = match (&self.destination, destination) {
            (Some(own), None) => own.clone(),
            // Replies may go to another connection's temporary destination
            (None, Some(explicit)) => {
                self.session.check_destination_kind(explicit)?;
                explicit.clone()
            }
            (Some(_), Some(_)) => {
                return Err(MessagingError::invalid_state(
                    "producer has a fixed destination; create an unidentified producer to choose per send",
                ))
            }
            (None, None) => {
                return Err(MessagingError::invalid_destination(
                    "unidentified producer requires an explicit destination",
                ))
            }
        };

        if destination.is_wildcard() {
            return Err(MessagingError::invalid_destination(format!(
                "cannot publish to wildcard topic {}",
                destination
            )));
        }

        let settings = *lock(&self.settings);
        let delivery_mode = if destination.is_temporary() {
            DeliveryMode::NonPersistent
        } else {
            options.delivery_mode.unwrap_or(settings.delivery_mode)
        };
        let ttl = options.time_to_live.unwrap_or(settings.time_to_live);
        let now = Timestamp::now();
        let message_id = MessageId::new();

        message.message_id = Some(message_id.clone());
        message.destination = Some(destination);
        message.timestamp = Some(now);
        message.expiration = (ttl > Duration::zero()).then(|| now.add(ttl));
        message.delivery_mode = delivery_mode;
        message.priority = options.priority.unwrap_or(settings.priority);
        message.redelivered = false;
        message.consumer_id = None;
        message.ack_token = None;

        debug!(
            message_id = %message_id,
            producer_id = self.state.id,
            "Sending message"
        );
        self.session.send(message).await?;
        Ok(message_id)
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        if !self.state.mark_closed() {
            return Ok(());
        }
        self.session.remove_producer(self.state.id);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.state.is_closed() {
            return Err(MessagingError::invalid_state("producer is closed"));
        }
        Ok(())
    }
}
