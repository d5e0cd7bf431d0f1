//! Queue, topic and temporary destination value types.

use crate::connection::{Connection, ConnectionInner};
use crate::error::{MessagingError, ValidationError};
use crate::message::ConnectionId;
use crate::wildcard;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Weak;

// ============================================================================
// Queue and Topic
// ============================================================================

/// Point-to-point destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Queue {
    name: String,
}

impl Queue {
    /// Create queue with name validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "queue_name".to_string(),
            });
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Publish/subscribe destination with hierarchical, optionally wildcarded name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    name: String,
}

impl Topic {
    /// Create topic with name validation.
    ///
    /// Every `.`-separated level must be non-empty.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "topic_name".to_string(),
            });
        }

        if name.split(wildcard::SEPARATOR).any(str::is_empty) {
            return Err(ValidationError::InvalidFormat {
                field: "topic_name".to_string(),
                message: "levels must not be empty".to_string(),
            });
        }

        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether the name is a well-formed wildcard pattern
    pub fn is_wildcard(&self) -> bool {
        wildcard::is_wildcard(&self.name)
    }

    /// Check whether this topic (pattern or literal) covers `topic_name`
    pub fn matches(&self, topic_name: &str) -> bool {
        if self.is_wildcard() {
            wildcard::matches(&self.name, topic_name)
        } else {
            self.name == topic_name
        }
    }
}

// ============================================================================
// Temporary Destinations
// ============================================================================

/// Name and ownership shared by temporary queues and topics.
///
/// The connection back-reference is transient: it is skipped on
/// serialization and only used to delegate deletion.
#[derive(Clone, Serialize, Deserialize)]
struct TemporaryIdentity {
    name: String,
    owner: ConnectionId,
    #[serde(skip)]
    connection: Weak<ConnectionInner>,
}

impl std::fmt::Debug for TemporaryIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryIdentity")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish()
    }
}

impl PartialEq for TemporaryIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.owner == other.owner
    }
}

impl Eq for TemporaryIdentity {}

impl Hash for TemporaryIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.owner.hash(state);
    }
}

impl TemporaryIdentity {
    fn valid_for(&self, connection: &Connection) -> bool {
        connection.id() == &self.owner
    }

    fn owning_connection(&self) -> Result<Connection, MessagingError> {
        self.connection
            .upgrade()
            .map(Connection::from_inner)
            .ok_or_else(|| MessagingError::invalid_state("owning connection no longer exists"))
    }
}

/// Queue scoped to the lifetime of the connection that created it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemporaryQueue(TemporaryIdentity);

impl TemporaryQueue {
    pub(crate) fn new(name: String, owner: ConnectionId, connection: Weak<ConnectionInner>) -> Self {
        Self(TemporaryIdentity {
            name,
            owner,
            connection,
        })
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Identity of the connection that created this queue
    pub fn owner(&self) -> &ConnectionId {
        &self.0.owner
    }

    /// Check whether `connection` is the owner of this queue
    pub fn valid_for_connection(&self, connection: &Connection) -> bool {
        self.0.valid_for(connection)
    }

    /// Delete the queue through its owning connection
    pub async fn delete(&self) -> Result<(), MessagingError> {
        let connection = self.0.owning_connection()?;
        connection
            .delete_temporary_destination(&Destination::TemporaryQueue(self.clone()))
            .await
    }
}

/// Topic scoped to the lifetime of the connection that created it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemporaryTopic(TemporaryIdentity);

impl TemporaryTopic {
    pub(crate) fn new(name: String, owner: ConnectionId, connection: Weak<ConnectionInner>) -> Self {
        Self(TemporaryIdentity {
            name,
            owner,
            connection,
        })
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Identity of the connection that created this topic
    pub fn owner(&self) -> &ConnectionId {
        &self.0.owner
    }

    /// Check whether `connection` is the owner of this topic
    pub fn valid_for_connection(&self, connection: &Connection) -> bool {
        self.0.valid_for(connection)
    }

    /// Delete the topic through its owning connection
    pub async fn delete(&self) -> Result<(), MessagingError> {
        let connection = self.0.owning_connection()?;
        connection
            .delete_temporary_destination(&Destination::TemporaryTopic(self.clone()))
            .await
    }
}

// ============================================================================
// Destination
// ============================================================================

/// Any addressable destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Queue(Queue),
    Topic(Topic),
    TemporaryQueue(TemporaryQueue),
    TemporaryTopic(TemporaryTopic),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Self::Queue(queue) => queue.name(),
            Self::Topic(topic) => topic.name(),
            Self::TemporaryQueue(queue) => queue.name(),
            Self::TemporaryTopic(topic) => topic.name(),
        }
    }

    /// Point-to-point destination (regular or temporary queue)
    pub fn is_queue(&self) -> bool {
        matches!(self, Self::Queue(_) | Self::TemporaryQueue(_))
    }

    /// Publish/subscribe destination (regular or temporary topic)
    pub fn is_topic(&self) -> bool {
        matches!(self, Self::Topic(_) | Self::TemporaryTopic(_))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::TemporaryQueue(_) | Self::TemporaryTopic(_))
    }

    /// Temporary destinations never outlive their connection, so messages
    /// sent to them are never persisted.
    pub fn is_persistent(&self) -> bool {
        !self.is_temporary()
    }

    /// Owning connection of a temporary destination
    pub fn owner(&self) -> Option<&ConnectionId> {
        match self {
            Self::TemporaryQueue(queue) => Some(queue.owner()),
            Self::TemporaryTopic(topic) => Some(topic.owner()),
            Self::Queue(_) | Self::Topic(_) => None,
        }
    }

    /// Check ownership of a temporary destination; regular destinations are
    /// valid for every connection.
    pub fn valid_for_connection(&self, connection: &Connection) -> bool {
        self.owner().map_or(true, |owner| owner == connection.id())
    }

    /// Check whether a message published to `self` reaches a subscription on
    /// `subscription`.
    pub fn is_covered_by(&self, subscription: &Destination) -> bool {
        match (subscription, self) {
            (Self::Topic(pattern), Self::Topic(topic)) => pattern.matches(topic.name()),
            _ => subscription == self,
        }
    }

    /// A wildcard topic can be subscribed to but not published to
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Topic(topic) if topic.is_wildcard())
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue(queue) => write!(f, "queue://{}", queue.name()),
            Self::Topic(topic) => write!(f, "topic://{}", topic.name()),
            Self::TemporaryQueue(queue) => write!(f, "temp-queue://{}", queue.name()),
            Self::TemporaryTopic(topic) => write!(f, "temp-topic://{}", topic.name()),
        }
    }
}

impl From<Queue> for Destination {
    fn from(queue: Queue) -> Self {
        Self::Queue(queue)
    }
}

impl From<Topic> for Destination {
    fn from(topic: Topic) -> Self {
        Self::Topic(topic)
    }
}

impl From<TemporaryQueue> for Destination {
    fn from(queue: TemporaryQueue) -> Self {
        Self::TemporaryQueue(queue)
    }
}

impl From<TemporaryTopic> for Destination {
    fn from(topic: TemporaryTopic) -> Self {
        Self::TemporaryTopic(topic)
    }
}

#[cfg(test)]
#[path = "destination_tests.rs"]
mod tests;
