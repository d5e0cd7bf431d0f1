//! Message types and the core domain identifiers.

use crate::destination::Destination;
use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Declares an opaque, broker-assigned string identifier.
macro_rules! broker_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create identifier, rejecting empty values
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Required {
                        field: $field.to_string(),
                    });
                }
                Ok(Self(id))
            }

            /// Get identifier as string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

broker_id!(
    /// Broker-assigned identity of a connection
    ConnectionId,
    "connection_id"
);

broker_id!(
    /// Broker-assigned identity of a session
    SessionId,
    "session_id"
);

broker_id!(
    /// Broker-assigned identity of a consumer, browser or subscription
    ConsumerId,
    "consumer_id"
);

/// Unique identifier for messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(format!("ID:{}", uuid::Uuid::new_v4()))
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque broker token used to acknowledge a delivery.
///
/// Tokens increase monotonically within a broker session, which is what makes
/// cumulative acknowledgment well defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AckToken(u64);

impl AckToken {
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Timestamp shifted forward by `duration`
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Delivery Headers
// ============================================================================

/// Whether the broker must retain a message across its own restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

/// Message priority in the range 0 (lowest) to 9 (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(4);
    pub const HIGHEST: Priority = Priority(9);

    /// Create priority with range validation
    pub fn new(value: u8) -> Result<Self, ValidationError> {
        if value > Self::HIGHEST.0 {
            return Err(ValidationError::OutOfRange {
                field: "priority".to_string(),
                message: "must be 0-9".to_string(),
            });
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ============================================================================
// Message
// ============================================================================

/// A message flowing between producers, the broker and consumers.
///
/// Header fields are stamped by the producer on send; `consumer_id` and
/// `ack_token` are filled in by the broker on delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub destination: Option<Destination>,
    pub reply_to: Option<Destination>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub expiration: Option<Timestamp>,
    pub priority: Priority,
    pub delivery_mode: DeliveryMode,
    pub redelivered: bool,
    pub properties: HashMap<String, String>,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub consumer_id: Option<ConsumerId>,
    pub ack_token: Option<AckToken>,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Create new message with body
    pub fn new(body: Bytes) -> Self {
        Self {
            message_id: None,
            destination: None,
            reply_to: None,
            correlation_id: None,
            message_type: None,
            timestamp: None,
            expiration: None,
            priority: Priority::DEFAULT,
            delivery_mode: DeliveryMode::Persistent,
            redelivered: false,
            properties: HashMap::new(),
            body,
            consumer_id: None,
            ack_token: None,
        }
    }

    /// Create message with a UTF-8 text body
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Bytes::from(text.into()))
    }

    /// Create message with a JSON-encoded body
    pub fn json<T: Serialize>(value: &T) -> Result<Self, SerializationError> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(body)))
    }

    /// Add message property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add correlation ID for request/response tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set application-defined message type
    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Set destination replies should be sent to
    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Body as UTF-8 text
    pub fn body_text(&self) -> Result<&str, SerializationError> {
        std::str::from_utf8(&self.body).map_err(|_| SerializationError::InvalidUtf8)
    }

    /// Body decoded from JSON
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Check if message is past its expiration time
    pub fn is_expired(&self) -> bool {
        match self.expiration {
            Some(expiration) => Timestamp::now() >= expiration,
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
