//! Acknowledgment modes, session capabilities and connection factory configuration.

use crate::error::ConfigurationError;
use crate::message::{DeliveryMode, Priority};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Policy governing when a delivered message counts as consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledged by the session as soon as it is delivered
    Auto,
    /// Acknowledged explicitly by the application, cumulatively
    Client,
    /// Acknowledged lazily; duplicates may be redelivered
    DupsOk,
    /// Acknowledged as part of the session's transaction
    Transacted,
}

impl AckMode {
    /// Whether the session acknowledges each message itself on delivery
    pub fn acknowledges_on_delivery(&self) -> bool {
        matches!(self, Self::Auto | Self::DupsOk)
    }
}

impl std::fmt::Display for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::DupsOk => "dups_ok",
            Self::Transacted => "transacted",
        };
        write!(f, "{}", name)
    }
}

/// Which operations a connection's sessions allow.
///
/// Queue-only and topic-only connections are the same connection type with
/// a narrower capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCapabilities {
    pub allows_queue_ops: bool,
    pub allows_topic_ops: bool,
    pub forced_ack_mode: Option<AckMode>,
}

impl SessionCapabilities {
    /// Both messaging models
    pub fn generic() -> Self {
        Self {
            allows_queue_ops: true,
            allows_topic_ops: true,
            forced_ack_mode: None,
        }
    }

    /// Point-to-point only
    pub fn queue_only() -> Self {
        Self {
            allows_queue_ops: true,
            allows_topic_ops: false,
            forced_ack_mode: None,
        }
    }

    /// Publish/subscribe only
    pub fn topic_only() -> Self {
        Self {
            allows_queue_ops: false,
            allows_topic_ops: true,
            forced_ack_mode: None,
        }
    }

    /// Pin the acknowledgment mode of every non-transacted session
    pub fn with_forced_ack_mode(mut self, mode: Option<AckMode>) -> Self {
        self.forced_ack_mode = mode;
        self
    }

    /// Resolve the effective ack mode for a new session
    pub fn effective_ack_mode(&self, transacted: bool, requested: AckMode) -> AckMode {
        if transacted || requested == AckMode::Transacted {
            return AckMode::Transacted;
        }
        self.forced_ack_mode.unwrap_or(requested)
    }
}

impl Default for SessionCapabilities {
    fn default() -> Self {
        Self::generic()
    }
}

/// Transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorScheme {
    /// In-process broker, shared by every connection of one factory
    InMemory,
    /// Remote broker over TCP; requires a registered connector
    Tcp,
}

impl std::fmt::Display for ConnectorScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InMemory => write!(f, "in_memory"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Defaults stamped onto messages by new producers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerDefaults {
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    /// Time-to-live in milliseconds; zero or negative means no expiration
    pub time_to_live_ms: i64,
}

impl Default for ProducerDefaults {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            priority: Priority::DEFAULT.value(),
            time_to_live_ms: 0,
        }
    }
}

/// In-memory broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Maximum number of pending messages per queue or subscription
    pub max_queue_size: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
        }
    }
}

/// Configuration for [`crate::ConnectionFactory`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub scheme: ConnectorScheme,
    /// Broker address for remote schemes
    pub address: Option<String>,
    /// Client identifier applied to every new connection
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Ack mode forced onto every non-transacted session
    pub forced_ack_mode: Option<AckMode>,
    pub producer: ProducerDefaults,
    pub in_memory: InMemoryConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            scheme: ConnectorScheme::InMemory,
            address: None,
            client_id: None,
            username: None,
            password: None,
            forced_ack_mode: None,
            producer: ProducerDefaults::default(),
            in_memory: InMemoryConfig::default(),
        }
    }
}

impl FactoryConfig {
    /// Environment variable prefix, e.g. `MSGQ__PRODUCER__PRIORITY=7`
    pub const ENV_PREFIX: &'static str = "MSGQ";

    /// Load configuration from an optional file, then `MSGQ__` environment
    /// variables. Later sources override earlier ones.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(Self::ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: FactoryConfig =
            settings
                .try_deserialize()
                .map_err(|e| ConfigurationError::Parsing {
                    message: e.to_string(),
                })?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.producer.priority > Priority::HIGHEST.value() {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "producer.priority must be 0-9, got {}",
                    self.producer.priority
                ),
            });
        }

        if self.forced_ack_mode == Some(AckMode::Transacted) {
            return Err(ConfigurationError::Invalid {
                message: "forced_ack_mode cannot be 'transacted'".to_string(),
            });
        }

        if self.scheme == ConnectorScheme::Tcp && self.address.is_none() {
            return Err(ConfigurationError::Missing {
                key: "address".to_string(),
            });
        }

        if let Some(client_id) = &self.client_id {
            if client_id.is_empty() {
                return Err(ConfigurationError::Invalid {
                    message: "client_id must not be empty".to_string(),
                });
            }
        }

        if self.in_memory.max_queue_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "in_memory.max_queue_size must be positive".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
