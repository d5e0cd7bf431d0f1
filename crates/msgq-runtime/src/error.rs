//! Error types for messaging operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all connection, session, consumer and producer operations
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Operation is not allowed in the current lifecycle or mode of the target object
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Destination is missing, of the wrong type, or owned by another connection
    #[error("Invalid destination: {message}")]
    InvalidDestination { message: String },

    /// Message selector could not be parsed by the broker
    #[error("Invalid selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },

    /// The broker dropped the connection
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl MessagingError {
    /// Build an invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Build an invalid-destination error
    pub fn invalid_destination(message: impl Into<String>) -> Self {
        Self::InvalidDestination {
            message: message.into(),
        }
    }

    /// Check if the error signals that the broker dropped the connection
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// Check if error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidState { .. } => false,
            Self::InvalidDestination { .. } => false,
            Self::InvalidSelector { .. } => false,
            Self::ConnectionLost { .. } => true,
            Self::ProviderError { .. } => true,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionLost { .. } => Some(Duration::from_secs(5)),
            Self::ProviderError { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

/// Errors during message body serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("No connector registered for scheme '{scheme}'")]
    UnsupportedConnector { scheme: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
