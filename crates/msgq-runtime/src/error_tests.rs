//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(MessagingError::ConnectionLost {
        message: "socket reset".to_string(),
    }
    .is_transient());

    assert!(!MessagingError::invalid_state("session is closed").is_transient());
    assert!(!MessagingError::invalid_destination("foreign temporary queue").is_transient());

    assert!(!MessagingError::InvalidSelector {
        selector: "a =".to_string(),
        message: "missing operand".to_string(),
    }
    .is_transient());
}

#[test]
fn test_connection_lost_classification() {
    let lost = MessagingError::ConnectionLost {
        message: "broker shut down".to_string(),
    };
    assert!(lost.is_connection_lost());

    let provider = MessagingError::ProviderError {
        provider: "memory".to_string(),
        code: "QueueFull".to_string(),
        message: "queue is full".to_string(),
    };
    assert!(!provider.is_connection_lost());
}

#[test]
fn test_retry_suggestions() {
    let lost = MessagingError::ConnectionLost {
        message: "gone".to_string(),
    };
    assert_eq!(lost.retry_after(), Some(Duration::from_secs(5)));
    assert_eq!(MessagingError::invalid_state("closed").retry_after(), None);
}

#[test]
fn test_error_display_includes_context() {
    let err = MessagingError::invalid_state("client id already set");
    assert_eq!(err.to_string(), "Invalid state: client id already set");

    let err: MessagingError = ConfigurationError::UnsupportedConnector {
        scheme: "tcp".to_string(),
    }
    .into();
    assert!(err.to_string().contains("tcp"));
}
