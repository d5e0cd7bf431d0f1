//! Tests for provider types and configuration.

use super::*;
use std::io::Write;

#[test]
fn test_transacted_flag_forces_transacted_mode() {
    let caps = SessionCapabilities::generic();
    assert_eq!(
        caps.effective_ack_mode(true, AckMode::Client),
        AckMode::Transacted
    );
    assert_eq!(
        caps.effective_ack_mode(false, AckMode::Client),
        AckMode::Client
    );
    assert_eq!(
        caps.effective_ack_mode(false, AckMode::Transacted),
        AckMode::Transacted
    );
}

#[test]
fn test_forced_ack_mode_applies_to_non_transacted_sessions_only() {
    let caps = SessionCapabilities::generic().with_forced_ack_mode(Some(AckMode::DupsOk));
    assert_eq!(caps.effective_ack_mode(false, AckMode::Auto), AckMode::DupsOk);
    assert_eq!(
        caps.effective_ack_mode(true, AckMode::Auto),
        AckMode::Transacted
    );
}

#[test]
fn test_capability_presets() {
    let queue = SessionCapabilities::queue_only();
    assert!(queue.allows_queue_ops && !queue.allows_topic_ops);

    let topic = SessionCapabilities::topic_only();
    assert!(!topic.allows_queue_ops && topic.allows_topic_ops);
}

#[test]
fn test_auto_modes_acknowledge_on_delivery() {
    assert!(AckMode::Auto.acknowledges_on_delivery());
    assert!(AckMode::DupsOk.acknowledges_on_delivery());
    assert!(!AckMode::Client.acknowledges_on_delivery());
    assert!(!AckMode::Transacted.acknowledges_on_delivery());
}

#[test]
fn test_default_config_is_valid() {
    let config = FactoryConfig::default();
    assert_eq!(config.scheme, ConnectorScheme::InMemory);
    assert!(config.validate().is_ok());
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut config = FactoryConfig::default();
    config.producer.priority = 12;
    assert!(config.validate().is_err());

    let mut config = FactoryConfig::default();
    config.forced_ack_mode = Some(AckMode::Transacted);
    assert!(config.validate().is_err());

    let mut config = FactoryConfig::default();
    config.scheme = ConnectorScheme::Tcp;
    assert!(matches!(
        config.validate(),
        Err(ConfigurationError::Missing { .. })
    ));
}

#[test]
fn test_load_from_yaml_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "client_id: billing\nforced_ack_mode: dups_ok\nproducer:\n  priority: 7\n  time_to_live_ms: 1500\n"
    )
    .unwrap();

    let config = FactoryConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.client_id.as_deref(), Some("billing"));
    assert_eq!(config.forced_ack_mode, Some(AckMode::DupsOk));
    assert_eq!(config.producer.priority, 7);
    assert_eq!(config.producer.time_to_live_ms, 1500);
    assert_eq!(config.in_memory.max_queue_size, 10000);
}

#[test]
fn test_load_rejects_invalid_file_contents() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "producer:\n  priority: 42\n").unwrap();

    let result = FactoryConfig::load(Some(file.path()));
    assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
}
