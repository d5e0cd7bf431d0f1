//! Broker implementations.
//!
//! This module contains the in-process broker that backs the
//! [`ConnectorScheme::InMemory`](crate::ConnectorScheme::InMemory) scheme,
//! together with the selector language it evaluates.

pub mod memory;
pub mod selector;

pub use memory::{InMemoryBroker, InMemoryConnector};
pub use selector::Selector;
