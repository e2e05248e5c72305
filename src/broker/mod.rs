//! Broker access layer
//!
//! The engine only talks to a broker through [`BrokerAdapter`]:
//! - `ShellBroker` drives the host's native queuing service
//! - `InMemoryBroker` is a fully in-process fake with failure injection

pub mod addressing;
pub mod memory;
pub mod shell;
pub mod traits;

pub use addressing::{is_local_host, ProtocolPreference, QueueAddress};
pub use memory::{BrokerCall, InMemoryBroker};
pub use shell::ShellBroker;
pub use traits::{BrokerAdapter, BrokerMessage, QueueListing, SendRequest};

#[cfg(test)]
pub use traits::MockBrokerAdapter;
