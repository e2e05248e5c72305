pub mod broker;
pub mod cli;
pub mod config;
pub mod connection;
pub mod coordination;
pub mod correlation;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod reconcile;
pub mod service;
pub mod supervisor;
pub mod validation;

pub use broker::{BrokerAdapter, InMemoryBroker, ShellBroker};
pub use config::AppConfig;
pub use connection::ConnectionSupervisor;
pub use coordination::{GracefulShutdown, LifecycleManager, ShutdownSignal, ShutdownToken};
pub use correlation::{CorrelationTracker, PairedResult};
pub use error::{Result, SyncError};
pub use persistence::{InMemoryMessageStore, InMemoryQueueRegistry, MessageStore, PostgresStore, QueueRegistryStore};
pub use reconcile::{ReconciliationEngine, SyncScheduler};
pub use service::Service;
pub use supervisor::{ListenerSupervisor, ListenerHandle};
