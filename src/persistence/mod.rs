//! Persistence layer
//!
//! Two stores back the engine: the queue registry mirrored from the broker
//! and the message audit trail. Both have an in-memory implementation for
//! tests and a PostgreSQL implementation for deployment.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{InMemoryMessageStore, InMemoryQueueRegistry};
pub use postgres::PostgresStore;
pub use traits::{CasOutcome, MessageStore, QueueRegistryStore, RegistryChange};
