//! Supervisor Layer for Queue Listeners
//!
//! One long-running poll task per monitored queue, each with independent
//! failure tracking:
//! - `listener`: the arena of handles and the start/stop/restart contract
//! - `worker`: the poll loop and the inbound message sink

pub mod listener;
pub mod worker;

pub use listener::{BulkOutcome, ListenerHandle, ListenerSupervisor};
pub use worker::{InboundSink, ListenerEvent, ListenerStatus};
