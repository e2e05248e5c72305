//! Message correlation
//!
//! Tracks the lifecycle of every message the engine sends or receives and
//! keeps the two legs of a settlement (RECE/DELI) linked to each other.

pub mod ids;
pub mod tracker;

pub use ids::{PairIds, CORRELATION_PREFIX, INBOUND_PREFIX};
pub use tracker::{CorrelationTracker, LegResult, PairedResult, PairedUpdate, UpdateOutcome};
