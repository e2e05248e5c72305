pub mod engine;
pub mod scheduler;

pub use engine::ReconciliationEngine;
pub use scheduler::SyncScheduler;
