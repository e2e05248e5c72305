pub mod supervisor;

pub use supervisor::{ConnectionEvent, ConnectionSupervisor};
