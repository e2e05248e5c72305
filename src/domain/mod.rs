pub mod connection;
pub mod message;
pub mod queue;
pub mod settlement;
pub mod sync;

pub use connection::*;
pub use message::*;
pub use queue::*;
pub use settlement::*;
pub use sync::*;
