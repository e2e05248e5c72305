//! Coordination Layer
//!
//! Ordered startup of the service components and the shutdown signal that
//! every long-running task listens to.

pub mod lifecycle;
pub mod shutdown;

pub use lifecycle::{ComponentInfo, ComponentState, LifecycleConfig, LifecycleEvent, LifecycleManager};
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownError, ShutdownPhase,
    ShutdownSignal, ShutdownStep, ShutdownToken,
};
