//! Component Lifecycle Management
//!
//! Starts the service's components in priority order and stops them in
//! reverse. A failed or timed-out start aborts the sequence; components that
//! already started are left `Running` so `stop_all` can unwind them.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// Component lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ComponentState {
    pub fn is_running(&self) -> bool {
        matches!(self, ComponentState::Running)
    }

    /// Nothing left to stop
    pub fn is_terminal(&self) -> bool {
        matches!(self, ComponentState::Stopped | ComponentState::Failed)
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentState::Stopped => write!(f, "stopped"),
            ComponentState::Starting => write!(f, "starting"),
            ComponentState::Running => write!(f, "running"),
            ComponentState::Stopping => write!(f, "stopping"),
            ComponentState::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle events broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    StateChanged {
        component: String,
        from: ComponentState,
        to: ComponentState,
        reason: Option<String>,
    },
    StartupCompleted {
        duration_ms: u64,
    },
    StartupAborted {
        component: String,
        reason: String,
    },
    ShutdownCompleted {
        duration_ms: u64,
    },
}

/// Point-in-time view of one component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub name: String,
    pub state: ComponentState,
    /// Lower starts first and stops last
    pub priority: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Per-component start timeout
    pub startup_timeout: Duration,
    /// Per-component stop timeout
    pub shutdown_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

pub struct LifecycleManager {
    components: RwLock<HashMap<String, ComponentInfo>>,
    config: LifecycleConfig,
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            components: RwLock::new(HashMap::new()),
            config,
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LifecycleConfig::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    /// Register a component; re-registering resets it to `Stopped`
    pub async fn register(&self, name: &str, priority: u8) {
        self.components.write().await.insert(
            name.to_string(),
            ComponentInfo {
                name: name.to_string(),
                state: ComponentState::Stopped,
                priority,
                started_at: None,
                stopped_at: None,
                last_error: None,
            },
        );
        debug!(component = name, priority, "Component registered");
    }

    pub async fn get_state(&self, name: &str) -> Option<ComponentState> {
        self.components.read().await.get(name).map(|c| c.state)
    }

    pub async fn components(&self) -> Vec<ComponentInfo> {
        let mut all: Vec<_> = self.components.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        all
    }

    /// Startup order: priority ascending, ties broken by name
    pub async fn startup_order(&self) -> Vec<String> {
        self.components().await.into_iter().map(|c| c.name).collect()
    }

    pub async fn shutdown_order(&self) -> Vec<String> {
        let mut order = self.startup_order().await;
        order.reverse();
        order
    }

    pub async fn all_running(&self) -> bool {
        let components = self.components.read().await;
        !components.is_empty() && components.values().all(|c| c.state.is_running())
    }

    async fn set_state(&self, name: &str, state: ComponentState, reason: Option<&str>) {
        let mut components = self.components.write().await;
        let Some(component) = components.get_mut(name) else {
            return;
        };

        let from = component.state;
        component.state = state;
        match state {
            ComponentState::Running => component.started_at = Some(Utc::now()),
            ComponentState::Stopped => component.stopped_at = Some(Utc::now()),
            ComponentState::Failed => {
                component.stopped_at = Some(Utc::now());
                component.last_error = reason.map(str::to_string);
            }
            ComponentState::Starting | ComponentState::Stopping => {}
        }

        let _ = self.event_tx.send(LifecycleEvent::StateChanged {
            component: name.to_string(),
            from,
            to: state,
            reason: reason.map(str::to_string),
        });
        debug!(component = name, %from, to = %state, "Component state changed");
    }

    /// Start every registered component in order.
    ///
    /// `start_fn` receives the component name. The first error or timeout
    /// marks that component `Failed` and aborts; later components are never
    /// started.
    pub async fn start_all<F, Fut>(&self, start_fn: F) -> Result<()>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let started = Instant::now();
        let order = self.startup_order().await;
        info!(components = ?order, "Starting components");

        for name in order {
            self.set_state(&name, ComponentState::Starting, None).await;

            let reason = match tokio::time::timeout(self.config.startup_timeout, start_fn(name.clone())).await {
                Ok(Ok(())) => {
                    self.set_state(&name, ComponentState::Running, None).await;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "start timed out after {}ms",
                    self.config.startup_timeout.as_millis()
                ),
            };

            error!(component = %name, reason = %reason, "Component failed to start");
            self.set_state(&name, ComponentState::Failed, Some(&reason)).await;
            let _ = self.event_tx.send(LifecycleEvent::StartupAborted {
                component: name.clone(),
                reason: reason.clone(),
            });
            return Err(SyncError::StartupFailed {
                component: name,
                reason,
            });
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let _ = self
            .event_tx
            .send(LifecycleEvent::StartupCompleted { duration_ms });
        info!(duration_ms, "All components started");
        Ok(())
    }

    /// Stop every component that is not already stopped, in reverse order.
    /// A stop that exceeds its timeout is logged and treated as stopped.
    pub async fn stop_all<F, Fut>(&self, stop_fn: F, reason: &str)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let started = Instant::now();
        let order = self.shutdown_order().await;
        info!(components = ?order, reason, "Stopping components");

        for name in order {
            let current = self.get_state(&name).await.unwrap_or(ComponentState::Stopped);
            if current.is_terminal() {
                continue;
            }

            self.set_state(&name, ComponentState::Stopping, Some(reason)).await;
            if tokio::time::timeout(self.config.shutdown_timeout, stop_fn(name.clone()))
                .await
                .is_err()
            {
                warn!(
                    component = %name,
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "Component stop timed out"
                );
                self.set_state(&name, ComponentState::Stopped, Some("timeout")).await;
            } else {
                self.set_state(&name, ComponentState::Stopped, None).await;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let _ = self
            .event_tx
            .send(LifecycleEvent::ShutdownCompleted { duration_ms });
        info!(duration_ms, "All components stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    async fn manager() -> LifecycleManager {
        let manager = LifecycleManager::with_defaults();
        manager.register("scheduler", 3).await;
        manager.register("connection", 0).await;
        manager.register("listeners", 2).await;
        manager.register("initial_sync", 1).await;
        manager
    }

    #[tokio::test]
    async fn orders_by_priority() {
        let manager = manager().await;
        assert_eq!(
            manager.startup_order().await,
            vec!["connection", "initial_sync", "listeners", "scheduler"]
        );
        assert_eq!(
            manager.shutdown_order().await,
            vec!["scheduler", "listeners", "initial_sync", "connection"]
        );
    }

    #[tokio::test]
    async fn first_failure_aborts_startup() {
        let manager = manager().await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        let result = manager
            .start_all(|name| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(name.clone());
                    if name == "listeners" {
                        Err(SyncError::Internal("no queues".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::StartupFailed { ref component, .. }) if component == "listeners"));
        assert_eq!(*seen.lock().unwrap(), vec!["connection", "initial_sync", "listeners"]);
        assert_eq!(manager.get_state("connection").await, Some(ComponentState::Running));
        assert_eq!(manager.get_state("listeners").await, Some(ComponentState::Failed));
        assert_eq!(manager.get_state("scheduler").await, Some(ComponentState::Stopped));
    }

    #[tokio::test]
    async fn stop_unwinds_only_started_components() {
        let manager = manager().await;
        let _ = manager
            .start_all(|name| async move {
                if name == "listeners" {
                    Err(SyncError::Internal("boom".into()))
                } else {
                    Ok(())
                }
            })
            .await;

        let stopped = Arc::new(Mutex::new(Vec::new()));
        let log = stopped.clone();
        manager
            .stop_all(
                |name| {
                    let log = log.clone();
                    async move { log.lock().unwrap().push(name) }
                },
                "startup failed",
            )
            .await;

        assert_eq!(*stopped.lock().unwrap(), vec!["initial_sync", "connection"]);
        assert!(!manager.all_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_start_times_out() {
        let manager = LifecycleManager::new(LifecycleConfig {
            startup_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        manager.register("connection", 0).await;

        let result = manager
            .start_all(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SyncError::StartupFailed { .. })));
    }

    #[tokio::test]
    async fn clean_start_reports_all_running() {
        let manager = manager().await;
        let mut events = manager.subscribe();
        manager.start_all(|_| async { Ok(()) }).await.unwrap();

        assert!(manager.all_running().await);
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LifecycleEvent::StartupCompleted { .. }) {
                completed = true;
            }
        }
        assert!(completed);
    }
}
