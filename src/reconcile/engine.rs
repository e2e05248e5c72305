//! Live broker listing vs. persisted registry
//!
//! A full run computes three sets from the live listing L and the
//! persisted registry P: `L \ P` is created, `L ∩ P` is refreshed and
//! `P \ L` is marked inactive. All writes of a run go to the store as one
//! batch, so a run that fails midway leaves the registry untouched.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::connection::ConnectionSupervisor;
use crate::domain::sync::SyncTally;
use crate::domain::{QueueRegistryEntry, SyncResult, SyncStatistics, SyncStatus};
use crate::error::{Result, SyncError};
use crate::persistence::{QueueRegistryStore, RegistryChange};
use crate::validation::validate_queue_name;

#[derive(Debug, Default)]
struct RunHistory {
    last_result: Option<SyncResult>,
    total_runs: u64,
    failed_runs: u64,
}

pub struct ReconciliationEngine {
    connection: Arc<ConnectionSupervisor>,
    registry: Arc<dyn QueueRegistryStore>,
    run_lock: tokio::sync::Mutex<()>,
    history: Mutex<RunHistory>,
}

impl ReconciliationEngine {
    pub fn new(connection: Arc<ConnectionSupervisor>, registry: Arc<dyn QueueRegistryStore>) -> Self {
        Self {
            connection,
            registry,
            run_lock: tokio::sync::Mutex::new(()),
            history: Mutex::new(RunHistory::default()),
        }
    }

    fn host(&self) -> &str {
        &self.connection.config().host
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, RunHistory> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a full run currently holds the single-flight guard
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Run a full reconciliation, rejecting the call if one is in progress
    pub async fn sync_all(&self) -> Result<SyncResult> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            debug!("Reconciliation already in progress, rejecting trigger");
            return Err(SyncError::AlreadyRunning("queue reconciliation".into()));
        };
        Ok(self.run().await)
    }

    /// Run a full reconciliation, waiting for any in-progress run first
    pub async fn sync_all_blocking(&self) -> SyncResult {
        let _guard = self.run_lock.lock().await;
        self.run().await
    }

    #[instrument(skip(self), fields(host = %self.host()))]
    async fn run(&self) -> SyncResult {
        let started = std::time::Instant::now();
        let result = match self.diff_and_apply().await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Reconciliation failed");
                SyncResult::failed(e.to_string())
            }
        };

        match result.status {
            SyncStatus::Success => info!(
                total = result.total_queues,
                created = result.created_queues,
                updated = result.updated_queues,
                deleted = result.deleted_queues,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Reconciliation complete"
            ),
            SyncStatus::PartialSuccess => warn!(
                total = result.total_queues,
                created = result.created_queues,
                updated = result.updated_queues,
                deleted = result.deleted_queues,
                errors = result.error_message.as_deref().unwrap_or(""),
                "Reconciliation partially succeeded"
            ),
            SyncStatus::Failed => {}
        }

        let mut history = self.lock_history();
        history.total_runs += 1;
        if result.status == SyncStatus::Failed {
            history.failed_runs += 1;
        }
        history.last_result = Some(result.clone());
        result
    }

    async fn diff_and_apply(&self) -> Result<SyncResult> {
        self.connection
            .ensure_connected()
            .await
            .map_err(|e| SyncError::Reconciliation(format!("broker unreachable: {}", e)))?;

        let listing = self
            .connection
            .adapter()
            .list_queues(self.host())
            .await
            .map_err(|e| SyncError::Reconciliation(format!("queue listing failed: {}", e)))?;
        let persisted: HashMap<String, QueueRegistryEntry> = self
            .registry
            .list_all()
            .await?
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        let now = Utc::now();
        let mut tally = SyncTally {
            total: listing.queues.len() + listing.unreadable.len(),
            ..Default::default()
        };
        let mut changes = Vec::with_capacity(listing.queues.len());
        let mut seen: HashSet<&str> = HashSet::new();

        for (name, reason) in &listing.unreadable {
            // skipped: neither created, updated, nor deactivated
            seen.insert(name.as_str());
            tally.record_failure(name, reason);
        }

        for info in &listing.queues {
            seen.insert(info.name.as_str());
            match persisted.get(&info.name) {
                Some(existing) => {
                    let mut entry = existing.clone();
                    if entry.refresh_from(info, now) {
                        debug!(queue = %info.name, "Queue attributes changed");
                    }
                    tally.updated += 1;
                    changes.push(RegistryChange::Upsert(entry));
                }
                None => {
                    debug!(queue = %info.name, "New queue discovered");
                    tally.created += 1;
                    changes.push(RegistryChange::Upsert(QueueRegistryEntry::from_live(info, now)));
                }
            }
        }

        for entry in persisted.values() {
            if entry.active && !seen.contains(entry.name.as_str()) {
                debug!(queue = %entry.name, "Queue vanished from broker, marking inactive");
                tally.deleted += 1;
                changes.push(RegistryChange::Deactivate {
                    name: entry.name.clone(),
                });
            }
        }

        self.registry.apply_batch(&changes).await?;
        Ok(tally.finish(now))
    }

    /// Confirm one queue against the live listing and upsert it.
    ///
    /// Returns `Ok(false)` when the broker has no such queue.
    #[instrument(skip(self))]
    pub async fn sync_one(&self, queue_name: &str) -> Result<bool> {
        validate_queue_name(queue_name)?;
        self.connection.ensure_connected().await?;

        let listing = self.connection.adapter().list_queues(self.host()).await?;
        if let Some((_, reason)) = listing.unreadable.iter().find(|(n, _)| n == queue_name) {
            return Err(SyncError::Reconciliation(format!(
                "{} is not readable: {}",
                queue_name, reason
            )));
        }
        let Some(info) = listing.get(queue_name) else {
            info!(queue = %queue_name, "Queue not present on broker");
            return Ok(false);
        };

        let now = Utc::now();
        let entry = match self.registry.get(queue_name).await? {
            Some(mut existing) => {
                existing.refresh_from(info, now);
                existing
            }
            None => QueueRegistryEntry::from_live(info, now),
        };
        self.registry.upsert(&entry).await?;

        info!(queue = %queue_name, "Queue synchronized");
        Ok(true)
    }

    /// Registry entries not synced since `since`
    pub async fn find_queues_needing_sync(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueueRegistryEntry>> {
        self.registry.find_stale(since).await
    }

    /// Hard-delete inactive entries older than the cutoff
    pub async fn purge_inactive(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let purged = self.registry.purge_inactive(older_than).await?;
        if purged > 0 {
            info!(purged, cutoff = %older_than, "Purged inactive queues");
        }
        Ok(purged)
    }

    pub async fn statistics(&self) -> Result<SyncStatistics> {
        let entries = self.registry.list_all().await?;
        let active_queues = entries.iter().filter(|e| e.active).count();
        let history = self.lock_history();

        Ok(SyncStatistics {
            last_result: history.last_result.clone(),
            total_runs: history.total_runs,
            failed_runs: history.failed_runs,
            active_queues,
            inactive_queues: entries.len() - active_queues,
            in_progress: self.is_running(),
        })
    }
}
