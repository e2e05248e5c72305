use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall outcome of a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "SUCCESS",
            SyncStatus::PartialSuccess => "PARTIAL_SUCCESS",
            SyncStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable summary of one reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub total_queues: usize,
    pub created_queues: usize,
    pub updated_queues: usize,
    pub deleted_queues: usize,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub sync_time: DateTime<Utc>,
}

impl SyncResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            total_queues: 0,
            created_queues: 0,
            updated_queues: 0,
            deleted_queues: 0,
            status: SyncStatus::Failed,
            error_message: Some(error.into()),
            sync_time: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// Accumulates per-queue outcomes during a run before freezing into a SyncResult
#[derive(Debug, Default)]
pub(crate) struct SyncTally {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failures: Vec<String>,
}

impl SyncTally {
    pub fn record_failure(&mut self, queue: &str, reason: impl fmt::Display) {
        self.failures.push(format!("{}: {}", queue, reason));
    }

    pub fn finish(self, sync_time: DateTime<Utc>) -> SyncResult {
        let (status, error_message) = if self.failures.is_empty() {
            (SyncStatus::Success, None)
        } else {
            (SyncStatus::PartialSuccess, Some(self.failures.join("; ")))
        };

        SyncResult {
            total_queues: self.total,
            created_queues: self.created,
            updated_queues: self.updated,
            deleted_queues: self.deleted,
            status,
            error_message,
            sync_time,
        }
    }
}

/// Operator-facing reconciliation statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub last_result: Option<SyncResult>,
    pub total_runs: u64,
    pub failed_runs: u64,
    pub active_queues: usize,
    pub inactive_queues: usize,
    pub in_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_without_failures_is_success() {
        let tally = SyncTally {
            total: 3,
            created: 1,
            updated: 2,
            ..Default::default()
        };
        let result = tally.finish(Utc::now());
        assert_eq!(result.status, SyncStatus::Success);
        assert!(result.error_message.is_none());
        assert_eq!(result.created_queues, 1);
    }

    #[test]
    fn tally_with_failures_is_partial_and_aggregates_messages() {
        let mut tally = SyncTally::default();
        tally.record_failure("a", "access denied");
        tally.record_failure("b", "timeout");
        let result = tally.finish(Utc::now());
        assert_eq!(result.status, SyncStatus::PartialSuccess);
        assert_eq!(
            result.error_message.as_deref(),
            Some("a: access denied; b: timeout")
        );
    }
}
