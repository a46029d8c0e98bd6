//! Reductions over a snapshot of polled statuses.
//!
//! Everything here is a pure function of its input, so a polling loop can
//! call these as often as it likes.

use std::fmt;

use serde::Serialize;

use super::{BlobStatus, IngestionStatus};

/// True when there is at least one status and all of them are terminal.
pub fn is_completed(statuses: &[BlobStatus]) -> bool {
    !statuses.is_empty() && statuses.iter().all(|s| s.status.is_terminal())
}

pub fn is_in_progress(statuses: &[BlobStatus]) -> bool {
    statuses.iter().any(|s| {
        matches!(
            s.status,
            IngestionStatus::Queued | IngestionStatus::InProgress
        )
    })
}

pub fn has_failed_results(statuses: &[BlobStatus]) -> bool {
    statuses
        .iter()
        .any(|s| s.status == IngestionStatus::Failed)
}

pub fn failed_results(statuses: &[BlobStatus]) -> Vec<BlobStatus> {
    with_status(statuses, IngestionStatus::Failed)
}

pub fn succeeded_results(statuses: &[BlobStatus]) -> Vec<BlobStatus> {
    with_status(statuses, IngestionStatus::Succeeded)
}

fn with_status(statuses: &[BlobStatus], status: IngestionStatus) -> Vec<BlobStatus> {
    statuses
        .iter()
        .filter(|s| s.status == status)
        .cloned()
        .collect()
}

/// Per-status counts, mostly for log lines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub queued: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl StatusSummary {
    pub fn from_statuses(statuses: &[BlobStatus]) -> Self {
        statuses
            .iter()
            .fold(Self::default(), |mut summary, s| {
                match s.status {
                    IngestionStatus::Queued => summary.queued += 1,
                    IngestionStatus::InProgress => summary.in_progress += 1,
                    IngestionStatus::Succeeded => summary.succeeded += 1,
                    IngestionStatus::Failed => summary.failed += 1,
                    IngestionStatus::Canceled => summary.canceled += 1,
                }
                summary
            })
    }

    pub fn total(&self) -> usize {
        self.queued + self.in_progress + self.succeeded + self.failed + self.canceled
    }

    pub fn pending(&self) -> usize {
        self.queued + self.in_progress
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total: {} queued, {} in progress, {} succeeded, {} failed, {} canceled",
            self.total(),
            self.queued,
            self.in_progress,
            self.succeeded,
            self.failed,
            self.canceled
        )
    }
}
