pub mod aggregator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{StatusStoreError, StatusTransitionError};
use crate::resources::ResourceEntry;

pub use aggregator::{
    StatusSummary, failed_results, has_failed_results, is_completed, is_in_progress,
    succeeded_results,
};

/// Lifecycle of one dispatched source as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum IngestionStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl IngestionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestionStatus::Succeeded | IngestionStatus::Failed | IngestionStatus::Canceled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            IngestionStatus::Queued => 0,
            IngestionStatus::InProgress => 1,
            IngestionStatus::Succeeded | IngestionStatus::Failed | IngestionStatus::Canceled => 2,
        }
    }

    /// Statuses only move forward. A non-terminal status may be reported again.
    pub fn can_transition_to(&self, next: IngestionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self == next || next.rank() > self.rank()
    }
}

/// One row of the status table, keyed by source id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlobStatus {
    pub source_id: Uuid,
    pub status: IngestionStatus,
    pub error_code: Option<String>,
    pub details: Option<String>,
    pub database: String,
    pub table: String,
    pub blob_path: String,
    pub updated_on: DateTime<Utc>,
}

impl BlobStatus {
    /// The row written at dispatch time.
    pub fn queued(
        source_id: Uuid,
        database: impl Into<String>,
        table: impl Into<String>,
        blob_path: impl Into<String>,
    ) -> Self {
        Self {
            source_id,
            status: IngestionStatus::Queued,
            error_code: None,
            details: None,
            database: database.into(),
            table: table.into(),
            blob_path: blob_path.into(),
            updated_on: Utc::now(),
        }
    }

    pub fn advance(
        &mut self,
        next: IngestionStatus,
        details: Option<String>,
    ) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if details.is_some() {
            self.details = details;
        }
        self.updated_on = Utc::now();
        Ok(())
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

/// The service's status table.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Writes a new row. Fails with `AlreadyExists` if the source id is taken.
    async fn insert_status(
        &self,
        table: &ResourceEntry,
        status: &BlobStatus,
    ) -> Result<(), StatusStoreError>;

    async fn update_status(
        &self,
        table: &ResourceEntry,
        status: &BlobStatus,
    ) -> Result<(), StatusStoreError>;

    async fn get_status(
        &self,
        table: &ResourceEntry,
        source_id: Uuid,
    ) -> Result<Option<BlobStatus>, StatusStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use IngestionStatus::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Queued.can_transition_to(InProgress));
        assert!(Queued.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Succeeded));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(Queued));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Canceled.can_transition_to(Canceled));
    }

    #[test]
    fn test_advance_rejects_regression() {
        let mut status = BlobStatus::queued(Uuid::new_v4(), "db", "events", "https://a/b");
        status.advance(InProgress, None).unwrap();
        status
            .advance(Failed, Some("bad mapping".to_string()))
            .unwrap();
        assert_eq!(status.details.as_deref(), Some("bad mapping"));

        let err = status.advance(Queued, None).unwrap_err();
        assert_eq!(err.from, Failed);
        assert_eq!(err.to, Queued);
        assert_eq!(status.status, Failed);
    }

    #[test]
    fn test_blob_status_row_shape() {
        let status = BlobStatus::queued(Uuid::nil(), "db", "events", "https://a/b")
            .with_error_code("NONE");
        let row = serde_json::to_value(&status).unwrap();
        assert_eq!(row["Status"], "Queued");
        assert_eq!(row["Database"], "db");
        assert_eq!(row["ErrorCode"], "NONE");
        assert_eq!(row["SourceId"], Uuid::nil().to_string());
    }
}
