use async_trait::async_trait;

use crate::errors::QueueError;
use crate::resources::ResourceEntry;

/// The message queue ingestion announcements are posted to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngestionQueue: Send + Sync {
    async fn post_message(&self, queue: &ResourceEntry, message: &str) -> Result<(), QueueError>;
}
