use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::BatchOperationResult;
use crate::config::IngestConfig;
use crate::credentials::CredentialProvider;
use crate::dispatch::{BlobSourceInfo, IngestionDispatcher, IngestionProperties};
use crate::errors::{self, DispatchError, IngestionError};
use crate::queue::IngestionQueue;
use crate::resources::{ResourceDiscovery, ResourceManager};
use crate::source::UploadSource;
use crate::status::{BlobStatus, StatusStore};
use crate::storage::ObjectStorage;
use crate::telemetry::IngestTelemetry;
use crate::upload::{SourceUploader, UploadContainerPool, UploadSuccess};

/// The collaborators a `QueuedIngestor` talks to.
pub struct IngestorServices {
    pub discovery: Arc<dyn ResourceDiscovery>,
    pub storage: Arc<dyn ObjectStorage>,
    pub queue: Arc<dyn IngestionQueue>,
    pub status_store: Option<Arc<dyn StatusStore>>,
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    pub telemetry: Arc<dyn IngestTelemetry>,
}

/// What the caller keeps to follow up on an ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionReceipt {
    pub source_id: Uuid,
    pub source_name: String,
    pub blob_url: String,
    pub size_bytes: Option<u64>,
}

#[derive(Error, Debug)]
#[error("ingestion of '{source_name}' failed: {error}")]
pub struct IngestFailure {
    pub source_name: String,
    #[source]
    pub error: IngestionError,
}

/// Stages sources, announces them for queued ingestion and looks up their status.
pub struct QueuedIngestor {
    resources: Arc<ResourceManager>,
    uploader: SourceUploader,
    dispatcher: IngestionDispatcher,
    dispatch_concurrency: usize,
}

impl QueuedIngestor {
    pub fn new(config: IngestConfig, services: IngestorServices) -> errors::Result<Self> {
        config.validate()?;

        let resources = Arc::new(ResourceManager::new(
            services.discovery,
            &config.resources,
            services.telemetry.clone(),
        ));

        let mut uploader = SourceUploader::new(
            UploadContainerPool::new(resources.clone()),
            services.storage,
            config.upload.clone(),
            services.telemetry.clone(),
        );
        if let Some(credentials) = services.credentials {
            uploader = uploader.with_credentials(credentials);
        }

        let mut dispatcher = IngestionDispatcher::new(
            resources.clone(),
            services.queue,
            config.dispatch.clone(),
            services.telemetry,
        );
        if let Some(store) = services.status_store {
            dispatcher = dispatcher.with_status_store(store);
        }

        Ok(Self {
            resources,
            uploader,
            dispatcher,
            dispatch_concurrency: config.upload.max_concurrency,
        })
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Uploads one source and dispatches it.
    pub async fn ingest_from_source(
        &self,
        source: UploadSource,
        properties: &IngestionProperties,
    ) -> errors::Result<IngestionReceipt> {
        properties.validate()?;
        let staged = self.uploader.upload(source).await.into_result()?;
        self.dispatch_staged(&staged, properties).await
    }

    /// Dispatches a blob that is already in storage.
    pub async fn ingest_from_blob(
        &self,
        blob: BlobSourceInfo,
        properties: &IngestionProperties,
    ) -> errors::Result<IngestionReceipt> {
        let source_id = self.dispatcher.dispatch(&blob, properties).await?;
        Ok(IngestionReceipt {
            source_id,
            source_name: blob.blob_url().to_string(),
            blob_url: blob.blob_url().to_string(),
            size_bytes: blob.raw_size(),
        })
    }

    /// Uploads and dispatches many sources with the same properties.
    ///
    /// Without cancellation every source ends up in exactly one bucket. When
    /// `cancel` fires, uploads still in flight are left out of the result;
    /// staged blobs that were not yet dispatched come back as cancelled
    /// failures and are never announced.
    pub async fn ingest_many(
        &self,
        sources: Vec<UploadSource>,
        properties: &IngestionProperties,
        cancel: &CancellationToken,
    ) -> BatchOperationResult<IngestionReceipt, IngestFailure> {
        if let Err(e) = properties.validate() {
            let reason = e.to_string();
            return sources
                .into_iter()
                .map(|source| {
                    Err(IngestFailure {
                        source_name: source.name().to_string(),
                        error: DispatchError::InvalidProperties {
                            reason: reason.clone(),
                        }
                        .into(),
                    })
                })
                .collect();
        }

        let uploaded = self.uploader.upload_many(sources, cancel).await;

        let dispatched: Vec<Result<IngestionReceipt, IngestFailure>> =
            stream::iter(uploaded.successes)
                .map(|staged| async move {
                    if cancel.is_cancelled() {
                        return Err(IngestFailure {
                            source_name: staged.source_name,
                            error: IngestionError::Cancelled {
                                stage: "dispatch".to_string(),
                            },
                        });
                    }
                    self.dispatch_staged(&staged, properties)
                        .await
                        .map_err(|error| IngestFailure {
                            source_name: staged.source_name.clone(),
                            error,
                        })
                })
                .buffered(self.dispatch_concurrency.max(1))
                .collect()
                .await;

        let mut result: BatchOperationResult<IngestionReceipt, IngestFailure> = uploaded
            .failures
            .into_iter()
            .map(|failure| {
                Err(IngestFailure {
                    source_name: failure.source_name.clone(),
                    error: failure.into(),
                })
            })
            .collect();
        for item in dispatched {
            match item {
                Ok(receipt) => result.successes.push(receipt),
                Err(failure) => result.failures.push(failure),
            }
        }

        if result.has_failures() {
            warn!(
                succeeded = result.successes.len(),
                failed = result.failures.len(),
                "Batch ingestion finished with failures"
            );
        } else {
            info!(succeeded = result.successes.len(), "Batch ingestion finished");
        }
        result
    }

    /// Current status rows for the given source ids.
    ///
    /// Ids without a status row (queue reporting, or unknown ids) are skipped.
    pub async fn poll_statuses(&self, source_ids: &[Uuid]) -> errors::Result<Vec<BlobStatus>> {
        let mut statuses = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            if let Some(status) = self.dispatcher.status(*source_id).await? {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    async fn dispatch_staged(
        &self,
        staged: &UploadSuccess,
        properties: &IngestionProperties,
    ) -> errors::Result<IngestionReceipt> {
        let blob = BlobSourceInfo::from_upload(staged);
        let source_id = self.dispatcher.dispatch(&blob, properties).await?;
        Ok(IngestionReceipt {
            source_id,
            source_name: staged.source_name.clone(),
            blob_url: staged.blob_url.clone(),
            size_bytes: Some(staged.size_bytes),
        })
    }
}
