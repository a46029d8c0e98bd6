use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::BatchOperationResult;
use crate::config::UploadConfig;
use crate::credentials::{self, CredentialProvider};
use crate::errors::{IngestErrorCode, StorageError, UploadFailure};
use crate::source::{CompressionType, LoadedSource, UploadSource};
use crate::storage::ObjectStorage;
use crate::telemetry::IngestTelemetry;
use crate::upload::{UploadContainerPool, UploadOutcome, UploadSuccess};

/// Stages local sources into the service's temp-storage containers.
pub struct SourceUploader {
    pool: UploadContainerPool,
    storage: Arc<dyn ObjectStorage>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    config: UploadConfig,
    telemetry: Arc<dyn IngestTelemetry>,
}

impl SourceUploader {
    pub fn new(
        pool: UploadContainerPool,
        storage: Arc<dyn ObjectStorage>,
        config: UploadConfig,
        telemetry: Arc<dyn IngestTelemetry>,
    ) -> Self {
        Self {
            pool,
            storage,
            credentials: None,
            config,
            telemetry,
        }
    }

    /// Bearer tokens for containers that do not carry a SAS token.
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub async fn upload(&self, source: UploadSource) -> UploadOutcome {
        self.upload_cancellable(source, &CancellationToken::new()).await
    }

    pub async fn upload_cancellable(
        &self,
        source: UploadSource,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        let outcome: UploadOutcome = self.stage(source, cancel).await.into();
        match &outcome {
            UploadOutcome::Success(success) => {
                self.telemetry.record_upload(true, success.size_bytes)
            }
            UploadOutcome::Failure(_) => self.telemetry.record_upload(false, 0),
        }
        outcome
    }

    /// Uploads every source with at most `max_concurrency` uploads in flight.
    ///
    /// One source failing never affects the others. If `cancel` fires, uploads
    /// still in flight are dropped and only the finished ones are returned.
    pub async fn upload_many(
        &self,
        sources: Vec<UploadSource>,
        cancel: &CancellationToken,
    ) -> BatchOperationResult<UploadSuccess, UploadFailure> {
        let total = sources.len();
        self.telemetry.record_batch(total);

        let mut pending = stream::iter(sources.into_iter().enumerate())
            .map(|(index, source)| async move {
                (index, self.upload_cancellable(source, cancel).await)
            })
            .buffer_unordered(self.config.max_concurrency.max(1));

        let mut completed = Vec::with_capacity(total);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(completed = completed.len(), total, "Batch upload cancelled");
                    break;
                }
                next = pending.next() => match next {
                    Some(item) => completed.push(item),
                    None => break,
                },
            }
        }

        completed.sort_by_key(|(index, _)| *index);
        let result: BatchOperationResult<_, _> = completed
            .into_iter()
            .map(|(_, outcome)| outcome.into_result())
            .collect();

        info!(
            total,
            succeeded = result.successes.len(),
            failed = result.failures.len(),
            "Batch upload finished"
        );
        result
    }

    async fn stage(
        &self,
        source: UploadSource,
        cancel: &CancellationToken,
    ) -> Result<UploadSuccess, UploadFailure> {
        let loaded = source.load(self.config.max_source_bytes).await?;
        let name = loaded.name.clone();
        let (payload, compression) = self.prepare(loaded).await?;
        let blob_name = blob_name(&name, compression);

        let mut bearer: Option<String> = None;
        let mut last_error: Option<StorageError> = None;

        // One rotation slot per source; attempts walk the snapshot from there.
        let containers = self.pool.rotation(&name).await?;
        for attempt in 1..=self.config.max_attempts {
            let container = containers.container(attempt - 1);

            let auth_token = match container.sas_token() {
                Some(sas) => Some(sas.to_string()),
                None => match &self.credentials {
                    Some(provider) => {
                        if bearer.is_none() {
                            bearer = Some(self.bearer_token(provider.as_ref(), &name, cancel).await?);
                        }
                        bearer.clone()
                    }
                    None => None,
                },
            };

            debug!(
                source = %name,
                attempt,
                container = %container.object_name(),
                bytes = payload.len(),
                "Uploading blob"
            );
            self.telemetry.record_upload_attempt();

            match self
                .storage
                .upload_blob(container, &blob_name, payload.clone(), auth_token)
                .await
            {
                Ok(blob_url) => {
                    info!(source = %name, attempt, blob = %blob_name, "Staged source");
                    return Ok(UploadSuccess {
                        source_name: name,
                        blob_url,
                        sas_token: container.sas_token().map(str::to_string),
                        size_bytes: payload.len() as u64,
                        compression,
                    });
                }
                Err(err) => {
                    let code = IngestErrorCode::from(&err);
                    if !code.is_retryable() {
                        error!(source = %name, attempt, "Unrecognised upload failure: {}", err);
                        return Err(UploadFailure::new(&name, code, err.to_string()).with_cause(err));
                    }
                    warn!(
                        source = %name,
                        attempt,
                        container = %container.object_name(),
                        code = %code,
                        "Upload attempt failed, rotating container: {}", err
                    );
                    last_error = Some(err);
                }
            }
        }

        let message = format!(
            "upload failed after {} attempts",
            self.config.max_attempts
        );
        let failure = UploadFailure::new(&name, IngestErrorCode::UploadFailed, message);
        Err(match last_error {
            Some(err) => failure.with_cause(err),
            None => failure,
        })
    }

    /// Compresses small uncompressed sources; leaves everything else as is.
    async fn prepare(
        &self,
        loaded: LoadedSource,
    ) -> Result<(Bytes, CompressionType), UploadFailure> {
        if loaded.compression.is_compressed()
            || loaded.bytes.len() as u64 > self.config.compress_threshold_bytes
        {
            return Ok((loaded.bytes, loaded.compression));
        }

        let level = self.config.compression_level;
        let raw = loaded.bytes;
        let compressed = tokio::task::spawn_blocking(move || zstd::encode_all(raw.as_ref(), level))
            .await
            .map_err(|e| {
                UploadFailure::new(&loaded.name, IngestErrorCode::Unknown, "compression task failed")
                    .with_cause(e)
            })?
            .map_err(|e| {
                UploadFailure::new(&loaded.name, IngestErrorCode::Unknown, "compression failed")
                    .with_cause(e)
            })?;

        Ok((Bytes::from(compressed), CompressionType::Zstd))
    }

    async fn bearer_token(
        &self,
        provider: &dyn CredentialProvider,
        source_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, UploadFailure> {
        credentials::request_token(provider, cancel)
            .await
            .map_err(|e| {
                UploadFailure::new(
                    source_name,
                    IngestErrorCode::AuthenticationFailed,
                    "could not obtain a storage token",
                )
                .with_cause(e)
            })
    }
}

/// `<uuid>__<sanitised name>[.zst]`
fn blob_name(source_name: &str, compression: CompressionType) -> String {
    let mut sanitized: String = source_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        sanitized.push_str("source");
    }

    let mut name = format!("{}__{}", Uuid::new_v4(), sanitized);
    if let Some(extension) = compression.extension() {
        if !name.ends_with(&format!(".{extension}")) {
            name.push('.');
            name.push_str(extension);
        }
    }
    name
}
