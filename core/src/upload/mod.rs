pub mod container_pool;
pub mod uploader;

use serde::Serialize;

use crate::errors::UploadFailure;
use crate::source::CompressionType;

pub use container_pool::UploadContainerPool;
pub use uploader::SourceUploader;

/// A source that now lives in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSuccess {
    pub source_name: String,
    pub blob_url: String,
    #[serde(skip)]
    pub sas_token: Option<String>,
    /// Bytes actually written to storage, after any compression.
    pub size_bytes: u64,
    pub compression: CompressionType,
}

impl UploadSuccess {
    /// The blob url with the container's SAS token appended, if it has one.
    pub fn authorized_url(&self) -> String {
        match &self.sas_token {
            Some(sas) => format!("{}?{}", self.blob_url, sas),
            None => self.blob_url.clone(),
        }
    }
}

#[derive(Debug)]
pub enum UploadOutcome {
    Success(UploadSuccess),
    Failure(UploadFailure),
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success(_))
    }

    pub fn source_name(&self) -> &str {
        match self {
            UploadOutcome::Success(success) => &success.source_name,
            UploadOutcome::Failure(failure) => &failure.source_name,
        }
    }

    pub fn into_result(self) -> Result<UploadSuccess, UploadFailure> {
        match self {
            UploadOutcome::Success(success) => Ok(success),
            UploadOutcome::Failure(failure) => Err(failure),
        }
    }
}

impl From<Result<UploadSuccess, UploadFailure>> for UploadOutcome {
    fn from(result: Result<UploadSuccess, UploadFailure>) -> Self {
        match result {
            Ok(success) => UploadOutcome::Success(success),
            Err(failure) => UploadOutcome::Failure(failure),
        }
    }
}
