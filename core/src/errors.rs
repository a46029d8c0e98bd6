use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::resources::ResourceType;
use crate::status::IngestionStatus;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadFailure),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Operation cancelled before {stage}")]
    Cancelled { stage: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

/// Errors returned by the resource-discovery collaborator.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery request failed: {reason}")]
    Request { reason: String },

    #[error("Discovery response was malformed: {reason}")]
    Malformed { reason: String },
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Ingestion resource service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    #[error("No {resource_type} resources available")]
    NoResourcesAvailable { resource_type: ResourceType },

    #[error("Invalid resource uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
}

/// Errors returned by the object-storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Transient storage error (status {status}): {reason}")]
    Transient { status: u16, reason: String },

    #[error("Container {container} is unavailable: {reason}")]
    ContainerUnavailable { container: String, reason: String },

    #[error("Storage authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("Unexpected storage error: {0}")]
    Other(#[source] BoxError),
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Token acquisition failed: {reason}")]
    Unavailable { reason: String },

    #[error("Token request was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to post message to queue {queue}: {reason}")]
    Post { queue: String, reason: String },

    #[error("Queue authentication failed: {reason}")]
    Authentication { reason: String },
}

#[derive(Error, Debug)]
pub enum StatusStoreError {
    #[error("Status row for {source_id} already exists")]
    AlreadyExists { source_id: Uuid },

    #[error("Status store request failed: {reason}")]
    Request { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot move ingestion status from {from:?} to {to:?}")]
pub struct StatusTransitionError {
    pub from: IngestionStatus,
    pub to: IngestionStatus,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Source id {source_id} was already dispatched")]
    DuplicateSourceId { source_id: Uuid },

    #[error("Invalid ingestion properties: {reason}")]
    InvalidProperties { reason: String },

    #[error("Invalid blob source: {reason}")]
    InvalidSource { reason: String },

    #[error("{0}")]
    Resource(#[from] ResourceError),

    #[error("Failed to encode ingestion message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Queue(#[from] QueueError),

    #[error("{0}")]
    StatusStore(#[from] StatusStoreError),
}

/// Error codes attached to a failed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestErrorCode {
    SourceIsNull,
    SourceNotFound,
    SourceNotReadable,
    SourceIsEmpty,
    SourceSizeLimitExceeded,
    UploadFailed,
    NoContainersAvailable,
    ContainerUnavailable,
    NetworkError,
    AuthenticationFailed,
    Unknown,
}

impl IngestErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestErrorCode::SourceIsNull => "SOURCE_IS_NULL",
            IngestErrorCode::SourceNotFound => "SOURCE_NOT_FOUND",
            IngestErrorCode::SourceNotReadable => "SOURCE_NOT_READABLE",
            IngestErrorCode::SourceIsEmpty => "SOURCE_IS_EMPTY",
            IngestErrorCode::SourceSizeLimitExceeded => "SOURCE_SIZE_LIMIT_EXCEEDED",
            IngestErrorCode::UploadFailed => "UPLOAD_FAILED",
            IngestErrorCode::NoContainersAvailable => "NO_CONTAINERS_AVAILABLE",
            IngestErrorCode::ContainerUnavailable => "CONTAINER_UNAVAILABLE",
            IngestErrorCode::NetworkError => "NETWORK_ERROR",
            IngestErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            IngestErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Caller input problems. These never touch the network and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IngestErrorCode::SourceIsNull
                | IngestErrorCode::SourceNotFound
                | IngestErrorCode::SourceNotReadable
                | IngestErrorCode::SourceIsEmpty
                | IngestErrorCode::SourceSizeLimitExceeded
        )
    }

    /// Whether the uploader may try the next container after this error.
    pub fn is_retryable(&self) -> bool {
        !self.is_validation() && *self != IngestErrorCode::Unknown
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

impl fmt::Display for IngestErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&StorageError> for IngestErrorCode {
    fn from(err: &StorageError) -> Self {
        match err {
            StorageError::Network { .. } => IngestErrorCode::NetworkError,
            StorageError::Transient { .. } => IngestErrorCode::UploadFailed,
            StorageError::ContainerUnavailable { .. } => IngestErrorCode::ContainerUnavailable,
            StorageError::Authentication { .. } => IngestErrorCode::AuthenticationFailed,
            StorageError::Other(_) => IngestErrorCode::Unknown,
        }
    }
}

/// A single source that could not be staged.
#[derive(Error, Debug)]
#[error("{error_code} for source '{source_name}': {message}")]
pub struct UploadFailure {
    pub source_name: String,
    pub error_code: IngestErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<BoxError>,
    pub is_permanent: bool,
}

impl UploadFailure {
    pub fn new(
        source_name: impl Into<String>,
        error_code: IngestErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            error_code,
            message: message.into(),
            cause: None,
            is_permanent: error_code.is_permanent(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;

impl From<serde_json::Error> for IngestionError {
    fn from(err: serde_json::Error) -> Self {
        IngestionError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for IngestionError {
    fn from(err: serde_yaml::Error) -> Self {
        IngestionError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl IngestionError {
    /// Whether retrying the whole logical operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestionError::Upload(failure) => !failure.is_permanent,
            IngestionError::Resource(ResourceError::InvalidUri { .. }) => false,
            IngestionError::Resource(_) => true,
            IngestionError::Dispatch(DispatchError::Queue(_)) => true,
            IngestionError::Dispatch(DispatchError::StatusStore(StatusStoreError::Request {
                ..
            })) => true,
            IngestionError::Dispatch(DispatchError::Resource(err)) => {
                !matches!(err, ResourceError::InvalidUri { .. })
            }
            IngestionError::Dispatch(_) => false,
            IngestionError::Config(_) => false,
            IngestionError::Serialization(_) => false,
            IngestionError::Cancelled { .. } => true,
            IngestionError::Io(_) => true,
            IngestionError::Generic(_) => false,
        }
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            IngestionError::Upload(_) => 1000,
            IngestionError::Dispatch(_) => 2000,
            _ => 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_codes_are_permanent() {
        let codes = [
            IngestErrorCode::SourceIsNull,
            IngestErrorCode::SourceNotFound,
            IngestErrorCode::SourceNotReadable,
            IngestErrorCode::SourceIsEmpty,
            IngestErrorCode::SourceSizeLimitExceeded,
        ];
        for code in codes {
            assert!(code.is_validation(), "{code} should be a validation code");
            assert!(code.is_permanent(), "{code} should be permanent");
        }
    }

    #[test]
    fn test_service_codes_are_retryable() {
        let codes = [
            IngestErrorCode::UploadFailed,
            IngestErrorCode::NoContainersAvailable,
            IngestErrorCode::ContainerUnavailable,
            IngestErrorCode::NetworkError,
            IngestErrorCode::AuthenticationFailed,
        ];
        for code in codes {
            assert!(code.is_retryable(), "{code} should be retryable");
        }
        assert!(!IngestErrorCode::Unknown.is_retryable());
        assert!(IngestErrorCode::Unknown.is_permanent());
    }

    #[test]
    fn test_storage_error_classification() {
        let cases = vec![
            (
                StorageError::Network {
                    reason: "reset".to_string(),
                },
                IngestErrorCode::NetworkError,
            ),
            (
                StorageError::Transient {
                    status: 503,
                    reason: "busy".to_string(),
                },
                IngestErrorCode::UploadFailed,
            ),
            (
                StorageError::ContainerUnavailable {
                    container: "c1".to_string(),
                    reason: "gone".to_string(),
                },
                IngestErrorCode::ContainerUnavailable,
            ),
            (
                StorageError::Authentication {
                    reason: "expired sas".to_string(),
                },
                IngestErrorCode::AuthenticationFailed,
            ),
            (
                StorageError::Other("boom".into()),
                IngestErrorCode::Unknown,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(IngestErrorCode::from(&error), expected, "for {error}");
        }
    }

    #[test]
    fn test_upload_failure_display_and_cause() {
        let failure = UploadFailure::new("data.csv", IngestErrorCode::UploadFailed, "gave up")
            .with_cause(StorageError::Network {
                reason: "timeout".to_string(),
            });

        assert_eq!(
            failure.to_string(),
            "UPLOAD_FAILED for source 'data.csv': gave up"
        );
        assert!(!failure.is_permanent);
        let cause = std::error::Error::source(&failure).expect("cause is attached");
        assert!(cause.to_string().contains("timeout"));
    }

    #[test]
    fn test_ingestion_error_retryability() {
        let permanent = IngestionError::Upload(UploadFailure::new(
            "empty.csv",
            IngestErrorCode::SourceIsEmpty,
            "no bytes",
        ));
        assert!(!permanent.is_retryable());

        let transient = IngestionError::Upload(UploadFailure::new(
            "data.csv",
            IngestErrorCode::NetworkError,
            "reset",
        ));
        assert!(transient.is_retryable());
        assert_eq!(transient.get_retry_delay_ms(), 1000);

        let duplicate = IngestionError::Dispatch(DispatchError::DuplicateSourceId {
            source_id: Uuid::nil(),
        });
        assert!(!duplicate.is_retryable());

        let unavailable = IngestionError::Resource(ResourceError::ServiceUnavailable {
            reason: "down".to_string(),
        });
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.get_retry_delay_ms(), 5000);
    }

    #[test]
    fn test_error_chain_display() {
        let inner_error = ConfigError::ValidationFailed {
            reason: "upload.max_attempts must be at least 1".to_string(),
        };
        let outer_error = IngestionError::Config(inner_error);

        let error_string = outer_error.to_string();
        assert!(error_string.contains("Configuration error"));
        assert!(error_string.contains("validation failed: upload.max_attempts"));
    }
}
