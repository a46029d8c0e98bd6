pub mod batch;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod errors;
pub mod ingestor;
pub mod queue;
pub mod resources;
pub mod source;
pub mod status;
pub mod storage;
pub mod telemetry;
pub mod upload;

pub use batch::BatchOperationResult;
pub use config::IngestConfig;
pub use dispatch::{BlobSourceInfo, IngestionDispatcher, IngestionProperties};
pub use errors::{IngestErrorCode, IngestionError, UploadFailure};
pub use ingestor::{IngestFailure, IngestionReceipt, IngestorServices, QueuedIngestor};
pub use resources::{ResourceManager, ResourceType};
pub use source::UploadSource;
pub use status::{BlobStatus, IngestionStatus};
pub use upload::{SourceUploader, UploadOutcome, UploadSuccess};
