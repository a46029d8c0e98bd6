use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::StorageError;
use crate::resources::ResourceEntry;

/// Object storage that accepts staged blobs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Uploads `data` as `blob_name` into `container` and returns the blob url.
    ///
    /// `auth_token` is the container's SAS token when it carries one, otherwise
    /// a bearer token from the credential provider, if any.
    async fn upload_blob(
        &self,
        container: &ResourceEntry,
        blob_name: &str,
        data: Bytes,
        auth_token: Option<String>,
    ) -> Result<String, StorageError>;
}
