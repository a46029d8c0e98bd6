use std::sync::Arc;

use crate::errors::{IngestErrorCode, ResourceError, UploadFailure};
use crate::resources::{ResourceEntry, ResourceManager, ResourceSet, ResourceType};

/// The temp-storage containers uploads rotate through.
///
/// Backed by the resource manager, so the container list follows every
/// refresh and the rotation cursor is shared with all other uploads.
pub struct UploadContainerPool {
    resources: Arc<ResourceManager>,
}

/// The containers one source tries, in order, starting from its own slot in
/// the shared rotation.
///
/// Walking a fixed snapshot means consecutive attempts land on distinct
/// containers no matter how many other uploads take slots meanwhile.
#[derive(Debug, Clone)]
pub struct ContainerRotation {
    snapshot: Arc<ResourceSet>,
    start: usize,
}

impl ContainerRotation {
    /// Container for the zero-based `attempt`, wrapping after the last one.
    pub fn container(&self, attempt: u32) -> &ResourceEntry {
        let containers = self.containers();
        &containers[(self.start + attempt as usize) % containers.len()]
    }

    fn containers(&self) -> &[ResourceEntry] {
        self.snapshot.entries(ResourceType::TempStorage)
    }
}

impl UploadContainerPool {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self { resources }
    }

    /// Claims the next rotation slot for `source_name`.
    pub async fn rotation(&self, source_name: &str) -> Result<ContainerRotation, UploadFailure> {
        let snapshot = self
            .resources
            .snapshot()
            .await
            .map_err(|e| no_containers(source_name, e))?;
        let start = snapshot
            .rotation_start(ResourceType::TempStorage)
            .ok_or_else(|| {
                no_containers(
                    source_name,
                    ResourceError::NoResourcesAvailable {
                        resource_type: ResourceType::TempStorage,
                    },
                )
            })?;
        Ok(ContainerRotation { snapshot, start })
    }

    /// Number of containers in the current rotation.
    pub async fn size(&self) -> Result<usize, ResourceError> {
        self.resources
            .get_resources(ResourceType::TempStorage)
            .await
            .map(|containers| containers.len())
    }
}

fn no_containers(source_name: &str, err: ResourceError) -> UploadFailure {
    let message = match &err {
        ResourceError::NoResourcesAvailable { .. } => "no upload containers available".to_string(),
        other => format!("cannot obtain upload containers: {other}"),
    };
    UploadFailure::new(source_name, IngestErrorCode::NoContainersAvailable, message).with_cause(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::errors::DiscoveryError;
    use crate::resources::{MockResourceDiscovery, RawResource};
    use crate::telemetry::NoopTelemetry;

    fn pool(discovery: MockResourceDiscovery) -> UploadContainerPool {
        let manager = ResourceManager::new(
            Arc::new(discovery),
            &ResourceConfig::default(),
            Arc::new(NoopTelemetry),
        );
        UploadContainerPool::new(Arc::new(manager))
    }

    fn names(rotation: &ContainerRotation, attempts: u32) -> Vec<String> {
        (0..attempts)
            .map(|attempt| rotation.container(attempt).object_name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_each_rotation_starts_one_slot_later() {
        let mut discovery = MockResourceDiscovery::new();
        discovery.expect_discover().returning(|| {
            Ok(vec![
                RawResource::new("TempStorage", "https://a.blob.core.windows.net/c1?sig=1"),
                RawResource::new("TempStorage", "https://b.blob.core.windows.net/c2?sig=2"),
                RawResource::new("TempStorage", "https://c.blob.core.windows.net/c3?sig=3"),
            ])
        });
        let pool = pool(discovery);

        assert_eq!(pool.size().await.unwrap(), 3);
        let first = pool.rotation("x").await.unwrap();
        let second = pool.rotation("y").await.unwrap();
        assert_eq!(names(&first, 4), vec!["c1", "c2", "c3", "c1"]);
        assert_eq!(names(&second, 3), vec!["c2", "c3", "c1"]);
    }

    #[tokio::test]
    async fn test_interleaved_rotations_never_repeat_a_container_early() {
        let mut discovery = MockResourceDiscovery::new();
        discovery.expect_discover().returning(|| {
            Ok(vec![
                RawResource::new("TempStorage", "https://a.blob.core.windows.net/a?sig=1"),
                RawResource::new("TempStorage", "https://b.blob.core.windows.net/b?sig=2"),
            ])
        });
        let pool = pool(discovery);

        let mine = pool.rotation("mine").await.unwrap();
        // Other uploads claim slots between my attempts.
        for i in 0..5 {
            pool.rotation(&format!("other-{i}")).await.unwrap();
        }
        assert_eq!(names(&mine, 2), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_pool_is_no_containers_available() {
        let mut discovery = MockResourceDiscovery::new();
        discovery.expect_discover().returning(|| Ok(Vec::new()));
        let pool = pool(discovery);

        let failure = pool.rotation("data.csv").await.unwrap_err();
        assert_eq!(failure.error_code, IngestErrorCode::NoContainersAvailable);
        assert_eq!(failure.source_name, "data.csv");
        assert!(!failure.is_permanent);
    }

    #[tokio::test]
    async fn test_discovery_outage_is_no_containers_available() {
        let mut discovery = MockResourceDiscovery::new();
        discovery.expect_discover().returning(|| {
            Err(DiscoveryError::Request {
                reason: "503".to_string(),
            })
        });
        let pool = pool(discovery);

        let failure = pool.rotation("data.csv").await.unwrap_err();
        assert_eq!(failure.error_code, IngestErrorCode::NoContainersAvailable);
        assert!(failure.message.contains("unavailable"));
    }
}
