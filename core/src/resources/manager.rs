use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResourceConfig;
use crate::errors::ResourceError;
use crate::resources::{ResourceCache, ResourceDiscovery, ResourceEntry, ResourceSet, ResourceType};
use crate::telemetry::IngestTelemetry;

/// Keeps the discovered ingestion resources fresh and hands them out round robin.
///
/// Readers get an `Arc<ResourceSet>` snapshot. When the snapshot is older than
/// the configured TTL the next reader refreshes it; concurrent readers wait on
/// that single refresh and share its outcome. If discovery fails while an older
/// snapshot exists, the older snapshot keeps being served, and discovery is
/// not retried until the configured backoff has passed.
pub struct ResourceManager {
    discovery: Arc<dyn ResourceDiscovery>,
    resources: ResourceCache<ResourceSet>,
    identity: ResourceCache<String>,
    refresh_lock: AsyncMutex<()>,
    identity_lock: AsyncMutex<()>,
    /// Bumped by every completed discovery call, successful or not.
    refresh_attempts: AtomicU64,
    last_refresh_error: Mutex<Option<String>>,
    last_failure: Mutex<Option<Instant>>,
    retry_backoff: Duration,
    telemetry: Arc<dyn IngestTelemetry>,
}

impl ResourceManager {
    pub fn new(
        discovery: Arc<dyn ResourceDiscovery>,
        config: &ResourceConfig,
        telemetry: Arc<dyn IngestTelemetry>,
    ) -> Self {
        Self {
            discovery,
            resources: ResourceCache::new(config.refresh_interval()),
            identity: ResourceCache::new(config.refresh_interval()),
            refresh_lock: AsyncMutex::new(()),
            identity_lock: AsyncMutex::new(()),
            refresh_attempts: AtomicU64::new(0),
            last_refresh_error: Mutex::new(None),
            last_failure: Mutex::new(None),
            retry_backoff: config.retry_backoff(),
            telemetry,
        }
    }

    /// Next resource of the given type, refreshing first if the cache is stale.
    pub async fn get_resource(
        &self,
        resource_type: ResourceType,
    ) -> Result<ResourceEntry, ResourceError> {
        let set = self.snapshot().await?;
        set.next(resource_type)
            .ok_or(ResourceError::NoResourcesAvailable { resource_type })
    }

    /// Every resource of the given type in the current snapshot.
    pub async fn get_resources(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<ResourceEntry>, ResourceError> {
        let set = self.snapshot().await?;
        let entries = set.entries(resource_type);
        if entries.is_empty() {
            return Err(ResourceError::NoResourcesAvailable { resource_type });
        }
        Ok(entries.to_vec())
    }

    /// The current snapshot, refreshed if stale.
    pub async fn snapshot(&self) -> Result<Arc<ResourceSet>, ResourceError> {
        if let Some(set) = self.resources.fresh() {
            return Ok(set);
        }
        if let Some(stale) = self.backing_off() {
            return Ok(stale);
        }
        self.refresh_coalesced(false).await
    }

    /// Forces a discovery call regardless of cache age.
    pub async fn refresh(&self) -> Result<(), ResourceError> {
        self.refresh_coalesced(true).await.map(|_| ())
    }

    /// The identity token placed in every ingestion message.
    pub async fn identity_token(&self) -> Result<String, ResourceError> {
        if let Some(token) = self.identity.fresh() {
            return Ok(token.as_ref().clone());
        }

        let _guard = self.identity_lock.lock().await;
        if let Some(token) = self.identity.fresh() {
            return Ok(token.as_ref().clone());
        }

        match self.discovery.identity_token().await {
            Ok(token) => {
                debug!("Refreshed ingestion identity token");
                Ok(self.identity.replace(token).as_ref().clone())
            }
            Err(e) => match self.identity.get() {
                Some(stale) => {
                    warn!("Identity token refresh failed, using cached token: {}", e);
                    Ok(stale.as_ref().clone())
                }
                None => Err(ResourceError::ServiceUnavailable {
                    reason: e.to_string(),
                }),
            },
        }
    }

    async fn refresh_coalesced(&self, force: bool) -> Result<Arc<ResourceSet>, ResourceError> {
        let observed = self.refresh_attempts.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        // Someone else ran discovery while we waited for the lock: share their outcome.
        if self.refresh_attempts.load(Ordering::Acquire) != observed {
            return self.resources.get().ok_or_else(|| ResourceError::ServiceUnavailable {
                reason: self.last_error(),
            });
        }
        if !force {
            if let Some(set) = self.resources.fresh().or_else(|| self.backing_off()) {
                return Ok(set);
            }
        }

        let outcome = self.discovery.discover().await;
        self.refresh_attempts.fetch_add(1, Ordering::AcqRel);

        match outcome {
            Ok(rows) => {
                let set = ResourceSet::from_discovered(rows);
                info!(
                    resources = set.len(),
                    containers = set.entries(ResourceType::TempStorage).len(),
                    queues = set.entries(ResourceType::SecuredReadyForAggregationQueue).len(),
                    "Refreshed ingestion resources"
                );
                self.set_last_error(None);
                *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
                self.telemetry.record_refresh(true);
                Ok(self.resources.replace(set))
            }
            Err(e) => {
                self.set_last_error(Some(e.to_string()));
                *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Instant::now());
                self.telemetry.record_refresh(false);
                match self.resources.get() {
                    Some(stale) => {
                        warn!(
                            fetched_at = %stale.fetched_at(),
                            "Resource refresh failed, serving cached resources: {}", e
                        );
                        Ok(stale)
                    }
                    None => Err(ResourceError::ServiceUnavailable {
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }

    /// The stale snapshot, while a recent failed refresh is still backing off.
    fn backing_off(&self) -> Option<Arc<ResourceSet>> {
        let failed_at = (*self.last_failure.lock().unwrap_or_else(PoisonError::into_inner))?;
        if failed_at.elapsed() < self.retry_backoff {
            self.resources.get()
        } else {
            None
        }
    }

    fn last_error(&self) -> String {
        self.last_refresh_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "resources were never loaded".to_string())
    }

    fn set_last_error(&self, error: Option<String>) {
        *self
            .last_refresh_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }
}
