pub mod cache;
pub mod manager;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::errors::{DiscoveryError, ResourceError};

pub use cache::ResourceCache;
pub use manager::ResourceManager;

/// The kinds of backing resources the service exposes for queued ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    SecuredReadyForAggregationQueue,
    TempStorage,
    FailedIngestionsQueue,
    SuccessfulIngestionsQueue,
    IngestionsStatusTable,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::SecuredReadyForAggregationQueue,
        ResourceType::TempStorage,
        ResourceType::FailedIngestionsQueue,
        ResourceType::SuccessfulIngestionsQueue,
        ResourceType::IngestionsStatusTable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::SecuredReadyForAggregationQueue => "SecuredReadyForAggregationQueue",
            ResourceType::TempStorage => "TempStorage",
            ResourceType::FailedIngestionsQueue => "FailedIngestionsQueue",
            ResourceType::SuccessfulIngestionsQueue => "SuccessfulIngestionsQueue",
            ResourceType::IngestionsStatusTable => "IngestionsStatusTable",
        }
    }

    fn index(&self) -> usize {
        match self {
            ResourceType::SecuredReadyForAggregationQueue => 0,
            ResourceType::TempStorage => 1,
            ResourceType::FailedIngestionsQueue => 2,
            ResourceType::SuccessfulIngestionsQueue => 3,
            ResourceType::IngestionsStatusTable => 4,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// A single queue, container or table handed out by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    uri: String,
    account_name: String,
    object_name: String,
    sas_token: Option<String>,
}

impl ResourceEntry {
    /// Splits `https://<account>.<service>.<suffix>/<object>?<sas>` into its parts.
    pub fn parse(raw: &str) -> Result<Self, ResourceError> {
        let invalid = |reason: &str| ResourceError::InvalidUri {
            uri: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let account_name = host.split('.').next().unwrap_or_default();
        if account_name.is_empty() {
            return Err(invalid("missing account name"));
        }

        let object_name = url.path().trim_matches('/');
        if object_name.is_empty() {
            return Err(invalid("missing object name"));
        }

        let sas_token = url
            .query()
            .filter(|q| !q.is_empty())
            .map(str::to_string);

        let mut base = url.clone();
        base.set_query(None);
        base.set_fragment(None);

        Ok(Self {
            uri: base.to_string(),
            account_name: account_name.to_string(),
            object_name: object_name.to_string(),
            sas_token,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn sas_token(&self) -> Option<&str> {
        self.sas_token.as_deref()
    }

    /// The resource uri with its embedded SAS token, if any.
    pub fn authorized_uri(&self) -> String {
        match &self.sas_token {
            Some(sas) => format!("{}?{}", self.uri, sas),
            None => self.uri.clone(),
        }
    }

    /// Uri of a blob inside this container.
    pub fn blob_uri(&self, blob_name: &str) -> String {
        format!("{}/{}", self.uri.trim_end_matches('/'), blob_name)
    }
}

/// One row of the discovery response: a resource type name and its storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResource {
    pub resource_type_name: String,
    pub storage_root: String,
}

impl RawResource {
    pub fn new(resource_type_name: impl Into<String>, storage_root: impl Into<String>) -> Self {
        Self {
            resource_type_name: resource_type_name.into(),
            storage_root: storage_root.into(),
        }
    }
}

/// The service call that lists ingestion resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceDiscovery: Send + Sync {
    /// Lists every ingestion resource currently assigned to this client.
    async fn discover(&self) -> Result<Vec<RawResource>, DiscoveryError>;

    /// Fetches the identity token embedded in ingestion messages.
    async fn identity_token(&self) -> Result<String, DiscoveryError>;
}

/// An immutable snapshot of discovered resources.
///
/// Lists are never mutated after construction; only the per-type rotation
/// cursors move. A refresh builds a new set and swaps it in whole.
#[derive(Debug)]
pub struct ResourceSet {
    entries: HashMap<ResourceType, Vec<ResourceEntry>>,
    cursors: [AtomicUsize; 5],
    fetched_at: DateTime<Utc>,
}

impl ResourceSet {
    pub fn new(entries: HashMap<ResourceType, Vec<ResourceEntry>>) -> Self {
        Self {
            entries,
            cursors: Default::default(),
            fetched_at: Utc::now(),
        }
    }

    /// Builds a set from discovery rows, skipping unknown types and unparsable uris.
    pub fn from_discovered(rows: Vec<RawResource>) -> Self {
        let mut entries: HashMap<ResourceType, Vec<ResourceEntry>> = HashMap::new();

        for row in rows {
            let Ok(resource_type) = row.resource_type_name.parse::<ResourceType>() else {
                debug!(resource_type = %row.resource_type_name, "Ignoring unknown resource type");
                continue;
            };

            match ResourceEntry::parse(&row.storage_root) {
                Ok(entry) => entries.entry(resource_type).or_default().push(entry),
                Err(e) => warn!(%resource_type, "Skipping resource: {}", e),
            }
        }

        Self::new(entries)
    }

    pub fn entries(&self, resource_type: ResourceType) -> &[ResourceEntry] {
        self.entries
            .get(&resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Next entry of the given type in round-robin order, wrapping at the end.
    pub fn next(&self, resource_type: ResourceType) -> Option<ResourceEntry> {
        let start = self.rotation_start(resource_type)?;
        Some(self.entries(resource_type)[start].clone())
    }

    /// Claims one rotation slot and returns its index into `entries`.
    pub fn rotation_start(&self, resource_type: ResourceType) -> Option<usize> {
        let len = self.entries(resource_type).len();
        if len == 0 {
            return None;
        }
        let position = self.cursors[resource_type.index()].fetch_add(1, Ordering::Relaxed);
        Some(position % len)
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str) -> String {
        format!("https://acct{name}.blob.core.windows.net/{name}?sv=2024&sig=abc")
    }

    #[test]
    fn test_parse_resource_entry_with_sas() {
        let entry = ResourceEntry::parse(
            "https://ingestacct.blob.core.windows.net/tempcontainer?sv=2024&sig=abc",
        )
        .unwrap();

        assert_eq!(entry.account_name(), "ingestacct");
        assert_eq!(entry.object_name(), "tempcontainer");
        assert_eq!(entry.sas_token(), Some("sv=2024&sig=abc"));
        assert_eq!(
            entry.uri(),
            "https://ingestacct.blob.core.windows.net/tempcontainer"
        );
        assert_eq!(
            entry.authorized_uri(),
            "https://ingestacct.blob.core.windows.net/tempcontainer?sv=2024&sig=abc"
        );
        assert_eq!(
            entry.blob_uri("a.csv"),
            "https://ingestacct.blob.core.windows.net/tempcontainer/a.csv"
        );
    }

    #[test]
    fn test_parse_resource_entry_without_sas() {
        let entry = ResourceEntry::parse("https://acct.queue.core.windows.net/readyforaggregation")
            .unwrap();
        assert_eq!(entry.sas_token(), None);
        assert_eq!(entry.object_name(), "readyforaggregation");
    }

    #[test]
    fn test_parse_resource_entry_rejects_bad_uris() {
        for raw in ["not a uri", "https://acct.blob.core.windows.net/", "https://acct.blob.core.windows.net"] {
            let err = ResourceEntry::parse(raw).unwrap_err();
            assert!(
                matches!(err, ResourceError::InvalidUri { .. }),
                "expected InvalidUri for {raw}"
            );
        }
    }

    #[test]
    fn test_resource_type_from_str() {
        assert_eq!(
            "TempStorage".parse::<ResourceType>(),
            Ok(ResourceType::TempStorage)
        );
        assert_eq!(
            "ingestionsstatustable".parse::<ResourceType>(),
            Ok(ResourceType::IngestionsStatusTable)
        );
        assert!("SomethingElse".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_from_discovered_skips_unknown_and_invalid_rows() {
        let set = ResourceSet::from_discovered(vec![
            RawResource::new("TempStorage", container("a")),
            RawResource::new("TempStorage", "::garbage::"),
            RawResource::new("SecuredReadyForAggregationQueue", container("q")),
            RawResource::new("UnknownThing", container("x")),
        ]);

        assert_eq!(set.entries(ResourceType::TempStorage).len(), 1);
        assert_eq!(
            set.entries(ResourceType::SecuredReadyForAggregationQueue).len(),
            1
        );
        assert!(set.entries(ResourceType::IngestionsStatusTable).is_empty());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_round_robin_cycles_through_every_entry() {
        let set = ResourceSet::from_discovered(vec![
            RawResource::new("TempStorage", container("a")),
            RawResource::new("TempStorage", container("b")),
            RawResource::new("TempStorage", container("c")),
        ]);

        let first_cycle: Vec<String> = (0..3)
            .map(|_| set.next(ResourceType::TempStorage).unwrap().object_name().to_string())
            .collect();
        let second_cycle: Vec<String> = (0..3)
            .map(|_| set.next(ResourceType::TempStorage).unwrap().object_name().to_string())
            .collect();

        assert_eq!(first_cycle, vec!["a", "b", "c"]);
        assert_eq!(first_cycle, second_cycle);
    }

    #[test]
    fn test_cursors_are_independent_per_type() {
        let set = ResourceSet::from_discovered(vec![
            RawResource::new("TempStorage", container("a")),
            RawResource::new("TempStorage", container("b")),
            RawResource::new("SecuredReadyForAggregationQueue", container("q1")),
            RawResource::new("SecuredReadyForAggregationQueue", container("q2")),
        ]);

        assert_eq!(set.next(ResourceType::TempStorage).unwrap().object_name(), "a");
        assert_eq!(
            set.next(ResourceType::SecuredReadyForAggregationQueue)
                .unwrap()
                .object_name(),
            "q1"
        );
        assert_eq!(set.next(ResourceType::TempStorage).unwrap().object_name(), "b");
    }

    #[test]
    fn test_next_on_empty_type_is_none() {
        let set = ResourceSet::new(HashMap::new());
        assert!(set.next(ResourceType::TempStorage).is_none());
        assert!(set.is_empty());
    }
}
