use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::errors::{DispatchError, StatusStoreError};
use crate::queue::IngestionQueue;
use crate::resources::{ResourceEntry, ResourceManager, ResourceType};
use crate::source::CompressionType;
use crate::status::{BlobStatus, IngestionStatus, StatusStore};
use crate::telemetry::IngestTelemetry;
use crate::upload::UploadSuccess;

/// Which outcomes the service reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    #[default]
    FailuresOnly,
    None,
    FailuresAndSuccesses,
}

impl ReportLevel {
    pub fn code(&self) -> u8 {
        match self {
            ReportLevel::FailuresOnly => 0,
            ReportLevel::None => 1,
            ReportLevel::FailuresAndSuccesses => 2,
        }
    }
}

/// Where the service reports outcomes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMethod {
    #[default]
    Queue,
    Table,
    QueueAndTable,
}

impl ReportMethod {
    pub fn code(&self) -> u8 {
        match self {
            ReportMethod::Queue => 0,
            ReportMethod::Table => 1,
            ReportMethod::QueueAndTable => 2,
        }
    }

    pub fn uses_table(&self) -> bool {
        matches!(self, ReportMethod::Table | ReportMethod::QueueAndTable)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Csv,
    Tsv,
    Psv,
    Txt,
    Json,
    MultiJson,
    Avro,
    Parquet,
    Orc,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Csv => "csv",
            DataFormat::Tsv => "tsv",
            DataFormat::Psv => "psv",
            DataFormat::Txt => "txt",
            DataFormat::Json => "json",
            DataFormat::MultiJson => "multijson",
            DataFormat::Avro => "avro",
            DataFormat::Parquet => "parquet",
            DataFormat::Orc => "orc",
        }
    }

    /// The mapping family a format accepts.
    pub fn mapping_kind(&self) -> MappingKind {
        match self {
            DataFormat::Csv | DataFormat::Tsv | DataFormat::Psv | DataFormat::Txt => MappingKind::Csv,
            DataFormat::Json | DataFormat::MultiJson => MappingKind::Json,
            DataFormat::Avro => MappingKind::Avro,
            DataFormat::Parquet => MappingKind::Parquet,
            DataFormat::Orc => MappingKind::Orc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MappingKind {
    Csv,
    Json,
    Avro,
    Parquet,
    Orc,
}

/// Column mapping for the target table, by name or inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionMapping {
    Reference { kind: MappingKind, name: String },
    /// `columns` is the JSON array of column mappings.
    Inline { kind: MappingKind, columns: String },
}

impl IngestionMapping {
    pub fn kind(&self) -> MappingKind {
        match self {
            IngestionMapping::Reference { kind, .. } | IngestionMapping::Inline { kind, .. } => *kind,
        }
    }
}

/// Where and how a staged blob should be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionProperties {
    pub database: String,
    pub table: String,
    pub format: DataFormat,
    pub mapping: Option<IngestionMapping>,
    /// Falls back to the dispatcher's configured default when unset.
    pub report_level: Option<ReportLevel>,
    pub report_method: Option<ReportMethod>,
    pub flush_immediately: bool,
    pub retain_blob_on_success: bool,
    pub additional_tags: Vec<String>,
    pub ignore_first_record: bool,
}

impl IngestionProperties {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            format: DataFormat::default(),
            mapping: None,
            report_level: None,
            report_method: None,
            flush_immediately: false,
            retain_blob_on_success: true,
            additional_tags: Vec::new(),
            ignore_first_record: false,
        }
    }

    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_mapping(mut self, mapping: IngestionMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_report_level(mut self, level: ReportLevel) -> Self {
        self.report_level = Some(level);
        self
    }

    pub fn with_report_method(mut self, method: ReportMethod) -> Self {
        self.report_method = Some(method);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.additional_tags.push(tag.into());
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let invalid = |reason: String| Err(DispatchError::InvalidProperties { reason });

        if self.database.trim().is_empty() {
            return invalid("database must not be empty".to_string());
        }
        if self.table.trim().is_empty() {
            return invalid("table must not be empty".to_string());
        }
        if let Some(mapping) = &self.mapping {
            let expected = self.format.mapping_kind();
            if mapping.kind() != expected {
                return invalid(format!(
                    "{:?} mapping does not apply to {} data (expected {:?})",
                    mapping.kind(),
                    self.format.as_str(),
                    expected
                ));
            }
        }
        Ok(())
    }
}

/// A blob that is ready to be announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSourceInfo {
    blob_url: String,
    sas_token: Option<String>,
    raw_size: Option<u64>,
    compression: CompressionType,
    source_id: Uuid,
}

impl BlobSourceInfo {
    /// Describes a blob already in storage. Any query string is kept as its SAS token.
    pub fn from_url(url: &str, raw_size: Option<u64>) -> Result<Self, DispatchError> {
        let mut parsed = Url::parse(url).map_err(|e| DispatchError::InvalidSource {
            reason: format!("'{url}' is not a valid blob url: {e}"),
        })?;
        if parsed.path().trim_matches('/').is_empty() {
            return Err(DispatchError::InvalidSource {
                reason: format!("'{url}' does not name a blob"),
            });
        }

        let sas_token = parsed
            .query()
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        parsed.set_query(None);
        let compression = CompressionType::from_file_name(parsed.path());

        Ok(Self {
            blob_url: parsed.to_string(),
            sas_token,
            raw_size,
            compression,
            source_id: Uuid::new_v4(),
        })
    }

    pub fn from_upload(upload: &UploadSuccess) -> Self {
        Self {
            blob_url: upload.blob_url.clone(),
            sas_token: upload.sas_token.clone(),
            raw_size: Some(upload.size_bytes),
            compression: upload.compression,
            source_id: Uuid::new_v4(),
        }
    }

    /// Uses a caller-chosen id instead of a generated one.
    pub fn with_source_id(mut self, source_id: Uuid) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn source_id(&self) -> Uuid {
        self.source_id
    }

    pub fn blob_url(&self) -> &str {
        &self.blob_url
    }

    pub fn raw_size(&self) -> Option<u64> {
        self.raw_size
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn authorized_url(&self) -> String {
        match &self.sas_token {
            Some(sas) => format!("{}?{}", self.blob_url, sas),
            None => self.blob_url.clone(),
        }
    }
}

/// The message posted to the ingestion queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IngestionMessage {
    pub id: Uuid,
    pub blob_path: String,
    pub raw_data_size: u64,
    pub database_name: String,
    pub table_name: String,
    pub retain_blob_on_success: bool,
    pub flush_immediately: bool,
    pub report_level: u8,
    pub report_method: u8,
    pub source_message_creation_time: DateTime<Utc>,
    pub additional_properties: AdditionalProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_status_in_table: Option<StatusTableRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalProperties {
    pub authorization_context: String,
    pub format: DataFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_mapping_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_mapping: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_mapping_type: Option<MappingKind>,
    pub compression: CompressionType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub ignore_first_record: bool,
}

/// Status-table coordinates of the Queued row written for a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusTableRef {
    pub table_connection_string: String,
    pub partition_key: String,
    pub row_key: String,
}

impl IngestionMessage {
    fn new(
        source: &BlobSourceInfo,
        properties: &IngestionProperties,
        level: ReportLevel,
        method: ReportMethod,
        identity_token: String,
        status_table: Option<&ResourceEntry>,
    ) -> Self {
        let (mapping_reference, inline_mapping) = match &properties.mapping {
            Some(IngestionMapping::Reference { name, .. }) => (Some(name.clone()), None),
            Some(IngestionMapping::Inline { columns, .. }) => (None, Some(columns.clone())),
            None => (None, None),
        };
        let key = source.source_id.to_string();

        Self {
            id: source.source_id,
            blob_path: source.authorized_url(),
            raw_data_size: source.raw_size.unwrap_or(0),
            database_name: properties.database.clone(),
            table_name: properties.table.clone(),
            retain_blob_on_success: properties.retain_blob_on_success,
            flush_immediately: properties.flush_immediately,
            report_level: level.code(),
            report_method: method.code(),
            source_message_creation_time: Utc::now(),
            additional_properties: AdditionalProperties {
                authorization_context: identity_token,
                format: properties.format,
                ingestion_mapping_reference: mapping_reference,
                ingestion_mapping: inline_mapping,
                ingestion_mapping_type: properties.mapping.as_ref().map(IngestionMapping::kind),
                compression: source.compression,
                tags: properties.additional_tags.clone(),
                ignore_first_record: properties.ignore_first_record,
            },
            ingestion_status_in_table: status_table.map(|table| StatusTableRef {
                table_connection_string: table.authorized_uri(),
                partition_key: key.clone(),
                row_key: key,
            }),
        }
    }
}

type IssuedIds = LruCache<Uuid, Option<ResourceEntry>>;

fn lock_issued(issued: &Mutex<IssuedIds>) -> MutexGuard<'_, IssuedIds> {
    issued.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A source id reserved while its dispatch is in flight.
///
/// Dropping the claim without `keep` releases the id, so a dispatch that is
/// abandoned mid-flight can be retried with the same id.
struct IdClaim<'a> {
    issued: &'a Mutex<IssuedIds>,
    source_id: Uuid,
    kept: bool,
}

impl<'a> IdClaim<'a> {
    fn take(issued: &'a Mutex<IssuedIds>, source_id: Uuid) -> Result<Self, DispatchError> {
        let mut ids = lock_issued(issued);
        if ids.contains(&source_id) {
            return Err(DispatchError::DuplicateSourceId { source_id });
        }
        ids.put(source_id, None);
        Ok(Self {
            issued,
            source_id,
            kept: false,
        })
    }

    fn keep(mut self, status_table: Option<ResourceEntry>) {
        lock_issued(self.issued).put(self.source_id, status_table);
        self.kept = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            lock_issued(self.issued).pop(&self.source_id);
        }
    }
}

/// Announces staged blobs on the ingestion queues.
///
/// Duplicate source ids are caught for the most recent
/// `tracked_source_ids` dispatches; older ones are caught by the status
/// store when table reporting is on.
pub struct IngestionDispatcher {
    resources: Arc<ResourceManager>,
    queue: Arc<dyn IngestionQueue>,
    status_store: Option<Arc<dyn StatusStore>>,
    defaults: DispatchConfig,
    /// Recently dispatched source ids, with the status table their row lives in.
    issued: Mutex<IssuedIds>,
    telemetry: Arc<dyn IngestTelemetry>,
}

impl IngestionDispatcher {
    pub fn new(
        resources: Arc<ResourceManager>,
        queue: Arc<dyn IngestionQueue>,
        defaults: DispatchConfig,
        telemetry: Arc<dyn IngestTelemetry>,
    ) -> Self {
        let capacity = NonZeroUsize::new(defaults.tracked_source_ids).unwrap_or(NonZeroUsize::MIN);
        Self {
            resources,
            queue,
            status_store: None,
            defaults,
            issued: Mutex::new(LruCache::new(capacity)),
            telemetry,
        }
    }

    pub fn with_status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    /// Posts an ingestion message for `source` and returns its source id.
    ///
    /// With table reporting the Queued row is written before the message is
    /// posted, so a status lookup right after this returns never misses it.
    pub async fn dispatch(
        &self,
        source: &BlobSourceInfo,
        properties: &IngestionProperties,
    ) -> Result<Uuid, DispatchError> {
        properties.validate()?;
        let level = properties.report_level.unwrap_or(self.defaults.report_level);
        let method = properties.report_method.unwrap_or(self.defaults.report_method);
        if method.uses_table() && self.status_store.is_none() {
            return Err(DispatchError::InvalidProperties {
                reason: "table reporting requires a status store".to_string(),
            });
        }

        let source_id = source.source_id;
        let claim = IdClaim::take(&self.issued, source_id)?;

        let mut status_table = None;
        let result = self
            .send(source, properties, level, method, &mut status_table)
            .await;

        match result {
            Ok(()) => {
                claim.keep(status_table);
                self.telemetry.record_dispatch(true);
                info!(
                    source_id = %source_id,
                    database = %properties.database,
                    table = %properties.table,
                    "Dispatched ingestion message"
                );
                Ok(source_id)
            }
            Err(e) => {
                // The id stays claimed once a status row carries it.
                if status_table.is_some() {
                    claim.keep(status_table);
                }
                self.telemetry.record_dispatch(false);
                warn!(source_id = %source_id, "Dispatch failed: {}", e);
                Err(e)
            }
        }
    }

    async fn send(
        &self,
        source: &BlobSourceInfo,
        properties: &IngestionProperties,
        level: ReportLevel,
        method: ReportMethod,
        status_table: &mut Option<ResourceEntry>,
    ) -> Result<(), DispatchError> {
        let identity_token = self.resources.identity_token().await?;
        let queue = self
            .resources
            .get_resource(ResourceType::SecuredReadyForAggregationQueue)
            .await?;

        let mut row = None;
        if method.uses_table() {
            if let Some(store) = &self.status_store {
                let table = self
                    .resources
                    .get_resource(ResourceType::IngestionsStatusTable)
                    .await?;
                let queued = BlobStatus::queued(
                    source.source_id,
                    &properties.database,
                    &properties.table,
                    source.blob_url(),
                );
                store
                    .insert_status(&table, &queued)
                    .await
                    .map_err(|e| match e {
                        StatusStoreError::AlreadyExists { source_id } => {
                            DispatchError::DuplicateSourceId { source_id }
                        }
                        other => DispatchError::StatusStore(other),
                    })?;
                debug!(source_id = %source.source_id, "Wrote Queued status row");
                *status_table = Some(table);
                row = Some((store, queued));
            }
        }

        let message = IngestionMessage::new(
            source,
            properties,
            level,
            method,
            identity_token,
            status_table.as_ref(),
        );
        let body = serde_json::to_string(&message)?;

        if let Err(e) = self.queue.post_message(&queue, &body).await {
            if let (Some((store, mut status)), Some(table)) = (row, status_table.as_ref()) {
                let marked = status
                    .advance(IngestionStatus::Failed, Some(e.to_string()))
                    .map(|_| status.with_error_code("DISPATCH_FAILED"));
                if let Ok(failed) = marked {
                    if let Err(update_err) = store.update_status(table, &failed).await {
                        warn!(
                            source_id = %source.source_id,
                            "Could not mark status row failed: {}", update_err
                        );
                    }
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Latest status row for a dispatched source, if table reporting was used.
    pub async fn status(&self, source_id: Uuid) -> Result<Option<BlobStatus>, DispatchError> {
        let Some(store) = &self.status_store else {
            return Ok(None);
        };
        let table = lock_issued(&self.issued).peek(&source_id).cloned().flatten();
        match table {
            Some(table) => Ok(store.get_status(&table, source_id).await?),
            None => Ok(None),
        }
    }
}
