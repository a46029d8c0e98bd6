use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::{ReportLevel, ReportMethod};
use crate::errors::{self, ConfigError};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    pub resources: ResourceConfig,
    pub upload: UploadConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// How long discovered resources and the identity token stay fresh.
    pub refresh_interval_secs: u64,
    /// After a failed refresh on a warm cache, stale resources are served
    /// without calling discovery for this long.
    pub retry_backoff_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 3600,
            retry_backoff_secs: 30,
        }
    }
}

impl ResourceConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Containers tried per source before giving up.
    pub max_attempts: u32,
    /// Uploads in flight at once during a batch.
    pub max_concurrency: usize,
    /// Sources are buffered whole, so this is also the per-upload memory cost.
    pub max_source_bytes: u64,
    /// Uncompressed sources up to this size are zstd-compressed while staging.
    pub compress_threshold_bytes: u64,
    pub compression_level: i32,
    /// Ceiling on `max_source_bytes * max_concurrency`.
    pub max_buffered_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_concurrency: 8,
            max_source_bytes: 256 * MIB,
            compress_threshold_bytes: 64 * MIB,
            compression_level: 3,
            max_buffered_bytes: 2 * GIB,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub report_level: ReportLevel,
    pub report_method: ReportMethod,
    /// Most recent source ids remembered for duplicate detection.
    pub tracked_source_ids: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            report_level: ReportLevel::default(),
            report_method: ReportMethod::default(),
            tracked_source_ids: 100_000,
        }
    }
}

impl IngestConfig {
    pub fn parse(yaml: &str) -> errors::Result<Self> {
        let config: IngestConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("INGEST_CONFIG")
            .map_err(|_| anyhow::anyhow!("INGEST_CONFIG environment variable not set"))?;
        let config = Self::parse(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |reason: &str| {
            Err(ConfigError::ValidationFailed {
                reason: reason.to_string(),
            })
        };

        if self.resources.refresh_interval_secs == 0 {
            return fail("resources.refresh_interval_secs must be greater than zero");
        }
        if self.upload.max_attempts == 0 {
            return fail("upload.max_attempts must be at least 1");
        }
        if self.upload.max_concurrency == 0 {
            return fail("upload.max_concurrency must be at least 1");
        }
        if self.upload.max_source_bytes == 0 {
            return fail("upload.max_source_bytes must be greater than zero");
        }
        if self.upload.compress_threshold_bytes > self.upload.max_source_bytes {
            return fail("upload.compress_threshold_bytes cannot exceed upload.max_source_bytes");
        }
        let buffered = self
            .upload
            .max_source_bytes
            .saturating_mul(self.upload.max_concurrency as u64);
        if buffered > self.upload.max_buffered_bytes {
            return fail(
                "upload.max_source_bytes * upload.max_concurrency exceeds upload.max_buffered_bytes",
            );
        }
        if self.dispatch.tracked_source_ids == 0 {
            return fail("dispatch.tracked_source_ids must be at least 1");
        }
        Ok(())
    }
}
