use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global subscriber. Later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Counters reported by the pipeline components.
///
/// Passed to each component as `Arc<dyn IngestTelemetry>`; every method
/// defaults to doing nothing.
pub trait IngestTelemetry: Send + Sync {
    fn record_refresh(&self, _succeeded: bool) {}

    fn record_upload_attempt(&self) {}

    fn record_upload(&self, _succeeded: bool, _bytes: u64) {}

    fn record_batch(&self, _size: usize) {}

    fn record_dispatch(&self, _succeeded: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl IngestTelemetry for NoopTelemetry {}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct IngestMetrics {
    pub resource_refreshes: u64,
    pub failed_refreshes: u64,
    pub upload_attempts: u64,
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub bytes_staged: u64,
    pub batches_processed: u64,
    pub dispatched_messages: u64,
    pub failed_dispatches: u64,
}

/// Atomic counters behind `IngestTelemetry`.
#[derive(Debug, Default)]
pub struct CountingTelemetry {
    resource_refreshes: AtomicU64,
    failed_refreshes: AtomicU64,
    upload_attempts: AtomicU64,
    successful_uploads: AtomicU64,
    failed_uploads: AtomicU64,
    bytes_staged: AtomicU64,
    batches_processed: AtomicU64,
    dispatched_messages: AtomicU64,
    failed_dispatches: AtomicU64,
}

impl CountingTelemetry {
    pub fn snapshot(&self) -> IngestMetrics {
        IngestMetrics {
            resource_refreshes: self.resource_refreshes.load(Ordering::Relaxed),
            failed_refreshes: self.failed_refreshes.load(Ordering::Relaxed),
            upload_attempts: self.upload_attempts.load(Ordering::Relaxed),
            successful_uploads: self.successful_uploads.load(Ordering::Relaxed),
            failed_uploads: self.failed_uploads.load(Ordering::Relaxed),
            bytes_staged: self.bytes_staged.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            dispatched_messages: self.dispatched_messages.load(Ordering::Relaxed),
            failed_dispatches: self.failed_dispatches.load(Ordering::Relaxed),
        }
    }
}

impl IngestTelemetry for CountingTelemetry {
    fn record_refresh(&self, succeeded: bool) {
        if succeeded {
            self.resource_refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_refreshes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_upload_attempt(&self) {
        self.upload_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_upload(&self, succeeded: bool, bytes: u64) {
        if succeeded {
            self.successful_uploads.fetch_add(1, Ordering::Relaxed);
            self.bytes_staged.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.failed_uploads.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_batch(&self, _size: usize) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dispatch(&self, succeeded: bool) {
        if succeeded {
            self.dispatched_messages.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_dispatches.fetch_add(1, Ordering::Relaxed);
        }
    }
}
