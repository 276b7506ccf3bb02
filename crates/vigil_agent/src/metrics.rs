//! Process-wide counters.
//!
//! Lock-free atomics, embedded in every heartbeat. Counters reset on
//! process restart; durable history lives in the store.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Upload counters
    pub uploads_completed: AtomicU64,
    pub uploads_retried: AtomicU64,
    pub uploads_failed: AtomicU64,
    pub uploads_abandoned: AtomicU64,
    pub bytes_uploaded: AtomicU64,

    // Ingestion
    pub events_created: AtomicU64,
    pub events_deduplicated: AtomicU64,
    pub ingest_rejected: AtomicU64,

    // Knowledge base
    pub kb_syncs_applied: AtomicU64,
    pub kb_syncs_rejected: AtomicU64,
    pub kb_sync_errors: AtomicU64,

    // Control plane
    pub alerts_published: AtomicU64,
    pub heartbeats_published: AtomicU64,
    pub commands_received: AtomicU64,
    pub commands_rejected: AtomicU64,

    // Health
    pub watchdog_restarts: AtomicU64,
    pub store_errors: AtomicU64,

    // Timing (cumulative microseconds for averaging)
    pub upload_time_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            uploads_completed: AtomicU64::new(0),
            uploads_retried: AtomicU64::new(0),
            uploads_failed: AtomicU64::new(0),
            uploads_abandoned: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            events_created: AtomicU64::new(0),
            events_deduplicated: AtomicU64::new(0),
            ingest_rejected: AtomicU64::new(0),
            kb_syncs_applied: AtomicU64::new(0),
            kb_syncs_rejected: AtomicU64::new(0),
            kb_sync_errors: AtomicU64::new(0),
            alerts_published: AtomicU64::new(0),
            heartbeats_published: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            watchdog_restarts: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            upload_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_uploads_completed(&self) {
        self.uploads_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_uploads_retried(&self) {
        self.uploads_retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_uploads_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_uploads_abandoned(&self) {
        self.uploads_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_events_created(&self) {
        self.events_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_events_deduplicated(&self) {
        self.events_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_ingest_rejected(&self) {
        self.ingest_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_kb_syncs_applied(&self) {
        self.kb_syncs_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_kb_syncs_rejected(&self) {
        self.kb_syncs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_kb_sync_errors(&self) {
        self.kb_sync_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_alerts_published(&self) {
        self.alerts_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_heartbeats_published(&self) {
        self.heartbeats_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_commands_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_commands_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_watchdog_restarts(&self) {
        self.watchdog_restarts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_store_errors(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the wall time of one successful upload
    #[inline]
    pub fn record_upload_time(&self, start: Instant) {
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.upload_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
            uploads_retried: self.uploads_retried.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            uploads_abandoned: self.uploads_abandoned.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            events_created: self.events_created.load(Ordering::Relaxed),
            events_deduplicated: self.events_deduplicated.load(Ordering::Relaxed),
            ingest_rejected: self.ingest_rejected.load(Ordering::Relaxed),
            kb_syncs_applied: self.kb_syncs_applied.load(Ordering::Relaxed),
            kb_syncs_rejected: self.kb_syncs_rejected.load(Ordering::Relaxed),
            kb_sync_errors: self.kb_sync_errors.load(Ordering::Relaxed),
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            heartbeats_published: self.heartbeats_published.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            watchdog_restarts: self.watchdog_restarts.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            upload_time_us: self.upload_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub uploads_completed: u64,
    pub uploads_retried: u64,
    pub uploads_failed: u64,
    pub uploads_abandoned: u64,
    pub bytes_uploaded: u64,
    pub events_created: u64,
    pub events_deduplicated: u64,
    pub ingest_rejected: u64,
    pub kb_syncs_applied: u64,
    pub kb_syncs_rejected: u64,
    pub kb_sync_errors: u64,
    pub alerts_published: u64,
    pub heartbeats_published: u64,
    pub commands_received: u64,
    pub commands_rejected: u64,
    pub watchdog_restarts: u64,
    pub store_errors: u64,
    pub upload_time_us: u64,
}

impl MetricsSnapshot {
    /// Average successful upload time in milliseconds
    pub fn avg_upload_time_ms(&self) -> f64 {
        if self.uploads_completed == 0 {
            0.0
        } else {
            (self.upload_time_us as f64 / self.uploads_completed as f64) / 1000.0
        }
    }

    /// Flat name/value map for heartbeat payloads.
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) {
            for (name, value) in fields {
                if let Some(v) = value.as_u64() {
                    map.insert(name, v);
                }
            }
        }
        map
    }
}
