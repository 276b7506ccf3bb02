//! Turns finished captures into events with upload jobs.
//!
//! Every file is hashed before the store transaction opens, so a job never
//! exists without its checksum. A capture with any unreadable file is
//! rejected whole.

use crate::metrics::METRICS;
use crate::watchdog::Heartbeat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_db::{DbError, InsertOutcome, NewEvent, NewUpload, VigilDb};
use vigil_ids::{EventId, UploadId};
use vigil_protocol::checksum::{dedup_key, sha256_file};

const INBOX_POLL: Duration = Duration::from_secs(2);
const REJECTED_SUFFIX: &str = "rejected";

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("capture has no files")]
    NoFiles,

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid detection: {0}")]
    InvalidDetection(String),

    #[error("store error: {0}")]
    Store(#[from] DbError),
}

impl AggregateError {
    /// Input problems are never retried; store errors are.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, AggregateError::Store(_))
    }
}

/// A detection handed over by the ingestion/inference side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub camera_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub local_clip_path: Option<PathBuf>,
    /// Further files belonging to the same event (snapshots, audio).
    #[serde(default)]
    pub extra_files: Vec<PathBuf>,
    #[serde(default)]
    pub objects: Vec<serde_json::Value>,
    #[serde(default)]
    pub dense_caption: Option<String>,
    #[serde(default)]
    pub audio_text: Option<String>,
    pub confidence: f64,
}

impl Detection {
    pub fn files(&self) -> Vec<PathBuf> {
        self.local_clip_path
            .iter()
            .chain(self.extra_files.iter())
            .cloned()
            .collect()
    }

    pub fn into_capture(self) -> Capture {
        let files = self.files();
        let payload = serde_json::json!({
            "camera_id": self.camera_id,
            "event_type": self.event_type,
            "timestamp": self.timestamp,
            "objects": self.objects,
            "dense_caption": self.dense_caption,
            "audio_text": self.audio_text,
            "confidence": self.confidence,
        });
        Capture {
            event_id: None,
            payload,
            files,
            dedup_parts: None,
        }
    }
}

/// One finished capture: metadata plus local files.
#[derive(Debug, Clone)]
pub struct Capture {
    pub event_id: Option<EventId>,
    pub payload: serde_json::Value,
    pub files: Vec<PathBuf>,
    /// When set, the event is deduplicated on these parts plus the file
    /// checksums; re-submitting the same capture returns the existing event.
    pub dedup_parts: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct Aggregator {
    db: VigilDb,
    device_id: String,
    tenant_id: String,
}

impl Aggregator {
    pub fn new(db: VigilDb, device_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            db,
            device_id: device_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Hash every file, then insert the event and its jobs atomically.
    pub async fn ingest(&self, capture: Capture, now: i64) -> Result<InsertOutcome, AggregateError> {
        if capture.files.is_empty() {
            return Err(AggregateError::NoFiles);
        }

        let mut uploads = Vec::with_capacity(capture.files.len());
        for path in capture.files {
            let hashed = path.clone();
            let (checksum, file_size) = tokio::task::spawn_blocking(move || sha256_file(&hashed))
                .await
                .map_err(|e| AggregateError::Unreadable {
                    path: path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e),
                })?
                .map_err(|source| AggregateError::Unreadable {
                    path: path.clone(),
                    source,
                })?;
            uploads.push(NewUpload {
                id: UploadId::new(),
                filepath: path,
                file_size,
                checksum,
            });
        }

        let dedup = capture.dedup_parts.map(|parts| {
            let mut all: Vec<&str> = parts.iter().map(String::as_str).collect();
            all.extend(uploads.iter().map(|u| u.checksum.as_str()));
            dedup_key(&all)
        });

        let event_id = capture.event_id.unwrap_or_default();
        let mut payload = capture.payload;
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("event_id".into(), event_id.as_str().into());
            fields.insert("device_id".into(), self.device_id.clone().into());
            fields.insert("tenant_id".into(), self.tenant_id.clone().into());
        }

        let file_count = uploads.len();
        let outcome = self
            .db
            .insert_event(
                NewEvent {
                    id: event_id,
                    payload,
                    dedup_key: dedup,
                },
                uploads,
                now,
            )
            .await?;

        match &outcome {
            InsertOutcome::Created(id) => {
                METRICS.inc_events_created();
                info!(event_id = %id, files = file_count, "Event created");
            }
            InsertOutcome::Existing(id) => {
                METRICS.inc_events_deduplicated();
                debug!(event_id = %id, "Duplicate capture, reusing existing event");
            }
        }
        Ok(outcome)
    }

    /// Ingest every `*.json` detection in `inbox`.
    ///
    /// Ingested files are removed. Files that can never be ingested are
    /// renamed with a `.rejected` suffix; files hit by a store error stay for
    /// the next pass.
    pub async fn drain_inbox(&self, inbox: &Path, now: i64) -> Result<usize, DbError> {
        let mut pending = Vec::new();
        let mut entries = match tokio::fs::read_dir(inbox).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                pending.push(path);
            }
        }
        pending.sort();

        let mut ingested = 0;
        for path in pending {
            match self.ingest_detection_file(&path, now).await {
                Ok(_) => {
                    ingested += 1;
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "Failed to remove ingested detection");
                    }
                }
                Err(AggregateError::Store(e)) => return Err(e),
                Err(e) => {
                    METRICS.inc_ingest_rejected();
                    warn!(path = %path.display(), error = %e, "Rejecting detection");
                    let rejected = path.with_extension(format!("json.{}", REJECTED_SUFFIX));
                    if let Err(e) = tokio::fs::rename(&path, &rejected).await {
                        warn!(path = %path.display(), error = %e, "Failed to set detection aside");
                    }
                }
            }
        }
        Ok(ingested)
    }

    async fn ingest_detection_file(
        &self,
        path: &Path,
        now: i64,
    ) -> Result<InsertOutcome, AggregateError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| AggregateError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
        let detection: Detection = serde_json::from_slice(&bytes)
            .map_err(|e| AggregateError::InvalidDetection(e.to_string()))?;
        // The detection file name is the producer's idempotency handle.
        let mut capture = detection.into_capture();
        capture.dedup_parts = path
            .file_name()
            .map(|n| vec![n.to_string_lossy().into_owned()]);
        self.ingest(capture, now).await
    }

    /// Poll the inbox until cancelled.
    pub async fn run(self, inbox: PathBuf, beat: Heartbeat, cancel: CancellationToken) {
        info!(inbox = %inbox.display(), "Aggregator started");
        if let Err(e) = tokio::fs::create_dir_all(&inbox).await {
            warn!(inbox = %inbox.display(), error = %e, "Cannot create inbox");
        }
        loop {
            beat.beat();
            match self.drain_inbox(&inbox, VigilDb::now_millis()).await {
                Ok(0) => {}
                Ok(n) => debug!(count = n, "Detections ingested"),
                Err(e) => {
                    METRICS.inc_store_errors();
                    warn!(error = %e, "Inbox pass failed, retrying next poll");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(INBOX_POLL) => {}
            }
        }
        info!("Aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn detection_json(clip: &Path) -> String {
        serde_json::json!({
            "camera_id": "cam-1",
            "event_type": "person",
            "timestamp": "2024-05-01T12:00:00Z",
            "local_clip_path": clip,
            "confidence": 0.91,
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_ingest_creates_event_with_checksummed_jobs() {
        let tmp = TempDir::new().unwrap();
        let clip = tmp.path().join("clip.mp4");
        std::fs::write(&clip, b"frames").unwrap();
        let db = VigilDb::open_memory().await.unwrap();
        let agg = Aggregator::new(db.clone(), "gw-1", "acme");

        let capture = Capture {
            event_id: Some(EventId::parse("ev-1").unwrap()),
            payload: serde_json::json!({"camera_id": "cam-1"}),
            files: vec![clip.clone()],
            dedup_parts: None,
        };
        let outcome = agg.ingest(capture, 1_000).await.unwrap();
        assert!(outcome.is_created());

        let event = db.get_event(outcome.event_id()).await.unwrap().unwrap();
        assert_eq!(event.payload["device_id"], "gw-1");
        assert_eq!(event.payload["event_id"], "ev-1");

        let jobs = db.uploads_for_event(outcome.event_id()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].file_size, 6);
        assert_eq!(
            jobs[0].checksum,
            vigil_protocol::checksum::sha256_hex(b"frames")
        );
    }

    #[tokio::test]
    async fn test_missing_file_rejects_whole_capture() {
        let tmp = TempDir::new().unwrap();
        let present = tmp.path().join("a.mp4");
        std::fs::write(&present, b"a").unwrap();
        let db = VigilDb::open_memory().await.unwrap();
        let agg = Aggregator::new(db.clone(), "gw-1", "acme");

        let err = agg
            .ingest(
                Capture {
                    event_id: None,
                    payload: serde_json::json!({}),
                    files: vec![present, tmp.path().join("missing.mp4")],
                    dedup_parts: None,
                },
                1_000,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::Unreadable { .. }));
        assert!(err.is_rejection());
        assert_eq!(db.queue_stats().await.unwrap().events_pending, 0);
    }

    #[tokio::test]
    async fn test_empty_capture_is_rejected() {
        let db = VigilDb::open_memory().await.unwrap();
        let agg = Aggregator::new(db, "gw-1", "acme");
        let err = agg
            .ingest(
                Capture {
                    event_id: None,
                    payload: serde_json::json!({}),
                    files: vec![],
                    dedup_parts: None,
                },
                1_000,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::NoFiles));
    }

    #[tokio::test]
    async fn test_drain_inbox_ingests_and_sets_aside_bad_files() {
        let tmp = TempDir::new().unwrap();
        let inbox = tmp.path().join("inbox");
        std::fs::create_dir_all(&inbox).unwrap();
        let clip = tmp.path().join("clip.mp4");
        std::fs::write(&clip, b"frames").unwrap();

        std::fs::write(inbox.join("001.json"), detection_json(&clip)).unwrap();
        std::fs::write(inbox.join("002.json"), "{not json").unwrap();
        std::fs::write(inbox.join("notes.txt"), "ignored").unwrap();

        let db = VigilDb::open_memory().await.unwrap();
        let agg = Aggregator::new(db.clone(), "gw-1", "acme");
        assert_eq!(agg.drain_inbox(&inbox, 1_000).await.unwrap(), 1);

        assert!(!inbox.join("001.json").exists());
        assert!(inbox.join("002.json.rejected").exists());
        assert!(inbox.join("notes.txt").exists());
        assert_eq!(db.queue_stats().await.unwrap().events_pending, 1);

        // A producer re-dropping the same file does not duplicate the event.
        std::fs::write(inbox.join("001.json"), detection_json(&clip)).unwrap();
        assert_eq!(agg.drain_inbox(&inbox, 2_000).await.unwrap(), 1);
        assert_eq!(db.queue_stats().await.unwrap().events_pending, 1);
    }

    #[tokio::test]
    async fn test_missing_inbox_is_empty() {
        let tmp = TempDir::new().unwrap();
        let db = VigilDb::open_memory().await.unwrap();
        let agg = Aggregator::new(db, "gw-1", "acme");
        assert_eq!(agg.drain_inbox(&tmp.path().join("nope"), 1).await.unwrap(), 0);
    }
}
