//! Row types for every table in the store.
//!
//! Timestamps are Unix milliseconds.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use vigil_ids::{EventId, UploadId};

// ============================================================================
// Events
// ============================================================================

/// Lifecycle of an event. Forward-only apart from an explicit operator retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    PendingUpload,
    Uploaded,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingUpload => "PENDING_UPLOAD",
            Self::Uploaded => "UPLOADED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING_UPLOAD" => Some(Self::PendingUpload),
            "UPLOADED" => Some(Self::Uploaded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Uploaded | Self::Failed)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    /// Natural key for idempotent creation (e.g. a clip request).
    pub dedup_key: Option<String>,
    /// Last terminal status announced on the alert path.
    pub alerted_status: Option<EventStatus>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Event to insert together with its uploads.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: EventId,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
}

/// Result of [`crate::VigilDb::insert_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(EventId),
    /// An event with the same dedup key already exists.
    Existing(EventId),
}

impl InsertOutcome {
    pub fn event_id(&self) -> &EventId {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

// ============================================================================
// Upload jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Pending,
    Processing,
    Failed,
    Complete,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Failed => "FAILED",
            Self::Complete => "COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "FAILED" => Some(Self::Failed),
            "COMPLETE" => Some(Self::Complete),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Complete)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: UploadId,
    pub event_id: EventId,
    pub filepath: PathBuf,
    pub file_size: u64,
    /// Hex sha256 recorded at creation. Never rewritten.
    pub checksum: String,
    pub attempts: u32,
    pub last_attempt_at: Option<i64>,
    pub lease_expires_at: Option<i64>,
    pub status: UploadStatus,
    pub final_url: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Upload to insert alongside a [`NewEvent`].
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub id: UploadId,
    pub filepath: PathBuf,
    pub file_size: u64,
    pub checksum: String,
}

/// Delay before a job that has failed `attempts` times may be claimed again.
pub trait RetrySchedule: Send + Sync {
    fn delay_ms(&self, upload_id: &UploadId, attempts: u32) -> i64;
}

/// Parameters for [`crate::VigilDb::claim_next_upload`].
pub struct ClaimPolicy<'a> {
    pub lease_ms: i64,
    pub max_attempts: u32,
    pub schedule: &'a dyn RetrySchedule,
}

/// A job held under lease by one worker.
///
/// `job.attempts` is the attempt number of this claim and doubles as the
/// claim token for lease renewal and release.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedUpload {
    pub job: UploadJob,
    /// True when the job was taken over from an expired lease.
    pub reclaimed: bool,
}

impl ClaimedUpload {
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }
}

/// Result of releasing a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back to PENDING, eligible again after backoff.
    Retrying,
    /// Attempt ceiling reached; the job is FAILED.
    Failed,
    /// The claim was no longer held (lease lost to another worker).
    Stale,
}

// ============================================================================
// Knowledge base
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbMeta {
    pub slot: String,
    pub kb_version: String,
    pub checksum: Option<String>,
    pub applied_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    /// Newer package installed.
    Applied,
    /// Already on the advertised version.
    UpToDate,
    /// Package failed verification; previous version kept.
    Rejected,
    /// Transport or local I/O failure.
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::UpToDate => "up_to_date",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(Self::Applied),
            "up_to_date" => Some(Self::UpToDate),
            "rejected" => Some(Self::Rejected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub id: i64,
    pub slot: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub outcome: SyncOutcome,
    pub detail: Option<String>,
    pub attempted_at: i64,
}

// ============================================================================
// Device state and stats
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub last_heartbeat_at: i64,
    pub versions: serde_json::Value,
}

/// Row counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub events_pending: u64,
    pub events_uploaded: u64,
    pub events_failed: u64,
    pub uploads_pending: u64,
    pub uploads_processing: u64,
    pub uploads_complete: u64,
    pub uploads_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            UploadStatus::Pending,
            UploadStatus::Processing,
            UploadStatus::Failed,
            UploadStatus::Complete,
        ] {
            assert_eq!(UploadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("pending_upload"), Some(EventStatus::PendingUpload));
        assert_eq!(EventStatus::parse("DONE"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(UploadStatus::Complete.is_terminal());
        assert!(!UploadStatus::Processing.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(!EventStatus::PendingUpload.is_terminal());
    }
}
