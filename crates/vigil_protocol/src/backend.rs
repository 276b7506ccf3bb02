//! JSON bodies exchanged with the backend upload-intake and knowledge-base APIs.
//!
//! Upload is three round trips: presign, transfer (PUT to the returned
//! target), confirm. The backend deduplicates confirmations by
//! `(upload_id, checksum)`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vigil_ids::{EventId, UploadId};

/// Header carrying the hex sha256 of the transferred body.
pub const CHECKSUM_HEADER: &str = "x-amz-checksum-sha256";
/// Header naming the owning event on every intake call.
pub const EVENT_ID_HEADER: &str = "Event-ID";

/// Error code a confirm response uses to report a checksum mismatch.
pub const CHECKSUM_MISMATCH_CODE: &str = "checksum_mismatch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignRequest {
    pub tenant_id: String,
    pub device_id: String,
    pub event_id: EventId,
    pub upload_id: UploadId,
    pub filename: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub checksum: String,
}

/// Where and how to PUT the file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    pub upload_url: String,
    /// Extra headers the storage layer requires on the PUT.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Storage location the backend expects to finalize, if it tells us up front.
    #[serde(default)]
    pub final_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub upload_id: UploadId,
    pub event_id: EventId,
    pub checksum: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    /// Event payload, forwarded so the backend can index the clip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub final_url: String,
}

/// Error body returned by the intake API on non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    pub fn is_checksum_mismatch(&self) -> bool {
        self.error == CHECKSUM_MISMATCH_CODE
    }
}

/// Latest knowledge-base package advertised by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbManifest {
    pub kb_version: String,
    pub download_url: String,
    /// Hex sha256 of the package bytes.
    pub sha256: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl KbManifest {
    /// File name the package is installed under.
    ///
    /// Falls back to the last URL path segment, then to `package.bin`.
    /// Anything that could escape the version directory is rejected.
    pub fn install_name(&self) -> String {
        let candidate = self
            .file_name
            .clone()
            .or_else(|| {
                url::Url::parse(&self.download_url).ok().and_then(|u| {
                    u.path_segments()
                        .and_then(|mut segs| segs.next_back().map(str::to_string))
                })
            })
            .unwrap_or_default();
        if is_safe_component(&candidate) {
            candidate
        } else {
            "package.bin".to_string()
        }
    }
}

/// True when `name` is a single, non-special path component.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.chars().any(|c| c.is_control())
}

/// Content type sent with a clip, guessed from its extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".mp4") {
        "video/mp4"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}
