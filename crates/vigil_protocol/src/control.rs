//! Control-plane messages: alerts and heartbeats out, commands in.
//!
//! All payloads are JSON. Inbound commands are tagged by `action`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vigil_ids::{EventId, UploadId};

/// Per-device topic names under a shared prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub alerts: String,
    pub heartbeat: String,
    pub control: String,
    pub responses: String,
}

impl Topics {
    pub fn for_device(prefix: &str, device_id: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            alerts: format!("{}/{}/alerts", prefix, device_id),
            heartbeat: format!("{}/{}/heartbeat", prefix, device_id),
            control: format!("{}/{}/control", prefix, device_id),
            responses: format!("{}/{}/responses", prefix, device_id),
        }
    }
}

/// Remote command received on the control topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Upload local media for a camera and time range.
    RequestClip {
        request_id: String,
        camera_id: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// Move a FAILED upload back to PENDING.
    RetryUpload {
        #[serde(default)]
        request_id: Option<String>,
        upload_id: UploadId,
    },
    /// Poll the knowledge-base endpoint now instead of waiting for the interval.
    SyncNow {
        #[serde(default)]
        request_id: Option<String>,
    },
    QueryEvents {
        request_id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        limit: Option<u32>,
    },
}

impl ControlCommand {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn action(&self) -> &'static str {
        match self {
            ControlCommand::RequestClip { .. } => "request_clip",
            ControlCommand::RetryUpload { .. } => "retry_upload",
            ControlCommand::SyncNow { .. } => "sync_now",
            ControlCommand::QueryEvents { .. } => "query_events",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ControlCommand::RequestClip { request_id, .. }
            | ControlCommand::QueryEvents { request_id, .. } => Some(request_id),
            ControlCommand::RetryUpload { request_id, .. }
            | ControlCommand::SyncNow { request_id } => request_id.as_deref(),
        }
    }
}

/// Reply published on the responses topic for every handled command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    pub fn ok(command: &ControlCommand, data: Option<serde_json::Value>) -> Self {
        Self {
            action: command.action().to_string(),
            request_id: command.request_id().map(str::to_string),
            ok: true,
            message: None,
            data,
        }
    }

    pub fn error(command: &ControlCommand, message: impl Into<String>) -> Self {
        Self {
            action: command.action().to_string(),
            request_id: command.request_id().map(str::to_string),
            ok: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Terminal outcome announced for an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub device_id: String,
    pub event_id: EventId,
    /// `UPLOADED` or `FAILED`.
    pub status: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub final_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

impl OverallHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Critical => "critical",
        }
    }
}

impl std::fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub events_pending: u64,
    pub events_uploaded: u64,
    pub events_failed: u64,
    pub uploads_pending: u64,
    pub uploads_processing: u64,
    pub uploads_complete: u64,
    pub uploads_failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub device_id: String,
    pub tenant_id: String,
    pub agent_version: String,
    /// Component name to version, e.g. `kb` to the applied package version.
    pub versions: BTreeMap<String, String>,
    pub uptime_secs: u64,
    pub queue: QueueCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<OverallHealth>,
    #[serde(default)]
    pub metrics: BTreeMap<String, u64>,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_for_device() {
        let topics = Topics::for_device("vigil/", "gw-7");
        assert_eq!(topics.alerts, "vigil/gw-7/alerts");
        assert_eq!(topics.control, "vigil/gw-7/control");
        assert_eq!(topics.responses, "vigil/gw-7/responses");
    }

    #[test]
    fn test_parse_request_clip() {
        let cmd = ControlCommand::parse(
            br#"{"action":"request_clip","request_id":"r-1","camera_id":"cam-2",
                 "from":"2024-05-01T10:00:00Z","to":"2024-05-01T10:00:30Z"}"#,
        )
        .unwrap();
        match &cmd {
            ControlCommand::RequestClip { camera_id, from, to, .. } => {
                assert_eq!(camera_id, "cam-2");
                assert_eq!((*to - *from).num_seconds(), 30);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cmd.request_id(), Some("r-1"));
        assert_eq!(cmd.action(), "request_clip");
    }

    #[test]
    fn test_parse_rejects_unknown_and_incomplete() {
        assert!(ControlCommand::parse(br#"{"action":"reboot"}"#).is_err());
        assert!(ControlCommand::parse(br#"{"action":"request_clip","camera_id":"c"}"#).is_err());
        assert!(ControlCommand::parse(b"not json").is_err());
    }

    #[test]
    fn test_sync_now_without_request_id() {
        let cmd = ControlCommand::parse(br#"{"action":"sync_now"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::SyncNow { request_id: None });
        let response = CommandResponse::ok(&cmd, None);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["action"], "sync_now");
        assert!(json.get("request_id").is_none());
    }
}
