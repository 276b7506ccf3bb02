//! Vigil edge agent.
//!
//! Keeps a remote backend in step with events and media captured on a
//! device that loses connectivity. Components, each an independent task:
//!
//! - [`aggregator`]: captures into events + upload jobs
//! - [`uploader`]: presign / transfer / confirm with backoff and leases
//! - [`sync`]: knowledge-base packages, verified then swapped in
//! - [`control`]: alerts, heartbeats and remote commands
//! - [`watchdog`]: liveness, health snapshot, per-component restarts
//!
//! They coordinate only through the store in `vigil_db`.

pub mod aggregator;
pub mod backend;
pub mod backoff;
pub mod control;
pub mod metrics;
pub mod supervisor;
pub mod sync;
pub mod uploader;
pub mod watchdog;

pub use aggregator::{AggregateError, Aggregator, Capture, Detection};
pub use backend::{HttpUploadBackend, UploadBackend, UploadError};
pub use backoff::BackoffPolicy;
pub use tokio_util::sync::CancellationToken;
pub use control::{
    ClipSource, ControlChannel, ControlError, ControlSettings, ControlTransport,
    DirectoryClipSource, InboundMessage, MqttTransport,
};
pub use metrics::{MetricsSnapshot, METRICS};
pub use supervisor::{factory, ComponentFactory, Supervisor};
pub use sync::{HttpKnowledgeBackend, KbSyncWorker, KnowledgeBackend, SyncError, SyncSettings};
pub use uploader::{UploadReport, UploadWorker, UploaderSettings};
pub use watchdog::{
    ComponentHealth, ComponentStatus, HealthSnapshot, Heartbeat, Liveness, RestartError,
    RestartHook, Watchdog, WatchdogSettings,
};
