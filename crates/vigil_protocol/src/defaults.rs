//! Canonical default values shared by the agent and its CLI.

pub const DEFAULT_TENANT_ID: &str = "default";
pub const DEFAULT_KB_SLOT: &str = "default";

pub const DEFAULT_PRESIGN_ENDPOINT: &str = "/v1/uploads/presign";
pub const DEFAULT_COMPLETE_ENDPOINT: &str = "/v1/uploads/complete";
pub const DEFAULT_KB_MANIFEST_ENDPOINT: &str = "/v1/kb/manifest";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 900;

pub const DEFAULT_UPLOAD_IDLE_POLL_SECS: u64 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 10;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 3600;
pub const DEFAULT_BACKOFF_JITTER_RATIO: f64 = 0.5;
pub const DEFAULT_LEASE_SECS: u64 = 300;

pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_KEEP_KB_VERSIONS: usize = 2;

pub const DEFAULT_BROKER_HOST: &str = "localhost";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_TOPIC_PREFIX: &str = "vigil";
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_ALERT_POLL_SECS: u64 = 5;
pub const DEFAULT_MQTT_KEEP_ALIVE_SECS: u64 = 30;

pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_STALL_THRESHOLD_SECS: u64 = 120;
pub const DEFAULT_STARTUP_GRACE_SECS: u64 = 60;
