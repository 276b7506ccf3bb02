//! Shared configuration and wire types for the Vigil edge agent.
//!
//! - [`config`]: TOML agent configuration
//! - [`backend`]: upload-intake and knowledge-base JSON bodies
//! - [`control`]: pub/sub alerts, heartbeats and commands

pub mod backend;
pub mod checksum;
pub mod config;
pub mod control;
pub mod defaults;
pub mod paths;

pub use backend::{CompleteRequest, CompleteResponse, KbManifest, PresignRequest, UploadTarget};
pub use config::{AgentConfig, ConfigError, TlsConfig, TlsMaterial};
pub use control::{
    AlertMessage, CommandResponse, ControlCommand, HeartbeatMessage, OverallHealth, QueueCounts,
    Topics,
};
