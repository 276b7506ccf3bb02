//! Control Channel: alerts and heartbeats out, commands in.
//!
//! Clip requests are turned into captures and handed to the [`Aggregator`],
//! so requested media reaches the backend through the same upload jobs as
//! everything else.

use crate::aggregator::{Aggregator, Capture};
use crate::metrics::METRICS;
use crate::watchdog::{queue_counts, HealthSnapshot, Heartbeat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_db::{DbError, EventStatus, UploadStatus, VigilDb};
use vigil_protocol::backend::is_safe_component;
use vigil_protocol::{
    AgentConfig, AlertMessage, CommandResponse, ControlCommand, HeartbeatMessage, TlsMaterial,
    Topics,
};

const ALERT_BATCH: u32 = 50;
const DEFAULT_QUERY_LIMIT: u32 = 20;
const MAX_QUERY_LIMIT: u32 = 100;
const INBOUND_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(#[from] DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe plumbing, substituted by a fake in tests.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ControlError>;

    /// Next inbound message; `None` once the transport is closed.
    async fn next_message(&self) -> Option<InboundMessage>;
}

/// MQTT transport over `rumqttc`.
///
/// A background task drives the event loop, which also reconnects. Inbound
/// topics are re-subscribed on every ConnAck.
pub struct MqttTransport {
    client: AsyncClient,
    inbound: Mutex<mpsc::Receiver<InboundMessage>>,
    driver: JoinHandle<()>,
}

impl MqttTransport {
    /// Start the event loop. `tls` switches the connection to TLS, with
    /// client authentication when the material carries a key pair.
    pub fn connect(
        config: &AgentConfig,
        tls: Option<&TlsMaterial>,
        subscriptions: Vec<String>,
    ) -> Result<Self, ControlError> {
        let control = &config.control;
        let mut options = MqttOptions::new(
            config.mqtt_client_id(),
            control.broker_host.clone(),
            control.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(control.keep_alive_secs.max(5)));
        options.set_clean_session(false);
        if let Some(username) = &control.username {
            options.set_credentials(
                username.clone(),
                control.password.clone().unwrap_or_default(),
            );
        }
        if let Some(tls) = tls {
            options.set_transport(broker_tls(tls)?);
        }

        let (client, mut eventloop) = AsyncClient::new(options, INBOUND_CAPACITY);
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let subscriber = client.clone();
        let broker = format!("{}:{}", control.broker_host, control.broker_port);

        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %broker, "Connected to broker");
                        for topic in &subscriptions {
                            if let Err(e) = subscriber.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                                warn!(topic = %topic, error = %e, "Subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(broker = %broker, error = %e, "Broker connection error, reconnecting");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            inbound: Mutex::new(rx),
            driver,
        })
    }
}

fn broker_tls(tls: &TlsMaterial) -> Result<Transport, ControlError> {
    let ca = tls
        .ca_cert
        .clone()
        .ok_or_else(|| ControlError::Transport("broker TLS requires tls.ca_cert".into()))?;
    let client_auth = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    };
    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl ControlTransport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ControlError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))
    }

    async fn next_message(&self) -> Option<InboundMessage> {
        self.inbound.lock().await.recv().await
    }
}

/// Resolves a camera and time range to local media files.
#[async_trait]
pub trait ClipSource: Send + Sync {
    async fn clips_for_range(
        &self,
        camera_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> std::io::Result<Vec<PathBuf>>;
}

/// Clips stored as `<clip_dir>/<camera_id>/*`, matched by modification time.
pub struct DirectoryClipSource {
    clip_dir: PathBuf,
}

impl DirectoryClipSource {
    pub fn new(clip_dir: impl Into<PathBuf>) -> Self {
        Self {
            clip_dir: clip_dir.into(),
        }
    }
}

#[async_trait]
impl ClipSource for DirectoryClipSource {
    async fn clips_for_range(
        &self,
        camera_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> std::io::Result<Vec<PathBuf>> {
        if !is_safe_component(camera_id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid camera id '{}'", camera_id),
            ));
        }
        let dir = self.clip_dir.join(camera_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut clips = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();
            if modified >= from && modified <= to {
                clips.push(entry.path());
            }
        }
        clips.sort();
        Ok(clips)
    }
}

#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub device_id: String,
    pub tenant_id: String,
    pub kb_slot: String,
    pub heartbeat_interval: Duration,
    pub alert_poll: Duration,
}

impl ControlSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            device_id: config.device.device_id.clone(),
            tenant_id: config.device.tenant_id.clone(),
            kb_slot: config.sync.slot.clone(),
            heartbeat_interval: config.control.heartbeat_interval(),
            alert_poll: config.control.alert_poll(),
        }
    }
}

#[derive(Clone)]
pub struct ControlChannel {
    db: VigilDb,
    aggregator: Aggregator,
    transport: Arc<dyn ControlTransport>,
    clips: Arc<dyn ClipSource>,
    topics: Topics,
    settings: ControlSettings,
    sync_trigger: Arc<Notify>,
    health: watch::Receiver<Option<HealthSnapshot>>,
    started: Instant,
}

impl ControlChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: VigilDb,
        aggregator: Aggregator,
        transport: Arc<dyn ControlTransport>,
        clips: Arc<dyn ClipSource>,
        topics: Topics,
        settings: ControlSettings,
        sync_trigger: Arc<Notify>,
        health: watch::Receiver<Option<HealthSnapshot>>,
    ) -> Self {
        Self {
            db,
            aggregator,
            transport,
            clips,
            topics,
            settings,
            sync_trigger,
            health,
            started: Instant::now(),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Execute one inbound command.
    ///
    /// Malformed payloads are logged and dropped (`None`); everything else
    /// gets a response.
    pub async fn handle_command(&self, payload: &[u8], now: i64) -> Option<CommandResponse> {
        METRICS.inc_commands_received();
        let command = match ControlCommand::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                METRICS.inc_commands_rejected();
                warn!(error = %e, bytes = payload.len(), "Dropping malformed command");
                return None;
            }
        };
        info!(action = command.action(), request_id = ?command.request_id(), "Command received");

        let response = match &command {
            ControlCommand::RequestClip {
                request_id,
                camera_id,
                from,
                to,
            } => self.request_clip(&command, request_id, camera_id, *from, *to, now).await,
            ControlCommand::RetryUpload { upload_id, .. } => {
                match self.db.retry_upload(upload_id, now).await {
                    Ok(()) => {
                        info!(upload_id = %upload_id, "Upload re-queued by operator");
                        CommandResponse::ok(
                            &command,
                            Some(serde_json::json!({ "upload_id": upload_id })),
                        )
                    }
                    Err(e) => CommandResponse::error(&command, e.to_string()),
                }
            }
            ControlCommand::SyncNow { .. } => {
                self.sync_trigger.notify_one();
                CommandResponse::ok(&command, None)
            }
            ControlCommand::QueryEvents { status, limit, .. } => {
                self.query_events(&command, status.as_deref(), *limit).await
            }
        };

        if !response.ok {
            METRICS.inc_commands_rejected();
            warn!(
                action = command.action(),
                message = response.message.as_deref().unwrap_or(""),
                "Command failed"
            );
        }
        Some(response)
    }

    async fn request_clip(
        &self,
        command: &ControlCommand,
        request_id: &str,
        camera_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: i64,
    ) -> CommandResponse {
        if from > to {
            return CommandResponse::error(command, "range start is after its end");
        }
        let files = match self.clips.clips_for_range(camera_id, from, to).await {
            Ok(files) => files,
            Err(e) => return CommandResponse::error(command, format!("clip lookup: {}", e)),
        };
        if files.is_empty() {
            return CommandResponse::error(command, "no local media for range");
        }

        let capture = Capture {
            event_id: None,
            payload: serde_json::json!({
                "camera_id": camera_id,
                "event_type": "clip_request",
                "timestamp": from,
                "range": { "from": from, "to": to },
                "request_id": request_id,
            }),
            files,
            dedup_parts: Some(vec![
                camera_id.to_string(),
                from.to_rfc3339(),
                to.to_rfc3339(),
            ]),
        };
        match self.aggregator.ingest(capture, now).await {
            Ok(outcome) => CommandResponse::ok(
                command,
                Some(serde_json::json!({
                    "event_id": outcome.event_id(),
                    "created": outcome.is_created(),
                })),
            ),
            Err(e) => CommandResponse::error(command, e.to_string()),
        }
    }

    async fn query_events(
        &self,
        command: &ControlCommand,
        status: Option<&str>,
        limit: Option<u32>,
    ) -> CommandResponse {
        let status = match status {
            Some(s) => match EventStatus::parse(s) {
                Some(status) => Some(status),
                None => return CommandResponse::error(command, format!("unknown status '{}'", s)),
            },
            None => None,
        };
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT);
        match self.db.list_events(status, limit).await {
            Ok(events) => {
                let rows: Vec<serde_json::Value> = events
                    .into_iter()
                    .map(|e| {
                        serde_json::json!({
                            "event_id": e.id,
                            "status": e.status.as_str(),
                            "created_at": VigilDb::millis_to_datetime(e.created_at),
                            "updated_at": VigilDb::millis_to_datetime(e.updated_at),
                            "payload": e.payload,
                        })
                    })
                    .collect();
                CommandResponse::ok(command, Some(serde_json::Value::Array(rows)))
            }
            Err(e) => CommandResponse::error(command, e.to_string()),
        }
    }

    /// Announce terminal events not yet announced.
    ///
    /// An event is marked alerted only after its publish succeeded, so a
    /// crash in between re-sends rather than loses the alert.
    pub async fn publish_alerts(&self) -> Result<usize, ControlError> {
        let events = self.db.pending_alerts(ALERT_BATCH).await?;
        let mut published = 0;
        for event in events {
            let uploads = self.db.uploads_for_event(&event.id).await?;
            let final_urls = uploads.iter().filter_map(|u| u.final_url.clone()).collect();
            let error = if event.status == EventStatus::Failed {
                uploads
                    .iter()
                    .filter(|u| u.status == UploadStatus::Failed)
                    .find_map(|u| u.last_error.clone())
            } else {
                None
            };

            let alert = AlertMessage {
                device_id: self.settings.device_id.clone(),
                event_id: event.id.clone(),
                status: event.status.as_str().to_string(),
                payload: event.payload.clone(),
                final_urls,
                error,
                created_at: VigilDb::millis_to_datetime(event.created_at),
                updated_at: VigilDb::millis_to_datetime(event.updated_at),
            };
            self.transport
                .publish(&self.topics.alerts, serde_json::to_vec(&alert)?)
                .await?;
            self.db.mark_alerted(&event.id, event.status).await?;
            METRICS.inc_alerts_published();
            info!(event_id = %event.id, status = %event.status, "Alert published");
            published += 1;
        }
        Ok(published)
    }

    /// Refresh the device row and publish a heartbeat.
    pub async fn publish_heartbeat(&self, now: i64) -> Result<HeartbeatMessage, ControlError> {
        let mut versions = BTreeMap::new();
        versions.insert("agent".to_string(), AGENT_VERSION.to_string());
        if let Some(kb) = self.db.kb_current(&self.settings.kb_slot).await? {
            versions.insert("kb".to_string(), kb.kb_version);
        }
        self.db
            .record_heartbeat(&self.settings.device_id, &serde_json::to_value(&versions)?, now)
            .await?;

        let queue = queue_counts(&self.db.queue_stats().await?);
        let health = self.health.borrow().as_ref().map(|s| s.status);
        let message = HeartbeatMessage {
            device_id: self.settings.device_id.clone(),
            tenant_id: self.settings.tenant_id.clone(),
            agent_version: AGENT_VERSION.to_string(),
            versions,
            uptime_secs: self.started.elapsed().as_secs(),
            queue,
            health,
            metrics: METRICS.snapshot().to_map(),
            sent_at: VigilDb::millis_to_datetime(now),
        };
        self.transport
            .publish(&self.topics.heartbeat, serde_json::to_vec(&message)?)
            .await?;
        METRICS.inc_heartbeats_published();
        debug!(uptime_secs = message.uptime_secs, "Heartbeat published");
        Ok(message)
    }

    async fn on_message(&self, message: InboundMessage) {
        if message.topic != self.topics.control {
            debug!(topic = %message.topic, "Ignoring message on unexpected topic");
            return;
        }
        if let Some(response) = self.handle_command(&message.payload, VigilDb::now_millis()).await {
            let published = match serde_json::to_vec(&response) {
                Ok(body) => self.transport.publish(&self.topics.responses, body).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = published {
                warn!(error = %e, "Failed to publish command response");
            }
        }
    }

    pub async fn run(self, beat: Heartbeat, cancel: CancellationToken) {
        info!(
            device_id = %self.settings.device_id,
            control_topic = %self.topics.control,
            "Control channel started"
        );
        let mut heartbeats = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut alerts = tokio::time::interval(self.settings.alert_poll);
        alerts.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut transport_open = true;

        loop {
            beat.beat();
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.transport.next_message(), if transport_open => match message {
                    Some(message) => self.on_message(message).await,
                    None => {
                        error!("Control transport closed, commands disabled");
                        transport_open = false;
                    }
                },
                _ = heartbeats.tick() => {
                    if let Err(e) = self.publish_heartbeat(VigilDb::now_millis()).await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
                _ = alerts.tick() => {
                    if let Err(e) = self.publish_alerts().await {
                        warn!(error = %e, "Alert publishing failed, retrying next poll");
                    }
                }
            }
        }
        info!("Control channel stopped");
    }
}
