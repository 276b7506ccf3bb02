//! Liveness tracking and aggregated health.
//!
//! Every worker loop holds a [`Heartbeat`] and beats it once per iteration,
//! and through [`Heartbeat::keep_alive`] while a long step is in flight.
//! The [`Watchdog`] turns those beats plus a store ping into a
//! [`HealthSnapshot`], restarts stalled components through a [`RestartHook`],
//! and publishes the latest snapshot. It keeps nothing but that snapshot: after
//! a restart every component starts over in `starting`.

use crate::metrics::METRICS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_db::{QueueStats, VigilDb};
use vigil_protocol::{OverallHealth, QueueCounts};

const NEVER: i64 = 0;

/// Beat period of [`Heartbeat::keep_alive`]; well under any sane stall threshold.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_millis(100);

/// Handle a worker uses to report loop progress.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last_beat: Arc<AtomicI64>,
}

impl Heartbeat {
    pub fn beat(&self) {
        self.beat_at(VigilDb::now_millis());
    }

    pub fn beat_at(&self, now_ms: i64) {
        self.last_beat.store(now_ms, Ordering::Relaxed);
    }

    /// Drive `work` to completion, beating every [`KEEPALIVE_PERIOD`] while
    /// it is pending. For a single await that may outlast the stall
    /// threshold, such as a transfer or a package download.
    pub async fn keep_alive<F: Future>(&self, work: F) -> F::Output {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                output = &mut work => return output,
                _ = ticker.tick() => self.beat(),
            }
        }
    }

    /// Detached handle for code paths run outside the supervisor.
    pub fn detached() -> Self {
        Self {
            last_beat: Arc::new(AtomicI64::new(NEVER)),
        }
    }
}

#[derive(Debug)]
struct Slot {
    last_beat: Arc<AtomicI64>,
    registered_at: i64,
    restarts: u32,
    last_restart_at: Option<i64>,
}

/// Registry of watched components.
#[derive(Debug, Default)]
pub struct Liveness {
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register after a restart) a component.
    ///
    /// Returns a fresh heartbeat; the component counts as `starting` until its
    /// first beat. Restart history survives re-registration.
    pub fn register(&self, name: &str) -> Heartbeat {
        self.register_at(name, VigilDb::now_millis())
    }

    pub fn register_at(&self, name: &str, now_ms: i64) -> Heartbeat {
        let last_beat = Arc::new(AtomicI64::new(NEVER));
        let mut slots = lock(&self.slots);
        let (restarts, last_restart_at) = slots
            .get(name)
            .map(|s| (s.restarts, s.last_restart_at))
            .unwrap_or((0, None));
        slots.insert(
            name.to_string(),
            Slot {
                last_beat: last_beat.clone(),
                registered_at: now_ms,
                restarts,
                last_restart_at,
            },
        );
        Heartbeat { last_beat }
    }

    pub fn component_names(&self) -> Vec<String> {
        lock(&self.slots).keys().cloned().collect()
    }

    fn observe(&self) -> Vec<Observation> {
        lock(&self.slots)
            .iter()
            .map(|(name, slot)| Observation {
                name: name.clone(),
                last_beat: match slot.last_beat.load(Ordering::Relaxed) {
                    NEVER => None,
                    at => Some(at),
                },
                registered_at: slot.registered_at,
                restarts: slot.restarts,
                last_restart_at: slot.last_restart_at,
            })
            .collect()
    }

    fn note_restart(&self, name: &str, now_ms: i64) -> u32 {
        let mut slots = lock(&self.slots);
        match slots.get_mut(name) {
            Some(slot) => {
                slot.restarts += 1;
                slot.last_restart_at = Some(now_ms);
                slot.restarts
            }
            None => 0,
        }
    }
}

// The registry holds plain data; a poisoned lock is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Observation {
    name: String,
    last_beat: Option<i64>,
    registered_at: i64,
    restarts: u32,
    last_restart_at: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("restart failed: {0}")]
    Failed(String),
}

/// Capability to restart a single component.
///
/// The concrete mechanism belongs to the deployment; the binary's
/// [`crate::supervisor::Supervisor`] aborts and respawns a task.
pub trait RestartHook: Send + Sync {
    fn restart(&self, component: &str) -> Result<(), RestartError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Starting,
    Healthy,
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    pub last_beat_at: Option<i64>,
    /// Milliseconds since the last beat (or since registration, if none).
    pub silent_for_ms: i64,
    pub restarts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: OverallHealth,
    pub store_reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub components: Vec<ComponentHealth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueCounts>,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Read a snapshot previously written by a running agent.
    pub fn read_from(path: &Path) -> std::io::Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub fn queue_counts(stats: &QueueStats) -> QueueCounts {
    QueueCounts {
        events_pending: stats.events_pending,
        events_uploaded: stats.events_uploaded,
        events_failed: stats.events_failed,
        uploads_pending: stats.uploads_pending,
        uploads_processing: stats.uploads_processing,
        uploads_complete: stats.uploads_complete,
        uploads_failed: stats.uploads_failed,
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub stall_threshold: Duration,
    pub startup_grace: Duration,
    pub health_file: Option<PathBuf>,
}

pub struct Watchdog {
    db: VigilDb,
    liveness: Arc<Liveness>,
    hook: Arc<dyn RestartHook>,
    settings: WatchdogSettings,
    snapshot_tx: watch::Sender<Option<HealthSnapshot>>,
}

impl Watchdog {
    pub fn new(
        db: VigilDb,
        liveness: Arc<Liveness>,
        hook: Arc<dyn RestartHook>,
        settings: WatchdogSettings,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        Self {
            db,
            liveness,
            hook,
            settings,
            snapshot_tx,
        }
    }

    /// Receiver for the most recent snapshot (`None` until the first check).
    pub fn subscribe(&self) -> watch::Receiver<Option<HealthSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Evaluate health once, restart stalled components, publish the result.
    pub async fn check(&self, now_ms: i64) -> HealthSnapshot {
        let stall_ms = self.settings.stall_threshold.as_millis() as i64;
        let grace_ms = self.settings.startup_grace.as_millis() as i64;

        let (store_reachable, store_error, queue) = match self.db.ping().await {
            Ok(()) => match self.db.queue_stats().await {
                Ok(stats) => (true, None, Some(queue_counts(&stats))),
                Err(e) => (true, Some(e.to_string()), None),
            },
            Err(e) => {
                METRICS.inc_store_errors();
                (false, Some(e.to_string()), None)
            }
        };

        let mut components = Vec::new();
        for obs in self.liveness.observe() {
            let (status, silent_for_ms) = match obs.last_beat {
                Some(at) => {
                    let silent = now_ms.saturating_sub(at);
                    if silent > stall_ms {
                        (ComponentStatus::Stalled, silent)
                    } else {
                        (ComponentStatus::Healthy, silent)
                    }
                }
                None => {
                    let silent = now_ms.saturating_sub(obs.registered_at);
                    if silent <= grace_ms {
                        (ComponentStatus::Starting, silent)
                    } else {
                        (ComponentStatus::Stalled, silent)
                    }
                }
            };

            let mut restarts = obs.restarts;
            if status == ComponentStatus::Stalled {
                let due = obs
                    .last_restart_at
                    .map_or(true, |at| now_ms.saturating_sub(at) >= stall_ms);
                if due {
                    restarts = self.restart(&obs.name, silent_for_ms, now_ms).unwrap_or(restarts);
                }
            }

            components.push(ComponentHealth {
                name: obs.name,
                status,
                last_beat_at: obs.last_beat,
                silent_for_ms,
                restarts,
            });
        }

        let failed_events = queue.as_ref().map_or(0, |q| q.events_failed);
        let status = if !store_reachable {
            OverallHealth::Critical
        } else if failed_events > 0
            || components.iter().any(|c| c.status == ComponentStatus::Stalled)
        {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        let snapshot = HealthSnapshot {
            status,
            store_reachable,
            store_error,
            components,
            queue,
            checked_at: VigilDb::millis_to_datetime(now_ms),
        };

        if let Some(path) = &self.settings.health_file {
            if let Err(e) = write_snapshot(path, &snapshot).await {
                warn!(path = %path.display(), error = %e, "Failed to write health snapshot");
            }
        }
        self.snapshot_tx.send_replace(Some(snapshot.clone()));
        snapshot
    }

    fn restart(&self, name: &str, silent_for_ms: i64, now_ms: i64) -> Option<u32> {
        warn!(component = name, silent_for_ms, "Component stalled, restarting");
        match self.hook.restart(name) {
            Ok(()) => {
                METRICS.inc_watchdog_restarts();
                let restarts = self.liveness.note_restart(name, now_ms);
                info!(component = name, restarts, "Component restarted");
                Some(restarts)
            }
            Err(e) => {
                error!(component = name, error = %e, "Restart failed");
                None
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            stall_threshold_secs = self.settings.stall_threshold.as_secs(),
            "Watchdog started"
        );
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.check(VigilDb::now_millis()).await;
                    debug!(status = %snapshot.status, "Health checked");
                }
            }
        }
        info!("Watchdog stopped");
    }
}

async fn write_snapshot(path: &Path, snapshot: &HealthSnapshot) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHook {
        calls: StdMutex<Vec<String>>,
    }

    impl RestartHook for RecordingHook {
        fn restart(&self, component: &str) -> Result<(), RestartError> {
            self.calls.lock().unwrap().push(component.to_string());
            Ok(())
        }
    }

    fn settings() -> WatchdogSettings {
        WatchdogSettings {
            interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(120),
            startup_grace: Duration::from_secs(60),
            health_file: None,
        }
    }

    #[tokio::test]
    async fn test_components_progress_from_starting_to_stalled() {
        let db = VigilDb::open_memory().await.unwrap();
        let liveness = Arc::new(Liveness::new());
        let hook = Arc::new(RecordingHook::default());
        let watchdog = Watchdog::new(db, liveness.clone(), hook.clone(), settings());

        let t0 = 1_000_000;
        let uploader = liveness.register_at("uploader", t0);
        let _sync = liveness.register_at("sync", t0);

        let snap = watchdog.check(t0 + 1_000).await;
        assert_eq!(snap.status, OverallHealth::Healthy);
        assert_eq!(snap.component("sync").unwrap().status, ComponentStatus::Starting);

        uploader.beat_at(t0 + 30_000);
        let snap = watchdog.check(t0 + 61_000).await;
        assert_eq!(snap.component("uploader").unwrap().status, ComponentStatus::Healthy);
        assert_eq!(snap.component("sync").unwrap().status, ComponentStatus::Stalled);
        assert_eq!(snap.status, OverallHealth::Degraded);
        assert_eq!(*hook.calls.lock().unwrap(), vec!["sync".to_string()]);
        assert_eq!(snap.component("sync").unwrap().restarts, 1);
    }

    #[tokio::test]
    async fn test_restarts_are_rate_limited() {
        let db = VigilDb::open_memory().await.unwrap();
        let liveness = Arc::new(Liveness::new());
        let hook = Arc::new(RecordingHook::default());
        let watchdog = Watchdog::new(db, liveness.clone(), hook.clone(), settings());

        let t0 = 1_000_000;
        let beat = liveness.register_at("control", t0);
        beat.beat_at(t0);

        // The recording hook does not re-register, so the component stays stalled.
        watchdog.check(t0 + 121_000).await;
        watchdog.check(t0 + 131_000).await;
        assert_eq!(hook.calls.lock().unwrap().len(), 1);

        watchdog.check(t0 + 242_000).await;
        assert_eq!(hook.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_is_published_and_written() {
        let tmp = tempfile::TempDir::new().unwrap();
        let health_file = tmp.path().join("health.json");
        let db = VigilDb::open_memory().await.unwrap();
        let liveness = Arc::new(Liveness::new());
        let mut s = settings();
        s.health_file = Some(health_file.clone());
        let watchdog = Watchdog::new(db, liveness, Arc::new(RecordingHook::default()), s);
        let rx = watchdog.subscribe();
        assert!(rx.borrow().is_none());

        let snap = watchdog.check(VigilDb::now_millis()).await;
        assert_eq!(rx.borrow().as_ref().map(|s| s.status), Some(snap.status));

        let on_disk = HealthSnapshot::read_from(&health_file).unwrap().unwrap();
        assert_eq!(on_disk, snap);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_critical() {
        let db = VigilDb::open_memory().await.unwrap();
        let liveness = Arc::new(Liveness::new());
        let watchdog = Watchdog::new(
            db.clone(),
            liveness,
            Arc::new(RecordingHook::default()),
            settings(),
        );
        db.close().await;

        let snap = watchdog.check(VigilDb::now_millis()).await;
        assert!(!snap.store_reachable);
        assert_eq!(snap.status, OverallHealth::Critical);
    }

    #[tokio::test]
    async fn test_keep_alive_beats_while_work_is_pending() {
        let beat = Heartbeat::detached();
        let output = beat
            .keep_alive(async {
                tokio::time::sleep(KEEPALIVE_PERIOD * 3).await;
                42
            })
            .await;
        assert_eq!(output, 42);

        let last = beat.last_beat.load(Ordering::Relaxed);
        assert_ne!(last, NEVER);
        assert!(VigilDb::now_millis() - last < (KEEPALIVE_PERIOD * 2).as_millis() as i64);
    }

    #[test]
    fn test_missing_health_file_reads_as_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(HealthSnapshot::read_from(&tmp.path().join("absent.json"))
            .unwrap()
            .is_none());
    }
}
