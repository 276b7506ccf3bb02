//! Knowledge-base Sync Worker.
//!
//! Layout under the model directory:
//!
//! ```text
//! <model_dir>/
//!   .staging/               downloads in progress, cleared every attempt
//!   versions/<version>/     one installed package per version
//!   active -> versions/<v>  swapped with a rename, never rewritten in place
//! ```
//!
//! The store's `kb_meta` row is only advanced after the `active` link points
//! at a verified package, and the swap is rolled back if that compare-and-set
//! loses.

use crate::backend::http_client;
use crate::metrics::METRICS;
use crate::watchdog::Heartbeat;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_db::{DbError, SyncOutcome, VigilDb};
use vigil_protocol::backend::{is_safe_component, KbManifest};
use vigil_protocol::checksum::{checksums_match, sha256_file};
use vigil_protocol::config::{BackendConfig, TlsMaterial};
use vigil_protocol::{paths, AgentConfig};

pub const ACTIVE_LINK: &str = "active";
pub const VERSIONS_DIR: &str = "versions";

const LIVENESS_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("slot changed to {found:?} while installing")]
    Superseded { found: Option<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] DbError),
}

impl SyncError {
    /// The advertised package itself is unusable.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidManifest(_)
                | SyncError::ChecksumMismatch { .. }
                | SyncError::SizeMismatch { .. }
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    /// Latest package for `slot`, or `None` if the backend has none.
    async fn latest(&self, slot: &str) -> Result<Option<KbManifest>, SyncError>;

    /// Write the package bytes to `dest`; returns the byte count.
    async fn download(&self, manifest: &KbManifest, dest: &Path) -> Result<u64, SyncError>;
}

pub struct HttpKnowledgeBackend {
    client: Client,
    manifest_url: Url,
    device_id: String,
    api_token: Option<String>,
    transfer_timeout: Duration,
}

impl HttpKnowledgeBackend {
    pub fn new(
        config: &BackendConfig,
        device_id: &str,
        tls: Option<&TlsMaterial>,
    ) -> anyhow::Result<Self> {
        let client = http_client(config, tls)?;
        Ok(Self {
            client,
            manifest_url: config.endpoint(&config.kb_manifest_endpoint)?,
            device_id: device_id.to_string(),
            api_token: config.api_token.clone(),
            transfer_timeout: config.transfer_timeout(),
        })
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.get(url);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl KnowledgeBackend for HttpKnowledgeBackend {
    async fn latest(&self, slot: &str) -> Result<Option<KbManifest>, SyncError> {
        let mut url = self.manifest_url.clone();
        url.query_pairs_mut()
            .append_pair("slot", slot)
            .append_pair("device_id", &self.device_id);

        let response = self.get(url).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(SyncError::Backend(format!("manifest request: HTTP {}", status))),
        }
    }

    async fn download(&self, manifest: &KbManifest, dest: &Path) -> Result<u64, SyncError> {
        let url = Url::parse(&manifest.download_url)
            .map_err(|e| SyncError::InvalidManifest(format!("download_url: {}", e)))?;
        let mut response = self
            .get(url)
            .timeout(self.transfer_timeout)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok(written)
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub slot: String,
    pub model_dir: PathBuf,
    pub keep_versions: usize,
    pub poll_interval: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            slot: config.sync.slot.clone(),
            model_dir: config.paths.model_dir.clone(),
            keep_versions: config.sync.keep_versions,
            poll_interval: config.sync.poll_interval(),
        }
    }
}

#[derive(Clone)]
pub struct KbSyncWorker {
    db: VigilDb,
    backend: Arc<dyn KnowledgeBackend>,
    settings: SyncSettings,
    trigger: Arc<Notify>,
}

impl KbSyncWorker {
    pub fn new(
        db: VigilDb,
        backend: Arc<dyn KnowledgeBackend>,
        settings: SyncSettings,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            backend,
            settings,
            trigger,
        }
    }

    fn staging_dir(&self) -> PathBuf {
        paths::kb_staging_dir(&self.settings.model_dir)
    }

    fn versions_dir(&self) -> PathBuf {
        self.settings.model_dir.join(VERSIONS_DIR)
    }

    /// Poll once and install the advertised package if it differs from the
    /// applied one. Poll failures and install attempts go to the sync log.
    ///
    /// Verification failures return `Ok(SyncOutcome::Rejected)`; the previous
    /// package stays active.
    pub async fn sync_once(&self, now: i64) -> Result<SyncOutcome, SyncError> {
        let slot = self.settings.slot.as_str();
        let current = self.db.kb_current(slot).await?;
        let current_version = current.map(|m| m.kb_version);

        let manifest = match self.backend.latest(slot).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                debug!(slot, "No package advertised");
                return Ok(SyncOutcome::UpToDate);
            }
            Err(e) => {
                METRICS.inc_kb_sync_errors();
                self.record(current_version.as_deref(), None, SyncOutcome::Failed, Some(&e), now)
                    .await;
                return Err(e);
            }
        };

        if current_version.as_deref() == Some(manifest.kb_version.as_str()) {
            debug!(slot, version = %manifest.kb_version, "Knowledge base up to date");
            return Ok(SyncOutcome::UpToDate);
        }

        info!(
            slot,
            from = current_version.as_deref().unwrap_or("none"),
            to = %manifest.kb_version,
            "New knowledge-base package advertised"
        );

        let result = self.install(&manifest, current_version.as_deref(), now).await;
        self.clear_staging().await;

        let to = Some(manifest.kb_version.as_str());
        let from = current_version.as_deref();
        match result {
            Ok(()) => {
                METRICS.inc_kb_syncs_applied();
                self.record(from, to, SyncOutcome::Applied, None, now).await;
                info!(slot, version = %manifest.kb_version, "Knowledge base applied");
                Ok(SyncOutcome::Applied)
            }
            Err(SyncError::Superseded { found }) => {
                info!(slot, found = ?found, "Slot changed during install, skipping");
                let e = SyncError::Superseded { found };
                self.record(from, to, SyncOutcome::UpToDate, Some(&e), now)
                    .await;
                Ok(SyncOutcome::UpToDate)
            }
            Err(e) if e.is_rejection() => {
                METRICS.inc_kb_syncs_rejected();
                error!(slot, version = %manifest.kb_version, error = %e, "Package rejected, keeping current version");
                self.record(from, to, SyncOutcome::Rejected, Some(&e), now).await;
                Ok(SyncOutcome::Rejected)
            }
            Err(e) => {
                METRICS.inc_kb_sync_errors();
                warn!(slot, version = %manifest.kb_version, error = %e, "Sync attempt failed");
                self.record(from, to, SyncOutcome::Failed, Some(&e), now).await;
                Err(e)
            }
        }
    }

    async fn record(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        outcome: SyncOutcome,
        error: Option<&SyncError>,
        now: i64,
    ) {
        let detail = error.map(|e| e.to_string());
        if let Err(e) = self
            .db
            .record_sync_attempt(&self.settings.slot, from, to, outcome, detail.as_deref(), now)
            .await
        {
            METRICS.inc_store_errors();
            warn!(error = %e, "Failed to record sync attempt");
        }
    }

    async fn install(
        &self,
        manifest: &KbManifest,
        expected_previous: Option<&str>,
        now: i64,
    ) -> Result<(), SyncError> {
        let version = manifest.kb_version.as_str();
        if !is_safe_component(version) {
            return Err(SyncError::InvalidManifest(format!(
                "unusable version '{}'",
                version
            )));
        }
        if manifest.sha256.trim().is_empty() {
            return Err(SyncError::InvalidManifest("missing sha256".into()));
        }
        let install_name = manifest.install_name();

        let staging = self.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;
        let download = staging.join(format!("{}-{}", version, uuid::Uuid::new_v4()));

        let written = self.backend.download(manifest, &download).await?;
        let (digest, size) = hash_file(&download).await?;
        debug!(version, written, size, "Package downloaded");

        if !checksums_match(&digest, &manifest.sha256) {
            return Err(SyncError::ChecksumMismatch {
                expected: manifest.sha256.clone(),
                actual: digest,
            });
        }
        if let Some(expected) = manifest.size_bytes {
            if expected != size {
                return Err(SyncError::SizeMismatch {
                    expected,
                    actual: size,
                });
            }
        }

        // Another poll may have finished the same work meanwhile.
        let found = self
            .db
            .kb_current(&self.settings.slot)
            .await?
            .map(|m| m.kb_version);
        if found.as_deref() != expected_previous {
            return Err(SyncError::Superseded { found });
        }

        let version_dir = self.place_version(version, &install_name, &download, &digest).await?;
        let previous_target = read_active(&self.settings.model_dir).await;
        point_active(&self.settings.model_dir, &version_dir_link(version)).await?;

        let applied = match self
            .db
            .kb_apply(&self.settings.slot, expected_previous, version, &digest, now)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.restore_active(previous_target.as_deref()).await;
                return Err(e.into());
            }
        };
        if !applied {
            self.restore_active(previous_target.as_deref()).await;
            let found = self
                .db
                .kb_current(&self.settings.slot)
                .await?
                .map(|m| m.kb_version);
            return Err(SyncError::Superseded { found });
        }

        debug!(dir = %version_dir.display(), "Active package switched");
        if let Err(e) = self.prune(version).await {
            warn!(error = %e, "Failed to prune old packages");
        }
        Ok(())
    }

    /// Move a verified download into `versions/<version>/`.
    ///
    /// A directory left by an earlier interrupted attempt is reused when it
    /// holds the same bytes.
    async fn place_version(
        &self,
        version: &str,
        install_name: &str,
        download: &Path,
        digest: &str,
    ) -> Result<PathBuf, SyncError> {
        let versions = self.versions_dir();
        tokio::fs::create_dir_all(&versions).await?;
        let version_dir = versions.join(version);

        if tokio::fs::try_exists(&version_dir).await? {
            let existing = version_dir.join(install_name);
            let reusable = match hash_file(&existing).await {
                Ok((existing_digest, _)) => checksums_match(&existing_digest, digest),
                Err(_) => false,
            };
            if reusable {
                tokio::fs::remove_file(download).await?;
                return Ok(version_dir);
            }
            tokio::fs::remove_dir_all(&version_dir).await?;
        }

        let tmp_dir = versions.join(format!(".{}-{}", version, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&tmp_dir).await?;
        tokio::fs::rename(download, tmp_dir.join(install_name)).await?;
        tokio::fs::rename(&tmp_dir, &version_dir).await?;
        Ok(version_dir)
    }

    async fn restore_active(&self, previous: Option<&Path>) {
        let model_dir = &self.settings.model_dir;
        let result = match previous {
            Some(target) => point_active(model_dir, target).await,
            None => match tokio::fs::remove_file(model_dir.join(ACTIVE_LINK)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to restore previous active package");
        }
    }

    /// Keep the active version plus the newest others, up to `keep_versions`.
    async fn prune(&self, active: &str) -> std::io::Result<()> {
        let mut others: Vec<(SystemTime, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(self.versions_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == active {
                continue;
            }
            if name.starts_with('.') {
                // Leftover of an interrupted install.
                tokio::fs::remove_dir_all(entry.path()).await?;
                continue;
            }
            let modified = entry
                .metadata()
                .await?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            others.push((modified, entry.path()));
        }
        others.sort_by(|a, b| b.cmp(a));

        let keep_others = self.settings.keep_versions.saturating_sub(1);
        for (_, path) in others.into_iter().skip(keep_others) {
            info!(dir = %path.display(), "Pruning old package");
            tokio::fs::remove_dir_all(&path).await?;
        }
        Ok(())
    }

    async fn clear_staging(&self) {
        match tokio::fs::remove_dir_all(self.staging_dir()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(error = %e, "Failed to clear staging directory");
            }
            _ => {}
        }
    }

    pub async fn run(self, beat: Heartbeat, cancel: CancellationToken) {
        info!(
            slot = %self.settings.slot,
            interval_secs = self.settings.poll_interval.as_secs(),
            "Sync worker started"
        );
        self.clear_staging().await;
        let mut next_poll = tokio::time::Instant::now();
        loop {
            beat.beat();
            if tokio::time::Instant::now() >= next_poll {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = beat.keep_alive(self.sync_once(VigilDb::now_millis())) => {
                        if let Err(e) = result {
                            warn!(error = %e, "Sync poll failed, retrying next interval");
                        }
                    }
                }
                next_poll = tokio::time::Instant::now() + self.settings.poll_interval;
            }
            let wait = next_poll
                .saturating_duration_since(tokio::time::Instant::now())
                .min(LIVENESS_TICK);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.trigger.notified() => {
                    info!("Sync requested");
                    next_poll = tokio::time::Instant::now();
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.clear_staging().await;
        info!("Sync worker stopped");
    }
}

async fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

fn version_dir_link(version: &str) -> PathBuf {
    Path::new(VERSIONS_DIR).join(version)
}

/// Version directory the `active` link points at, relative to the model dir.
#[cfg(unix)]
pub async fn read_active(model_dir: &Path) -> Option<PathBuf> {
    tokio::fs::read_link(model_dir.join(ACTIVE_LINK)).await.ok()
}

#[cfg(not(unix))]
pub async fn read_active(model_dir: &Path) -> Option<PathBuf> {
    tokio::fs::read_to_string(model_dir.join(ACTIVE_LINK))
        .await
        .ok()
        .map(|s| PathBuf::from(s.trim()))
}

/// Atomically repoint `active` at `target` (relative to the model dir).
async fn point_active(model_dir: &Path, target: &Path) -> std::io::Result<()> {
    let tmp = model_dir.join(format!(".{}-{}", ACTIVE_LINK, uuid::Uuid::new_v4()));
    #[cfg(unix)]
    tokio::fs::symlink(target, &tmp).await?;
    #[cfg(not(unix))]
    tokio::fs::write(&tmp, target.to_string_lossy().as_bytes()).await?;

    if let Err(e) = tokio::fs::rename(&tmp, model_dir.join(ACTIVE_LINK)).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
