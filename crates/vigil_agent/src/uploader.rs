//! Upload Worker: drains upload jobs through presign, transfer, confirm.
//!
//! One job per iteration, held under a store lease that is renewed while the
//! transfer runs. Every state change goes through the store; nothing about
//! in-flight work lives only in memory.

use crate::backend::{UploadBackend, UploadError};
use crate::backoff::BackoffPolicy;
use crate::metrics::METRICS;
use crate::watchdog::Heartbeat;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_db::{
    ClaimPolicy, ClaimedUpload, DbError, EventStatus, ReleaseOutcome, UploadJob, VigilDb,
};
use vigil_ids::{EventId, UploadId};
use vigil_protocol::backend::{content_type_for, CompleteRequest, PresignRequest};
use vigil_protocol::checksum::{checksums_match, sha256_file};
use vigil_protocol::AgentConfig;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct UploaderSettings {
    pub device_id: String,
    pub tenant_id: String,
    pub max_attempts: u32,
    pub lease: Duration,
    pub idle_poll: Duration,
}

impl UploaderSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            device_id: config.device.device_id.clone(),
            tenant_id: config.device.tenant_id.clone(),
            max_attempts: config.upload.max_attempts,
            lease: config.upload.lease(),
            idle_poll: config.upload.idle_poll(),
        }
    }
}

/// What happened to the job claimed in one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadReport {
    Completed {
        upload_id: UploadId,
        event_id: EventId,
        final_url: String,
        event_status: EventStatus,
    },
    /// Back to PENDING; eligible again after backoff.
    Retrying {
        upload_id: UploadId,
        attempt: u32,
        error: UploadError,
    },
    Failed {
        upload_id: UploadId,
        attempt: u32,
        error: String,
    },
    /// Shutdown interrupted the attempt; the job is PENDING again.
    Abandoned { upload_id: UploadId, attempt: u32 },
    /// Another worker holds the job now; nothing was written.
    LeaseLost { upload_id: UploadId, attempt: u32 },
}

enum AttemptError {
    Upload(UploadError),
    LeaseLost,
}

/// Store timestamps for one attempt: the claim time plus elapsed wall time.
struct AttemptClock {
    base_ms: i64,
    started: Instant,
}

impl AttemptClock {
    fn new(base_ms: i64) -> Self {
        Self {
            base_ms,
            started: Instant::now(),
        }
    }

    fn now(&self) -> i64 {
        self.base_ms + self.started.elapsed().as_millis() as i64
    }
}

#[derive(Clone)]
pub struct UploadWorker {
    db: VigilDb,
    backend: Arc<dyn UploadBackend>,
    backoff: BackoffPolicy,
    settings: UploaderSettings,
}

impl UploadWorker {
    pub fn new(
        db: VigilDb,
        backend: Arc<dyn UploadBackend>,
        backoff: BackoffPolicy,
        settings: UploaderSettings,
    ) -> Self {
        Self {
            db,
            backend,
            backoff,
            settings,
        }
    }

    fn lease_ms(&self) -> i64 {
        self.settings.lease.as_millis() as i64
    }

    /// Claim and process at most one job.
    ///
    /// Returns `Ok(None)` when no job is eligible at `now`.
    pub async fn run_once(
        &self,
        now: i64,
        beat: &Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<Option<UploadReport>, DbError> {
        let policy = ClaimPolicy {
            lease_ms: self.lease_ms(),
            max_attempts: self.settings.max_attempts,
            schedule: &self.backoff,
        };
        let claim = match self.db.claim_next_upload(&policy, now).await? {
            Some(claim) => claim,
            None => return Ok(None),
        };

        let upload_id = claim.job.id.clone();
        let attempt = claim.attempt();
        info!(
            upload_id = %upload_id,
            event_id = %claim.job.event_id,
            attempt,
            reclaimed = claim.reclaimed,
            "Upload claimed"
        );

        let clock = AttemptClock::new(now);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.process_with_lease(&claim, &clock, beat) => Some(result),
        };

        let report = match outcome {
            None => {
                self.db.abandon_upload(&upload_id, attempt, clock.now()).await?;
                METRICS.inc_uploads_abandoned();
                info!(upload_id = %upload_id, attempt, "Upload abandoned on shutdown");
                UploadReport::Abandoned { upload_id, attempt }
            }
            Some(Ok(final_url)) => {
                match self
                    .db
                    .complete_upload(&upload_id, &final_url, clock.now())
                    .await
                {
                    Ok(event_status) => {
                        METRICS.inc_uploads_completed();
                        METRICS.add_bytes_uploaded(claim.job.file_size);
                        METRICS.record_upload_time(clock.started);
                        info!(
                            upload_id = %upload_id,
                            event_status = %event_status,
                            final_url = %final_url,
                            "Upload complete"
                        );
                        UploadReport::Completed {
                            upload_id,
                            event_id: claim.job.event_id.clone(),
                            final_url,
                            event_status,
                        }
                    }
                    Err(DbError::InvalidState(msg)) => {
                        warn!(upload_id = %upload_id, reason = %msg, "Upload finished after losing its claim");
                        UploadReport::LeaseLost { upload_id, attempt }
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(Err(AttemptError::LeaseLost)) => {
                warn!(upload_id = %upload_id, attempt, "Lease lost, dropping attempt");
                UploadReport::LeaseLost { upload_id, attempt }
            }
            Some(Err(AttemptError::Upload(err))) if err.is_permanent() => {
                let message = err.to_string();
                if self
                    .db
                    .fail_upload(&upload_id, attempt, &message, clock.now())
                    .await?
                {
                    METRICS.inc_uploads_failed();
                    error!(upload_id = %upload_id, attempt, error = %message, "Upload failed permanently");
                    UploadReport::Failed {
                        upload_id,
                        attempt,
                        error: message,
                    }
                } else {
                    UploadReport::LeaseLost { upload_id, attempt }
                }
            }
            Some(Err(AttemptError::Upload(err))) => {
                let message = err.to_string();
                match self
                    .db
                    .release_upload(
                        &upload_id,
                        attempt,
                        &message,
                        self.settings.max_attempts,
                        clock.now(),
                    )
                    .await?
                {
                    ReleaseOutcome::Retrying => {
                        METRICS.inc_uploads_retried();
                        warn!(
                            upload_id = %upload_id,
                            attempt,
                            max_attempts = self.settings.max_attempts,
                            error = %message,
                            "Upload attempt failed, will retry"
                        );
                        UploadReport::Retrying {
                            upload_id,
                            attempt,
                            error: err,
                        }
                    }
                    ReleaseOutcome::Failed => {
                        METRICS.inc_uploads_failed();
                        error!(
                            upload_id = %upload_id,
                            attempt,
                            error = %message,
                            "Upload attempts exhausted"
                        );
                        UploadReport::Failed {
                            upload_id,
                            attempt,
                            error: message,
                        }
                    }
                    ReleaseOutcome::Stale => UploadReport::LeaseLost { upload_id, attempt },
                }
            }
        };
        Ok(Some(report))
    }

    async fn process_with_lease(
        &self,
        claim: &ClaimedUpload,
        clock: &AttemptClock,
        beat: &Heartbeat,
    ) -> Result<String, AttemptError> {
        let work = beat.keep_alive(self.process(&claim.job));
        tokio::pin!(work);

        let period = (self.settings.lease / 3).max(MIN_RENEW_INTERVAL);
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => return result.map_err(AttemptError::Upload),
                _ = renew.tick() => {
                    let until = clock.now() + self.lease_ms();
                    match self.db.extend_lease(&claim.job.id, claim.attempt(), until).await {
                        Ok(true) => debug!(upload_id = %claim.job.id, until, "Lease renewed"),
                        Ok(false) => return Err(AttemptError::LeaseLost),
                        Err(e) => {
                            METRICS.inc_store_errors();
                            warn!(upload_id = %claim.job.id, error = %e, "Lease renewal failed");
                        }
                    }
                }
            }
        }
    }

    /// The three round trips, using the checksum recorded at creation.
    async fn process(&self, job: &UploadJob) -> Result<String, UploadError> {
        let path = job.filepath.clone();
        let (digest, size) = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| UploadError::transient(format!("hash task failed: {}", e)))?
            .map_err(|e| {
                UploadError::permanent(format!("cannot read {}: {}", job.filepath.display(), e))
            })?;
        if !checksums_match(&digest, &job.checksum) || size != job.file_size {
            return Err(UploadError::permanent(format!(
                "{} changed since capture (checksum {} != {})",
                job.filepath.display(),
                digest,
                job.checksum
            )));
        }

        let metadata = match self.db.get_event(&job.event_id).await {
            Ok(event) => event.map(|e| e.payload),
            Err(e) => return Err(UploadError::transient(format!("event lookup: {}", e))),
        };

        let filename = job
            .filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.id.to_string());

        let target = self
            .backend
            .presign(&PresignRequest {
                tenant_id: self.settings.tenant_id.clone(),
                device_id: self.settings.device_id.clone(),
                event_id: job.event_id.clone(),
                upload_id: job.id.clone(),
                content_type: content_type_for(&filename).to_string(),
                filename,
                size_bytes: job.file_size,
                checksum: job.checksum.clone(),
            })
            .await?;

        self.backend
            .transfer(&target, &job.filepath, job.file_size, &job.checksum)
            .await?;

        let confirmed = self
            .backend
            .confirm(&CompleteRequest {
                upload_id: job.id.clone(),
                event_id: job.event_id.clone(),
                checksum: job.checksum.clone(),
                size_bytes: job.file_size,
                final_url: target.final_url.clone(),
                metadata,
            })
            .await?;
        Ok(confirmed.final_url)
    }

    pub async fn run(self, beat: Heartbeat, cancel: CancellationToken) {
        info!(
            max_attempts = self.settings.max_attempts,
            lease_secs = self.settings.lease.as_secs(),
            "Upload worker started"
        );
        loop {
            beat.beat();
            if cancel.is_cancelled() {
                break;
            }
            let idle = match self.run_once(VigilDb::now_millis(), &beat, &cancel).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    METRICS.inc_store_errors();
                    error!(error = %e, "Upload iteration failed, retrying next poll");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.idle_poll) => {}
                }
            }
        }
        info!("Upload worker stopped");
    }
}
