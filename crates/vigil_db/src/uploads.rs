//! Upload job queue: lease-based claims and status transitions.
//!
//! Every transition is a guarded UPDATE on `(id, status, attempts)`, so a
//! worker that lost its lease cannot overwrite the new holder's state.
//! Write transactions always start with their UPDATE to take SQLite's write
//! lock up front.

use crate::error::{DbError, Result};
use crate::events::{derive_event_status, parse_event_id};
use crate::types::*;
use crate::VigilDb;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::path::PathBuf;
use tracing::{debug, warn};
use vigil_ids::{EventId, UploadId};

/// Candidates fetched per page while looking for a claimable job.
const CLAIM_PAGE_SIZE: i64 = 256;

/// Keyset position in claim order: `(COALESCE(last_attempt_at, 0), created_at, id)`.
type ClaimCursor = (i64, i64, String);

impl VigilDb {
    /// Claim the next eligible job under a lease.
    ///
    /// Eligible: PENDING jobs whose backoff window has elapsed, and PROCESSING
    /// jobs whose lease expired. Jobs already at `max_attempts` are failed
    /// instead of claimed. Returns `None` when nothing is eligible.
    ///
    /// Backoff delays come from the caller's schedule, so eligibility is
    /// decided here rather than in SQL; candidates are paged in claim order
    /// until one is taken or the queue is exhausted.
    pub async fn claim_next_upload(
        &self,
        policy: &ClaimPolicy<'_>,
        now: i64,
    ) -> Result<Option<ClaimedUpload>> {
        self.fail_exhausted(policy.max_attempts, now).await?;

        let mut cursor: ClaimCursor = (i64::MIN, i64::MIN, String::new());
        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, status, attempts, last_attempt_at, created_at FROM upload_jobs
                WHERE (status = 'PENDING'
                       OR (status = 'PROCESSING' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?))
                  AND (COALESCE(last_attempt_at, 0), created_at, id) > (?, ?, ?)
                ORDER BY COALESCE(last_attempt_at, 0) ASC, created_at ASC, id
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(cursor.0)
            .bind(cursor.1)
            .bind(cursor.2.as_str())
            .bind(CLAIM_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await?;

            let exhausted = (rows.len() as i64) < CLAIM_PAGE_SIZE;
            for row in rows {
                let raw_id: String = row.try_get("id")?;
                let last_attempt_at: Option<i64> = row.try_get("last_attempt_at")?;
                let created_at: i64 = row.try_get("created_at")?;
                cursor = (last_attempt_at.unwrap_or(0), created_at, raw_id.clone());

                if let Some(claimed) = self
                    .try_claim(&row, &raw_id, last_attempt_at, policy, now)
                    .await?
                {
                    return Ok(Some(claimed));
                }
            }
            if exhausted {
                return Ok(None);
            }
        }
    }

    async fn try_claim(
        &self,
        row: &SqliteRow,
        raw_id: &str,
        last_attempt_at: Option<i64>,
        policy: &ClaimPolicy<'_>,
        now: i64,
    ) -> Result<Option<ClaimedUpload>> {
        let id = parse_upload_id(raw_id)?;
        let status = parse_upload_status(&row.try_get::<String, _>("status")?)?;
        let attempts: i64 = row.try_get("attempts")?;
        let reclaimed = status == UploadStatus::Processing;

        if !reclaimed && attempts > 0 {
            let delay = policy.schedule.delay_ms(&id, attempts as u32);
            if last_attempt_at.unwrap_or(0).saturating_add(delay) > now {
                return Ok(None);
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE upload_jobs SET
                status = 'PROCESSING',
                attempts = attempts + 1,
                last_attempt_at = ?,
                lease_expires_at = ?,
                updated_at = ?
            WHERE id = ? AND status = ? AND attempts = ?
              AND (status = 'PENDING' OR lease_expires_at <= ?)
            "#,
        )
        .bind(now)
        .bind(now.saturating_add(policy.lease_ms))
        .bind(now)
        .bind(id.as_str())
        .bind(status.as_str())
        .bind(attempts)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Zero rows: another claimer won this one.
        if result.rows_affected() != 1 {
            return Ok(None);
        }
        let job = self
            .get_upload(&id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("upload {}", id)))?;
        if reclaimed {
            warn!(upload_id = %id, attempt = job.attempts, "Reclaimed upload after lease expiry");
        } else {
            debug!(upload_id = %id, attempt = job.attempts, "Claimed upload");
        }
        Ok(Some(ClaimedUpload { job, reclaimed }))
    }

    /// Fail jobs that have used every attempt and are not actively leased.
    async fn fail_exhausted(&self, max_attempts: u32, now: i64) -> Result<()> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, attempts FROM upload_jobs
            WHERE attempts >= ?
              AND (status = 'PENDING'
                   OR (status = 'PROCESSING' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?))
            "#,
        )
        .bind(max_attempts as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let id: String = row.try_get("id")?;
            let status: String = row.try_get("status")?;
            let attempts: i64 = row.try_get("attempts")?;

            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE upload_jobs SET
                    status = 'FAILED',
                    lease_expires_at = NULL,
                    last_error = COALESCE(last_error, 'attempt ceiling reached'),
                    updated_at = ?
                WHERE id = ? AND status = ? AND attempts = ?
                "#,
            )
            .bind(now)
            .bind(&id)
            .bind(&status)
            .bind(attempts)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }
            if let Some((event_id, _)) = job_owner(&mut *tx, &id).await? {
                derive_event_status(&mut *tx, &event_id, now).await?;
            }
            tx.commit().await?;
            warn!(upload_id = %id, attempts, "Upload failed: attempt ceiling reached");
        }
        Ok(())
    }

    /// Push the lease of a held claim out to `until`.
    ///
    /// Returns false if the claim is no longer held.
    pub async fn extend_lease(&self, id: &UploadId, attempt: u32, until: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs SET lease_expires_at = ?
            WHERE id = ? AND status = 'PROCESSING' AND attempts = ?
            "#,
        )
        .bind(until)
        .bind(id.as_str())
        .bind(attempt as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.require_upload(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Mark a job COMPLETE and re-derive its event.
    ///
    /// Completing an already COMPLETE job is a no-op. Returns the event's
    /// status after the update.
    pub async fn complete_upload(
        &self,
        id: &UploadId,
        final_url: &str,
        now: i64,
    ) -> Result<EventStatus> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs SET
                status = 'COMPLETE',
                final_url = ?,
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(final_url)
        .bind(now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        let (event_id, status) = job_owner(&mut *tx, id.as_str())
            .await?
            .ok_or_else(|| DbError::not_found(format!("upload {}", id)))?;

        if result.rows_affected() == 0 && status != UploadStatus::Complete {
            tx.rollback().await?;
            return Err(DbError::invalid_state(format!(
                "upload {} is {} and cannot complete",
                id, status
            )));
        }

        let event_status = derive_event_status(&mut *tx, &event_id, now).await?;
        tx.commit().await?;
        debug!(upload_id = %id, event_id = %event_id, event_status = %event_status, "Upload complete");
        Ok(event_status)
    }

    /// Give back a failed attempt.
    ///
    /// The job returns to PENDING, or becomes FAILED once `attempt` has
    /// reached `max_attempts`.
    pub async fn release_upload(
        &self,
        id: &UploadId,
        attempt: u32,
        error: &str,
        max_attempts: u32,
        now: i64,
    ) -> Result<ReleaseOutcome> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs SET
                status = CASE WHEN attempts >= ? THEN 'FAILED' ELSE 'PENDING' END,
                lease_expires_at = NULL,
                last_error = ?,
                updated_at = ?
            WHERE id = ? AND status = 'PROCESSING' AND attempts = ?
            "#,
        )
        .bind(max_attempts as i64)
        .bind(error)
        .bind(now)
        .bind(id.as_str())
        .bind(attempt as i64)
        .execute(&mut *tx)
        .await?;

        let owner = job_owner(&mut *tx, id.as_str()).await?;
        let (event_id, status) = match owner {
            Some(owner) => owner,
            None => {
                tx.rollback().await?;
                return Err(DbError::not_found(format!("upload {}", id)));
            }
        };
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ReleaseOutcome::Stale);
        }

        derive_event_status(&mut *tx, &event_id, now).await?;
        tx.commit().await?;

        Ok(if status == UploadStatus::Failed {
            ReleaseOutcome::Failed
        } else {
            ReleaseOutcome::Retrying
        })
    }

    /// Permanently fail a held job regardless of remaining attempts.
    ///
    /// Returns false if the claim is no longer held.
    pub async fn fail_upload(
        &self,
        id: &UploadId,
        attempt: u32,
        error: &str,
        now: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs SET
                status = 'FAILED',
                lease_expires_at = NULL,
                last_error = ?,
                updated_at = ?
            WHERE id = ? AND status = 'PROCESSING' AND attempts = ?
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id.as_str())
        .bind(attempt as i64)
        .execute(&mut *tx)
        .await?;

        let Some((event_id, _)) = job_owner(&mut *tx, id.as_str()).await? else {
            tx.rollback().await?;
            return Err(DbError::not_found(format!("upload {}", id)));
        };
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        derive_event_status(&mut *tx, &event_id, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Return a held job to PENDING without failing it (shutdown path).
    ///
    /// The attempt counter is kept.
    pub async fn abandon_upload(&self, id: &UploadId, attempt: u32, now: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs SET
                status = 'PENDING',
                lease_expires_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'PROCESSING' AND attempts = ?
            "#,
        )
        .bind(now)
        .bind(id.as_str())
        .bind(attempt as i64)
        .execute(&mut *tx)
        .await?;

        let Some((event_id, _)) = job_owner(&mut *tx, id.as_str()).await? else {
            tx.rollback().await?;
            return Err(DbError::not_found(format!("upload {}", id)));
        };
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        derive_event_status(&mut *tx, &event_id, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Operator retry: FAILED back to PENDING with the attempt counter reset.
    ///
    /// The owning event returns to PENDING_UPLOAD and will be announced again
    /// when it next reaches a terminal status.
    pub async fn retry_upload(&self, id: &UploadId, now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs SET
                status = 'PENDING',
                attempts = 0,
                last_attempt_at = NULL,
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'FAILED'
            "#,
        )
        .bind(now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        let Some((event_id, status)) = job_owner(&mut *tx, id.as_str()).await? else {
            tx.rollback().await?;
            return Err(DbError::not_found(format!("upload {}", id)));
        };
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DbError::invalid_state(format!(
                "upload {} is {}, only FAILED uploads can be retried",
                id, status
            )));
        }

        sqlx::query("UPDATE events SET alerted_status = NULL WHERE id = ?")
            .bind(&event_id)
            .execute(&mut *tx)
            .await?;
        derive_event_status(&mut *tx, &event_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_upload(&self, id: &UploadId) -> Result<Option<UploadJob>> {
        let row = sqlx::query("SELECT * FROM upload_jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_upload).transpose()
    }

    pub async fn uploads_for_event(&self, event_id: &EventId) -> Result<Vec<UploadJob>> {
        let rows = sqlx::query("SELECT * FROM upload_jobs WHERE event_id = ? ORDER BY created_at, id")
            .bind(event_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_upload).collect()
    }

    async fn require_upload(&self, id: &UploadId) -> Result<UploadJob> {
        self.get_upload(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("upload {}", id)))
    }
}

/// Owning event id and current status of a job.
async fn job_owner(
    conn: &mut SqliteConnection,
    upload_id: &str,
) -> Result<Option<(String, UploadStatus)>> {
    let row = sqlx::query("SELECT event_id, status FROM upload_jobs WHERE id = ?")
        .bind(upload_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => {
            let event_id: String = row.try_get("event_id")?;
            let status = parse_upload_status(&row.try_get::<String, _>("status")?)?;
            Ok(Some((event_id, status)))
        }
        None => Ok(None),
    }
}

fn parse_upload_id(value: &str) -> Result<UploadId> {
    UploadId::parse(value).map_err(|e| DbError::invalid_state(e.to_string()))
}

fn parse_upload_status(value: &str) -> Result<UploadStatus> {
    UploadStatus::parse(value)
        .ok_or_else(|| DbError::invalid_state(format!("Unknown upload status: {}", value)))
}

fn row_to_upload(row: &SqliteRow) -> Result<UploadJob> {
    let filepath: String = row.try_get("filepath")?;
    Ok(UploadJob {
        id: parse_upload_id(&row.try_get::<String, _>("id")?)?,
        event_id: parse_event_id(&row.try_get::<String, _>("event_id")?)?,
        filepath: PathBuf::from(filepath),
        file_size: row.try_get::<i64, _>("file_size")? as u64,
        checksum: row.try_get("checksum")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_attempt_at: row.try_get("last_attempt_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        status: parse_upload_status(&row.try_get::<String, _>("status")?)?,
        final_url: row.try_get("final_url")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
