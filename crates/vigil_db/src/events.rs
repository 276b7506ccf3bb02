//! Event operations: atomic creation, status derivation, alert outbox.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::VigilDb;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;
use vigil_ids::EventId;

impl VigilDb {
    /// Insert an event and all of its uploads in one transaction.
    ///
    /// An event whose `dedup_key` already exists is not inserted again; the
    /// existing id is returned instead.
    pub async fn insert_event(
        &self,
        event: NewEvent,
        uploads: Vec<NewUpload>,
        now: i64,
    ) -> Result<InsertOutcome> {
        if uploads.is_empty() {
            return Err(DbError::constraint(format!(
                "event {} has no uploads",
                event.id
            )));
        }
        if let Some(upload) = uploads.iter().find(|u| u.checksum.trim().is_empty()) {
            return Err(DbError::constraint(format!(
                "upload {} has no checksum",
                upload.id
            )));
        }

        if let Some(key) = event.dedup_key.as_deref() {
            if let Some(existing) = self.event_id_by_dedup_key(key).await? {
                return Ok(InsertOutcome::Existing(existing));
            }
        }

        let payload = serde_json::to_string(&event.payload)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO events (id, payload, status, dedup_key, created_at, updated_at)
            VALUES (?, ?, 'PENDING_UPLOAD', ?, ?, ?)
            "#,
        )
        .bind(event.id.as_str())
        .bind(&payload)
        .bind(event.dedup_key.as_deref())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &inserted {
            if db_err.is_unique_violation() {
                tx.rollback().await?;
                // Lost a race on the dedup key.
                if let Some(key) = event.dedup_key.as_deref() {
                    if let Some(existing) = self.event_id_by_dedup_key(key).await? {
                        return Ok(InsertOutcome::Existing(existing));
                    }
                }
                return Err(DbError::constraint(format!(
                    "event {} already exists",
                    event.id
                )));
            }
        }
        inserted?;

        for upload in &uploads {
            sqlx::query(
                r#"
                INSERT INTO upload_jobs
                    (id, event_id, filepath, file_size, checksum, status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, 'PENDING', ?, ?)
                "#,
            )
            .bind(upload.id.as_str())
            .bind(event.id.as_str())
            .bind(upload.filepath.to_string_lossy().as_ref())
            .bind(upload.file_size as i64)
            .bind(&upload.checksum)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(event_id = %event.id, uploads = uploads.len(), "Event inserted");
        Ok(InsertOutcome::Created(event.id))
    }

    async fn event_id_by_dedup_key(&self, key: &str) -> Result<Option<EventId>> {
        let row = sqlx::query("SELECT id FROM events WHERE dedup_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(parse_event_id(&row.try_get::<String, _>("id")?)?)),
            None => Ok(None),
        }
    }

    pub async fn get_event(&self, id: &EventId) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// Most recently updated events first.
    pub async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: u32,
    ) -> Result<Vec<Event>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM events WHERE status = ? ORDER BY updated_at DESC, id LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM events ORDER BY updated_at DESC, id LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_event).collect()
    }

    /// Terminal events whose current status has not been announced yet.
    pub async fn pending_alerts(&self, limit: u32) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE status IN ('UPLOADED', 'FAILED')
              AND (alerted_status IS NULL OR alerted_status != status)
            ORDER BY updated_at ASC, id
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Record that `status` was announced for the event.
    ///
    /// Returns false when the event has moved on since, so it stays in the outbox.
    pub async fn mark_alerted(&self, id: &EventId, status: EventStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE events SET alerted_status = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(id.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_event(id).await?.is_none() {
            return Err(DbError::not_found(format!("event {}", id)));
        }
        Ok(result.rows_affected() > 0)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let events = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'PENDING_UPLOAD' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'UPLOADED' THEN 1 ELSE 0 END), 0) AS uploaded,
                COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed
            FROM events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let uploads = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'PROCESSING' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN status = 'COMPLETE' THEN 1 ELSE 0 END), 0) AS complete,
                COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed
            FROM upload_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            events_pending: events.try_get::<i64, _>("pending")? as u64,
            events_uploaded: events.try_get::<i64, _>("uploaded")? as u64,
            events_failed: events.try_get::<i64, _>("failed")? as u64,
            uploads_pending: uploads.try_get::<i64, _>("pending")? as u64,
            uploads_processing: uploads.try_get::<i64, _>("processing")? as u64,
            uploads_complete: uploads.try_get::<i64, _>("complete")? as u64,
            uploads_failed: uploads.try_get::<i64, _>("failed")? as u64,
        })
    }
}

/// Recompute an event's status from its jobs inside the caller's transaction.
///
/// All COMPLETE: UPLOADED. All terminal with at least one FAILED: FAILED.
/// Anything else: PENDING_UPLOAD.
pub(crate) async fn derive_event_status(
    conn: &mut SqliteConnection,
    event_id: &str,
    now: i64,
) -> Result<EventStatus> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN status = 'COMPLETE' THEN 1 ELSE 0 END), 0) AS complete,
            COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed
        FROM upload_jobs WHERE event_id = ?
        "#,
    )
    .bind(event_id)
    .fetch_one(&mut *conn)
    .await?;

    let total: i64 = row.try_get("total")?;
    let complete: i64 = row.try_get("complete")?;
    let failed: i64 = row.try_get("failed")?;

    let status = if total > 0 && complete == total {
        EventStatus::Uploaded
    } else if failed > 0 && complete + failed == total {
        EventStatus::Failed
    } else {
        EventStatus::PendingUpload
    };

    sqlx::query("UPDATE events SET status = ?, updated_at = ? WHERE id = ? AND status != ?")
        .bind(status.as_str())
        .bind(now)
        .bind(event_id)
        .bind(status.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(status)
}

pub(crate) fn parse_event_id(value: &str) -> Result<EventId> {
    EventId::parse(value).map_err(|e| DbError::invalid_state(e.to_string()))
}

fn row_to_event(row: &SqliteRow) -> Result<Event> {
    let status_str: String = row.try_get("status")?;
    let status = EventStatus::parse(&status_str)
        .ok_or_else(|| DbError::invalid_state(format!("Unknown event status: {}", status_str)))?;
    let alerted_status = row
        .try_get::<Option<String>, _>("alerted_status")?
        .and_then(|s| EventStatus::parse(&s));
    let payload: String = row.try_get("payload")?;

    Ok(Event {
        id: parse_event_id(&row.try_get::<String, _>("id")?)?,
        payload: serde_json::from_str(&payload)?,
        status,
        dedup_key: row.try_get("dedup_key")?,
        alerted_status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
