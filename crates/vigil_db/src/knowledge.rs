//! Knowledge-base version state and the sync attempt log.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::VigilDb;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

/// Sync log rows kept per slot; older ones are deleted on insert.
pub const SYNC_LOG_KEEP: i64 = 200;

impl VigilDb {
    /// Currently applied version for a slot.
    pub async fn kb_current(&self, slot: &str) -> Result<Option<KbMeta>> {
        let row = sqlx::query("SELECT * FROM kb_meta WHERE slot = ?")
            .bind(slot)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(KbMeta {
                slot: row.try_get("slot")?,
                kb_version: row.try_get("kb_version")?,
                checksum: row.try_get("checksum")?,
                applied_at: row.try_get("applied_at")?,
            })),
            None => Ok(None),
        }
    }

    /// Record `version` as applied, only if the slot still holds `expected_previous`.
    ///
    /// Returns false when another writer changed the slot first.
    pub async fn kb_apply(
        &self,
        slot: &str,
        expected_previous: Option<&str>,
        version: &str,
        checksum: &str,
        now: i64,
    ) -> Result<bool> {
        let result = match expected_previous {
            Some(previous) => {
                sqlx::query(
                    r#"
                    UPDATE kb_meta SET kb_version = ?, checksum = ?, applied_at = ?
                    WHERE slot = ? AND kb_version = ?
                    "#,
                )
                .bind(version)
                .bind(checksum)
                .bind(now)
                .bind(slot)
                .bind(previous)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kb_meta (slot, kb_version, checksum, applied_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(slot) DO NOTHING
                    "#,
                )
                .bind(slot)
                .bind(version)
                .bind(checksum)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    pub async fn record_sync_attempt(
        &self,
        slot: &str,
        from_version: Option<&str>,
        to_version: Option<&str>,
        outcome: SyncOutcome,
        detail: Option<&str>,
        now: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query(
            r#"
            INSERT INTO kb_sync_log (slot, from_version, to_version, outcome, detail, attempted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(slot)
        .bind(from_version)
        .bind(to_version)
        .bind(outcome.as_str())
        .bind(detail)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let pruned = sqlx::query(
            r#"
            DELETE FROM kb_sync_log
            WHERE slot = ?
              AND id <= (SELECT id FROM kb_sync_log WHERE slot = ? ORDER BY id DESC LIMIT 1 OFFSET ?)
            "#,
        )
        .bind(slot)
        .bind(slot)
        .bind(SYNC_LOG_KEEP)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if pruned > 0 {
            debug!(slot, pruned, "Pruned sync log");
        }
        Ok(id)
    }

    /// Newest attempts first.
    pub async fn recent_sync_attempts(&self, limit: u32) -> Result<Vec<SyncAttempt>> {
        let rows = sqlx::query("SELECT * FROM kb_sync_log ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_attempt).collect()
    }
}

fn row_to_attempt(row: &SqliteRow) -> Result<SyncAttempt> {
    let outcome: String = row.try_get("outcome")?;
    Ok(SyncAttempt {
        id: row.try_get("id")?,
        slot: row.try_get("slot")?,
        from_version: row.try_get("from_version")?,
        to_version: row.try_get("to_version")?,
        outcome: SyncOutcome::parse(&outcome)
            .ok_or_else(|| DbError::invalid_state(format!("Unknown sync outcome: {}", outcome)))?,
        detail: row.try_get("detail")?,
        attempted_at: row.try_get("attempted_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kb_apply_is_compare_and_set() {
        let db = VigilDb::open_memory().await.unwrap();
        assert!(db.kb_current("default").await.unwrap().is_none());

        assert!(db.kb_apply("default", None, "v6", "aa", 1).await.unwrap());
        // A second first-install loses.
        assert!(!db.kb_apply("default", None, "v6", "aa", 2).await.unwrap());

        assert!(!db.kb_apply("default", Some("v5"), "v7", "bb", 3).await.unwrap());
        assert!(db.kb_apply("default", Some("v6"), "v7", "bb", 4).await.unwrap());

        let meta = db.kb_current("default").await.unwrap().unwrap();
        assert_eq!(meta.kb_version, "v7");
        assert_eq!(meta.checksum.as_deref(), Some("bb"));
        assert_eq!(meta.applied_at, 4);
    }

    #[tokio::test]
    async fn test_sync_log_newest_first() {
        let db = VigilDb::open_memory().await.unwrap();
        db.record_sync_attempt("default", Some("v6"), Some("v7"), SyncOutcome::Rejected, Some("sha256 mismatch"), 10)
            .await
            .unwrap();
        db.record_sync_attempt("default", Some("v6"), Some("v7"), SyncOutcome::Applied, None, 20)
            .await
            .unwrap();

        let attempts = db.recent_sync_attempts(10).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, SyncOutcome::Applied);
        assert_eq!(attempts[1].detail.as_deref(), Some("sha256 mismatch"));
    }
    #[tokio::test]
    async fn test_sync_log_is_capped_per_slot() {
        let db = VigilDb::open_memory().await.unwrap();
        db.record_sync_attempt("other", None, Some("v1"), SyncOutcome::Applied, None, 0)
            .await
            .unwrap();
        for n in 0..SYNC_LOG_KEEP + 25 {
            db.record_sync_attempt("default", None, Some("v1"), SyncOutcome::Failed, None, n)
                .await
                .unwrap();
        }

        let attempts = db.recent_sync_attempts(1_000).await.unwrap();
        let default: Vec<_> = attempts.iter().filter(|a| a.slot == "default").collect();
        assert_eq!(default.len() as i64, SYNC_LOG_KEEP);
        assert_eq!(default[0].attempted_at, SYNC_LOG_KEEP + 24);
        assert_eq!(default.last().unwrap().attempted_at, 25);
        assert_eq!(attempts.iter().filter(|a| a.slot == "other").count(), 1);
    }
}
