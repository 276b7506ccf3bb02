//! Schema creation and forward migrations.
//!
//! `vigil_meta` holds the applied schema version. Migrations run in order,
//! each in its own transaction together with the version bump.

use crate::error::{DbError, Result};
use crate::VigilDb;
use sqlx::Row;
use tracing::info;

/// Latest schema version this binary understands.
pub const SCHEMA_VERSION: i64 = 2;

struct Migration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        statements: &[
            r#"CREATE TABLE events (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING_UPLOAD',
                dedup_key TEXT UNIQUE,
                alerted_status TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE upload_jobs (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL REFERENCES events(id),
                filepath TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                lease_expires_at INTEGER,
                status TEXT NOT NULL DEFAULT 'PENDING',
                final_url TEXT,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
            "CREATE INDEX idx_upload_jobs_status ON upload_jobs(status, last_attempt_at)",
            "CREATE INDEX idx_upload_jobs_event ON upload_jobs(event_id)",
            "CREATE INDEX idx_events_status ON events(status, updated_at)",
            r#"CREATE TABLE kb_meta (
                slot TEXT PRIMARY KEY,
                kb_version TEXT NOT NULL,
                checksum TEXT,
                applied_at INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE device_state (
                device_id TEXT PRIMARY KEY,
                last_heartbeat_at INTEGER NOT NULL,
                versions TEXT NOT NULL
            )"#,
        ],
    },
    Migration {
        version: 2,
        name: "kb_sync_log",
        statements: &[
            r#"CREATE TABLE kb_sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slot TEXT NOT NULL,
                from_version TEXT,
                to_version TEXT,
                outcome TEXT NOT NULL,
                detail TEXT,
                attempted_at INTEGER NOT NULL
            )"#,
            "CREATE INDEX idx_kb_sync_log_time ON kb_sync_log(attempted_at)",
        ],
    },
];

impl VigilDb {
    /// Bring the schema up to [`SCHEMA_VERSION`].
    pub(crate) async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS vigil_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        let current = self.schema_version().await?;
        if current > SCHEMA_VERSION {
            return Err(DbError::Schema(format!(
                "database schema version {} is newer than supported version {}",
                current, SCHEMA_VERSION
            )));
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let mut tx = self.pool.begin().await?;
            for statement in migration.statements {
                sqlx::query(statement).execute(&mut *tx).await.map_err(|e| {
                    DbError::Schema(format!(
                        "migration {} ({}) failed: {}",
                        migration.version, migration.name, e
                    ))
                })?;
            }
            sqlx::query(
                r#"INSERT INTO vigil_meta (key, value) VALUES ('schema_version', ?)
                   ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
            )
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            info!(
                version = migration.version,
                name = migration.name,
                "Applied schema migration"
            );
        }

        Ok(())
    }

    /// Applied schema version; 0 for a fresh database.
    pub async fn schema_version(&self) -> Result<i64> {
        let row = sqlx::query("SELECT value FROM vigil_meta WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("value")?),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_end_at_current_version() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert_eq!(versions.last().copied(), Some(SCHEMA_VERSION));
    }
}
