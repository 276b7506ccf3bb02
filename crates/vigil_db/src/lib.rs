//! Durable store for the Vigil edge agent.
//!
//! The single source of truth for events, upload jobs, knowledge-base
//! version state and device state. Workers coordinate only through the
//! operations here; nothing outside this crate issues SQL.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vigil_db::{VigilDb, Result};
//!
//! let db = VigilDb::open("/var/lib/vigil/vigil.sqlite3").await?;
//! let now = VigilDb::now_millis();
//! if let Some(claim) = db.claim_next_upload(&policy, now).await? {
//!     // ... presign, transfer, confirm ...
//!     db.complete_upload(&claim.job.id, "https://cdn/clip.mp4", now).await?;
//! }
//! ```

mod error;
mod schema;
mod types;

mod device;
mod events;
mod knowledge;
mod uploads;

pub use error::{DbError, Result};
pub use knowledge::SYNC_LOG_KEEP;
pub use schema::SCHEMA_VERSION;
pub use types::*;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 5;

/// Handle to the store. Cheap to clone.
#[derive(Clone)]
pub struct VigilDb {
    pool: SqlitePool,
}

impl VigilDb {
    /// Open or create the store at `path` and apply pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;

        info!(path = %path.display(), "Store opened");
        Ok(db)
    }

    /// In-memory store on a single connection.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Reachability check used by the watchdog.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl VigilDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("state").join("vigil.sqlite3");

        let db = VigilDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);
        db.ping().await.unwrap();

        db.close().await;
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("vigil.sqlite3");

        VigilDb::open(&db_path).await.unwrap().close().await;
        let db = VigilDb::open(&db_path).await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_newer_schema_is_refused() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("vigil.sqlite3");

        let db = VigilDb::open(&db_path).await.unwrap();
        sqlx::query("UPDATE vigil_meta SET value = ? WHERE key = 'schema_version'")
            .bind(SCHEMA_VERSION + 1)
            .execute(&db.pool)
            .await
            .unwrap();
        db.close().await;

        let err = VigilDb::open(&db_path).await.err().unwrap();
        assert!(matches!(err, DbError::Schema(_)));
    }
}
