//! Per-device heartbeat state.

use crate::error::Result;
use crate::types::DeviceState;
use crate::VigilDb;
use sqlx::Row;

impl VigilDb {
    /// Upsert the device row with the latest heartbeat time and versions.
    pub async fn record_heartbeat(
        &self,
        device_id: &str,
        versions: &serde_json::Value,
        now: i64,
    ) -> Result<()> {
        let versions = serde_json::to_string(versions)?;
        sqlx::query(
            r#"
            INSERT INTO device_state (device_id, last_heartbeat_at, versions)
            VALUES (?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                last_heartbeat_at = excluded.last_heartbeat_at,
                versions = excluded.versions
            "#,
        )
        .bind(device_id)
        .bind(now)
        .bind(&versions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn device_state(&self, device_id: &str) -> Result<Option<DeviceState>> {
        let row = sqlx::query("SELECT * FROM device_state WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let versions: String = row.try_get("versions")?;
                Ok(Some(DeviceState {
                    device_id: row.try_get("device_id")?,
                    last_heartbeat_at: row.try_get("last_heartbeat_at")?,
                    versions: serde_json::from_str(&versions)?,
                }))
            }
            None => Ok(None),
        }
    }
}
