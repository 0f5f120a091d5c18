//! Database query functions for the `devices` table.

use anyhow::{Context, Result};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::Device;

/// Upsert a device on connection open: capabilities and the live session
/// id replace whatever the previous connection recorded.
#[allow(clippy::too_many_arguments)]
pub async fn attach_device(
    exec: impl PgExecutor<'_>,
    id: &str,
    owner_user_id: &str,
    cpu_tops: f64,
    gpu_tops: f64,
    npu_tops: f64,
    ram_gb: f64,
    session_id: Uuid,
) -> Result<Device> {
    let device = sqlx::query_as::<_, Device>(
        "INSERT INTO devices (id, owner_user_id, cpu_tops, gpu_tops, npu_tops, ram_gb, session_id, last_seen_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) \
         ON CONFLICT (id) DO UPDATE SET \
             owner_user_id = EXCLUDED.owner_user_id, \
             cpu_tops = EXCLUDED.cpu_tops, \
             gpu_tops = EXCLUDED.gpu_tops, \
             npu_tops = EXCLUDED.npu_tops, \
             ram_gb = EXCLUDED.ram_gb, \
             session_id = EXCLUDED.session_id, \
             last_seen_at = NOW() \
         RETURNING *",
    )
    .bind(id)
    .bind(owner_user_id)
    .bind(cpu_tops)
    .bind(gpu_tops)
    .bind(npu_tops)
    .bind(ram_gb)
    .bind(session_id)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to attach device {id}"))?;

    Ok(device)
}

/// Touch `last_seen_at` on an observed heartbeat.
pub async fn touch_last_seen(exec: impl PgExecutor<'_>, id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE devices SET last_seen_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(exec)
        .await
        .context("failed to touch device last_seen_at")?;

    Ok(result.rows_affected())
}

/// Clear the session on connection close, but only when the stored
/// session still matches -- a reconnect may already have replaced it.
pub async fn detach_device(
    exec: impl PgExecutor<'_>,
    id: &str,
    session_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE devices SET session_id = NULL, last_seen_at = NOW() \
         WHERE id = $1 AND session_id = $2",
    )
    .bind(id)
    .bind(session_id)
    .execute(exec)
    .await
    .context("failed to detach device")?;

    Ok(result.rows_affected())
}

/// Fetch a single device by ID.
pub async fn get_device(exec: impl PgExecutor<'_>, id: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch device")?;

    Ok(device)
}
