//! Database query functions for the `subtasks` table.
//!
//! State transitions use guarded UPDATEs: the WHERE clause repeats the
//! statuses the transition is legal from, so a row that moved under us
//! yields `rows_affected == 0` instead of a corrupt write. The claim
//! query additionally uses `FOR UPDATE SKIP LOCKED` so concurrent
//! providers never block on each other's candidate row.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::Subtask;

/// Insert a new subtask row in `pending` status.
///
/// `id` may be supplied by the intake contract; `cost` is the quoted
/// price for executing this unit, when known at creation time.
pub async fn insert_subtask(
    exec: impl PgExecutor<'_>,
    id: Option<Uuid>,
    task_id: Uuid,
    parameters: &Value,
    cost: Option<Decimal>,
) -> Result<Subtask> {
    let subtask = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks (id, task_id, parameters, cost) \
         VALUES (COALESCE($1, gen_random_uuid()), $2, $3, $4) \
         RETURNING *",
    )
    .bind(id)
    .bind(task_id)
    .bind(parameters)
    .bind(cost)
    .fetch_one(exec)
    .await
    .context("failed to insert subtask")?;

    Ok(subtask)
}

/// Fetch a single subtask by ID.
pub async fn get_subtask(exec: impl PgExecutor<'_>, id: Uuid) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch subtask")?;

    Ok(subtask)
}

/// Fetch a single subtask by ID, locking the row for the current
/// transaction.
pub async fn get_subtask_for_update(
    exec: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch subtask for update")?;

    Ok(subtask)
}

/// List all subtasks of a task, ordered by creation time.
pub async fn list_for_task(exec: impl PgExecutor<'_>, task_id: Uuid) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(exec)
    .await
    .context("failed to list subtasks for task")?;

    Ok(subtasks)
}

/// Pick the next subtask a provider could claim, locking it.
///
/// Offerable rows are `pending`, or `failed` with the reassignment flag
/// still set. Selection order is fixed: reassignments first, then oldest
/// creation time, then id. Rows locked by a concurrent claim are skipped
/// rather than waited on. The parent task must have a non-empty owner,
/// and (unless `allow_self_assignment`) an owner different from the
/// requesting provider.
pub async fn next_claimable(
    exec: impl PgExecutor<'_>,
    provider_user_id: &str,
    allow_self_assignment: bool,
) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>(
        "SELECT s.* FROM subtasks s \
         JOIN tasks t ON t.id = s.task_id \
         WHERE (s.status = 'pending' \
                OR (s.status = 'failed' AND s.requires_reassignment)) \
           AND t.owner_user_id <> '' \
           AND ($2 OR t.owner_user_id <> $1) \
         ORDER BY s.requires_reassignment DESC, s.created_at ASC, s.id ASC \
         LIMIT 1 \
         FOR UPDATE OF s SKIP LOCKED",
    )
    .bind(provider_user_id)
    .bind(allow_self_assignment)
    .fetch_optional(exec)
    .await
    .context("failed to select next claimable subtask")?;

    Ok(subtask)
}

/// Apply the atomic claim transition onto a provider device.
///
/// Moves the row to `executing`, stamps every assignment timestamp,
/// resets progress and the reassignment/failure fields, and installs the
/// fresh execution state. Guarded on the offerable statuses; returns the
/// number of rows affected.
pub async fn claim(
    exec: impl PgExecutor<'_>,
    id: Uuid,
    provider_user_id: &str,
    device_id: &str,
    next_heartbeat_due: DateTime<Utc>,
    execution_state: &Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET \
             status = 'executing', \
             assigned_provider_user_id = $2, \
             assigned_device_id = $3, \
             assigned_at = NOW(), \
             started_at = NOW(), \
             last_heartbeat_at = NOW(), \
             last_command_at = NOW(), \
             next_heartbeat_due = $4, \
             requires_reassignment = FALSE, \
             reassignment_requested_at = NULL, \
             failure_reason = NULL, \
             failed_at = NULL, \
             progress = 0, \
             execution_state = $5 \
         WHERE id = $1 \
           AND (status = 'pending' OR (status = 'failed' AND requires_reassignment))",
    )
    .bind(id)
    .bind(provider_user_id)
    .bind(device_id)
    .bind(next_heartbeat_due)
    .bind(execution_state)
    .execute(exec)
    .await
    .context("failed to claim subtask")?;

    Ok(result.rows_affected())
}

/// Record the device's acknowledgement that execution has started.
///
/// Idempotent from `executing`; promotes from `assigned`. `started_at`
/// and `last_heartbeat_at` are only filled when still null.
pub async fn record_acknowledgement(
    exec: impl PgExecutor<'_>,
    id: Uuid,
    execution_state: &Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET \
             status = 'executing', \
             started_at = COALESCE(started_at, NOW()), \
             last_command_at = NOW(), \
             last_heartbeat_at = COALESCE(last_heartbeat_at, NOW()), \
             execution_state = $2 \
         WHERE id = $1 AND status IN ('assigned', 'executing')",
    )
    .bind(id)
    .bind(execution_state)
    .execute(exec)
    .await
    .context("failed to record execution acknowledgement")?;

    Ok(result.rows_affected())
}

/// Record a progress report.
///
/// Progress never decreases within a run (`GREATEST`); a heartbeat
/// deadline is only installed when none is pending.
pub async fn record_progress(
    exec: impl PgExecutor<'_>,
    id: Uuid,
    percent: i32,
    fallback_heartbeat_due: DateTime<Utc>,
    execution_state: &Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET \
             status = 'executing', \
             progress = GREATEST(progress, $2), \
             started_at = COALESCE(started_at, NOW()), \
             last_heartbeat_at = NOW(), \
             last_command_at = NOW(), \
             next_heartbeat_due = COALESCE(next_heartbeat_due, $3), \
             execution_state = $4 \
         WHERE id = $1 AND status IN ('assigned', 'executing')",
    )
    .bind(id)
    .bind(percent)
    .bind(fallback_heartbeat_due)
    .bind(execution_state)
    .execute(exec)
    .await
    .context("failed to record subtask progress")?;

    Ok(result.rows_affected())
}

/// Record terminal completion with the device-submitted results payload.
///
/// `duration_seconds` and `cost` only overwrite when the results carried
/// them.
pub async fn record_completion(
    exec: impl PgExecutor<'_>,
    id: Uuid,
    results: &Value,
    duration_seconds: Option<f64>,
    cost: Option<Decimal>,
    execution_state: &Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET \
             status = 'completed', \
             progress = 100, \
             results = $2, \
             duration_seconds = COALESCE($3, duration_seconds), \
             cost = COALESCE($4, cost), \
             completed_at = NOW(), \
             last_heartbeat_at = NOW(), \
             last_command_at = NOW(), \
             next_heartbeat_due = NULL, \
             requires_reassignment = FALSE, \
             execution_state = $5 \
         WHERE id = $1 AND status IN ('assigned', 'executing')",
    )
    .bind(id)
    .bind(results)
    .bind(duration_seconds)
    .bind(cost)
    .bind(execution_state)
    .execute(exec)
    .await
    .context("failed to record subtask completion")?;

    Ok(result.rows_affected())
}

/// Record terminal failure with the given reason.
pub async fn record_failure(
    exec: impl PgExecutor<'_>,
    id: Uuid,
    reason: &str,
    execution_state: &Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET \
             status = 'failed', \
             failure_reason = $2, \
             failed_at = NOW(), \
             last_heartbeat_at = NOW(), \
             last_command_at = NOW(), \
             next_heartbeat_due = NULL, \
             execution_state = $3 \
         WHERE id = $1 AND status IN ('assigned', 'executing')",
    )
    .bind(id)
    .bind(reason)
    .bind(execution_state)
    .execute(exec)
    .await
    .context("failed to record subtask failure")?;

    Ok(result.rows_affected())
}

/// Return a failed subtask to the pending queue for another provider.
///
/// Clears the assignment and resets progress; the failure reason and
/// timestamp stay on the row as a diagnostic breadcrumb until the next
/// successful claim clears them.
pub async fn clear_for_reassignment(exec: impl PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET \
             status = 'pending', \
             requires_reassignment = TRUE, \
             reassignment_requested_at = NOW(), \
             assigned_provider_user_id = NULL, \
             assigned_device_id = NULL, \
             progress = 0 \
         WHERE id = $1 AND status = 'failed'",
    )
    .bind(id)
    .execute(exec)
    .await
    .context("failed to clear subtask for reassignment")?;

    Ok(result.rows_affected())
}

/// List the subtasks currently held by a device, locking them for the
/// disconnect sweep.
pub async fn list_active_for_device(
    exec: impl PgExecutor<'_>,
    device_id: &str,
) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks \
         WHERE assigned_device_id = $1 AND status IN ('assigned', 'executing') \
         ORDER BY created_at ASC \
         FOR UPDATE",
    )
    .bind(device_id)
    .fetch_all(exec)
    .await
    .context("failed to list active subtasks for device")?;

    Ok(subtasks)
}

/// List running subtasks whose heartbeat deadline has passed.
pub async fn list_heartbeat_expired(
    exec: impl PgExecutor<'_>,
    now: DateTime<Utc>,
) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks \
         WHERE status IN ('assigned', 'executing') AND next_heartbeat_due < $1 \
         ORDER BY next_heartbeat_due ASC",
    )
    .bind(now)
    .fetch_all(exec)
    .await
    .context("failed to list heartbeat-expired subtasks")?;

    Ok(subtasks)
}

/// Check whether every subtask of a task has completed.
pub async fn all_completed_for_task(exec: impl PgExecutor<'_>, task_id: Uuid) -> Result<bool> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subtasks WHERE task_id = $1 AND status <> 'completed'")
            .bind(task_id)
            .fetch_one(exec)
            .await
            .context("failed to count incomplete subtasks")?;

    Ok(row.0 == 0)
}
