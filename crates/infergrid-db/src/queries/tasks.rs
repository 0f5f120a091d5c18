//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{Task, TaskStatus, TaskType};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, status, timestamps).
///
/// `id` may be supplied by the intake contract; when `None` the database
/// generates one.
pub async fn insert_task(
    exec: impl PgExecutor<'_>,
    id: Option<Uuid>,
    owner_user_id: &str,
    task_type: TaskType,
    model_uri: &str,
    fill_bindings_via_api: bool,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, owner_user_id, task_type, model_uri, fill_bindings_via_api) \
         VALUES (COALESCE($1, gen_random_uuid()), $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(id)
    .bind(owner_user_id)
    .bind(task_type)
    .bind(model_uri)
    .bind(fill_bindings_via_api)
    .fetch_one(exec)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(exec: impl PgExecutor<'_>, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a single task by ID, locking the row for the current transaction.
pub async fn get_task_for_update(exec: impl PgExecutor<'_>, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch task for update")?;

    Ok(task)
}

/// List tasks owned by a user, newest first, optionally filtered by status.
pub async fn list_tasks_for_owner(
    exec: impl PgExecutor<'_>,
    owner_user_id: &str,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE owner_user_id = $1 AND ($2::text IS NULL OR status = $2) \
         ORDER BY created_at DESC",
    )
    .bind(owner_user_id)
    .bind(status.map(|s| s.to_string()))
    .fetch_all(exec)
    .await
    .context("failed to list tasks for owner")?;

    Ok(tasks)
}

/// Move a task to `in_progress` unless it is already terminal.
///
/// Returns the number of rows affected (0 means the task was missing or
/// already completed/failed).
pub async fn mark_in_progress(exec: impl PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'in_progress', updated_at = NOW() \
         WHERE id = $1 AND status NOT IN ('completed', 'failed')",
    )
    .bind(id)
    .execute(exec)
    .await
    .context("failed to mark task in progress")?;

    Ok(result.rows_affected())
}

/// Mark a task completed and stamp `completed_at`.
pub async fn mark_completed(exec: impl PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', completed_at = NOW(), updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .execute(exec)
    .await
    .context("failed to mark task completed")?;

    Ok(result.rows_affected())
}

/// Mark a task failed.
pub async fn mark_failed(exec: impl PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .execute(exec)
    .await
    .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

/// Bump `updated_at` without changing status.
pub async fn touch(exec: impl PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET updated_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(exec)
        .await
        .context("failed to touch task")?;

    Ok(result.rows_affected())
}

/// Add a settled subtask's cost to the task aggregate.
pub async fn add_cost(exec: impl PgExecutor<'_>, id: Uuid, amount: Decimal) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET total_cost = total_cost + $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(amount)
    .execute(exec)
    .await
    .context("failed to add task cost")?;

    Ok(result.rows_affected())
}
