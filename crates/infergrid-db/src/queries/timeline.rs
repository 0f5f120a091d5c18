//! Database query functions for the `subtask_timeline_events` table.
//!
//! The timeline is append-only. Writes always run on the caller's
//! executor so an event commits or rolls back together with the state
//! transition that produced it.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{TimelineEvent, TimelineEventType};

/// Append one audit event for a subtask.
pub async fn append(
    exec: impl PgExecutor<'_>,
    subtask_id: Uuid,
    event_type: TimelineEventType,
    message: &str,
    metadata: &Value,
) -> Result<TimelineEvent> {
    let event = sqlx::query_as::<_, TimelineEvent>(
        "INSERT INTO subtask_timeline_events (subtask_id, event_type, message, metadata) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(subtask_id)
    .bind(event_type)
    .bind(message)
    .bind(metadata)
    .fetch_one(exec)
    .await
    .with_context(|| {
        format!("failed to append {event_type} timeline event for subtask {subtask_id}")
    })?;

    Ok(event)
}

/// List all events for a subtask in creation order.
pub async fn list_for_subtask(
    exec: impl PgExecutor<'_>,
    subtask_id: Uuid,
) -> Result<Vec<TimelineEvent>> {
    let events = sqlx::query_as::<_, TimelineEvent>(
        "SELECT * FROM subtask_timeline_events \
         WHERE subtask_id = $1 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(subtask_id)
    .fetch_all(exec)
    .await
    .with_context(|| format!("failed to list timeline events for subtask {subtask_id}"))?;

    Ok(events)
}

/// Count events of one type for a subtask.
pub async fn count_for_subtask(
    exec: impl PgExecutor<'_>,
    subtask_id: Uuid,
    event_type: TimelineEventType,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM subtask_timeline_events \
         WHERE subtask_id = $1 AND event_type = $2",
    )
    .bind(subtask_id)
    .bind(event_type)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to count timeline events for subtask {subtask_id}"))?;

    Ok(row.0)
}
