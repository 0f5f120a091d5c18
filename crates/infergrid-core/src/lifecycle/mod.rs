//! Lifecycle engine: the only mutator of subtask status after
//! assignment.
//!
//! Every operation verifies ownership (assigned provider, constant-time
//! compare), opens one serializable transaction, mutates within it, and
//! commits -- there is no cross-transaction continuation. Failed
//! ownership checks log at warn and leave no timeline trace.

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use infergrid_db::models::{Subtask, TimelineEventType};
use infergrid_db::queries::{subtasks as subtask_db, tasks as task_db, timeline, users as user_db};

use crate::auth::constant_time_eq;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execstate::{ExecutionPhase, ExecutionState};
use crate::ledger::{self, Settlement};
use crate::results::parse_metrics;
use crate::store::{self, RetryBudget};

/// Synthetic failure reason applied when a device's connection drops.
pub const DISCONNECT_REASON: &str = "Device disconnected unexpectedly";

/// Synthetic failure reason applied by the heartbeat monitor.
pub const HEARTBEAT_TIMEOUT_REASON: &str = "Heartbeat timeout";

/// What a successful `complete` did.
#[derive(Debug)]
pub struct CompletionOutcome {
    /// Whether this completion finished the parent task.
    pub task_completed: bool,
    /// The ledger rows the settlement produced.
    pub settlement: Settlement,
}

/// What a `fail` did beyond marking the subtask failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// The subtask went back to the pending queue for another provider.
    pub reassigned: bool,
    /// The parent task was marked failed.
    pub task_failed: bool,
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

fn verify_owner(subtask: &Subtask, provider_user_id: &str) -> Result<(), EngineError> {
    let assigned = subtask.assigned_provider_user_id.as_deref().unwrap_or("");
    if !constant_time_eq(assigned, provider_user_id) {
        warn!(
            subtask_id = %subtask.id,
            provider = provider_user_id,
            "provider mismatch on lifecycle operation"
        );
        return Err(EngineError::forbidden(
            "subtask is not assigned to this provider",
        ));
    }
    Ok(())
}

fn verify_executable(subtask: &Subtask) -> Result<(), EngineError> {
    if !subtask.status.is_executable() {
        return Err(EngineError::invalid_state(format!(
            "subtask is {}",
            subtask.status
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Acknowledge
// ---------------------------------------------------------------------------

/// Record that the device has started running the subtask.
///
/// Idempotent: repeated calls keep status `executing` and leave exactly
/// one `execution-acknowledged` timeline event.
pub async fn acknowledge_execution_start(
    pool: &PgPool,
    config: &EngineConfig,
    subtask_id: Uuid,
    provider_user_id: &str,
) -> Result<(), EngineError> {
    let mut budget = RetryBudget::new(config.max_serialization_retries);
    loop {
        let mut tx = store::begin_serializable(pool).await?;
        match ack_in_tx(&mut tx, subtask_id, provider_user_id).await {
            Ok(()) => {
                if store::commit_serializable(tx).await? {
                    return Ok(());
                }
            }
            Err(err) => store::rollback_for_retry(tx, err).await?,
        }
        budget.step().await?;
    }
}

async fn ack_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    subtask_id: Uuid,
    provider_user_id: &str,
) -> Result<(), EngineError> {
    let subtask = subtask_db::get_subtask_for_update(&mut **tx, subtask_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("subtask {subtask_id}")))?;
    verify_owner(&subtask, provider_user_id)?;
    verify_executable(&subtask)?;

    let mut state = ExecutionState::from_value(&subtask.execution_state);
    state.phase = ExecutionPhase::Executing;
    state.message = Some("Execution acknowledged by provider".to_owned());

    subtask_db::record_acknowledgement(&mut **tx, subtask.id, &state.to_value()).await?;

    let already_acknowledged = timeline::count_for_subtask(
        &mut **tx,
        subtask.id,
        TimelineEventType::ExecutionAcknowledged,
    )
    .await?
        > 0;
    if !already_acknowledged {
        timeline::append(
            &mut **tx,
            subtask.id,
            TimelineEventType::ExecutionAcknowledged,
            "Execution acknowledged by provider",
            &json!({"providerUserId": provider_user_id}),
        )
        .await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Record a progress report. Returns the clamped percentage applied.
///
/// Promotes `assigned` to `executing`, refreshes the heartbeat, and
/// never lets progress decrease within a run.
pub async fn update_progress(
    pool: &PgPool,
    config: &EngineConfig,
    subtask_id: Uuid,
    provider_user_id: &str,
    percent: f64,
) -> Result<i32, EngineError> {
    let mut budget = RetryBudget::new(config.max_serialization_retries);
    loop {
        let mut tx = store::begin_serializable(pool).await?;
        match progress_in_tx(&mut tx, config, subtask_id, provider_user_id, percent).await {
            Ok(clamped) => {
                if store::commit_serializable(tx).await? {
                    return Ok(clamped);
                }
            }
            Err(err) => store::rollback_for_retry(tx, err).await?,
        }
        budget.step().await?;
    }
}

async fn progress_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    config: &EngineConfig,
    subtask_id: Uuid,
    provider_user_id: &str,
    percent: f64,
) -> Result<i32, EngineError> {
    let subtask = subtask_db::get_subtask_for_update(&mut **tx, subtask_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("subtask {subtask_id}")))?;
    verify_owner(&subtask, provider_user_id)?;
    verify_executable(&subtask)?;

    let clamped = percent.clamp(0.0, 100.0).round() as i32;
    let now = Utc::now();

    let mut state = ExecutionState::from_value(&subtask.execution_state);
    state.phase = ExecutionPhase::Executing;
    state
        .extended_metadata
        .insert("progressPercentage".to_owned(), json!(clamped));
    state
        .extended_metadata
        .insert("heartbeatAtUtc".to_owned(), json!(now.to_rfc3339()));

    subtask_db::record_progress(
        &mut **tx,
        subtask.id,
        clamped,
        now + config.heartbeat_interval,
        &state.to_value(),
    )
    .await?;

    timeline::append(
        &mut **tx,
        subtask.id,
        TimelineEventType::Progress,
        &format!("Progress {clamped}%"),
        &json!({
            "progressPercentage": clamped,
            "heartbeatAtUtc": now.to_rfc3339(),
        }),
    )
    .await?;

    Ok(clamped)
}

// ---------------------------------------------------------------------------
// Complete
// ---------------------------------------------------------------------------

/// Record terminal completion, settle the ledger, and roll the parent
/// task aggregate -- all in one transaction.
///
/// A second `complete` on the same subtask observes the terminal status
/// and fails with `InvalidState` without touching the ledger.
pub async fn complete(
    pool: &PgPool,
    config: &EngineConfig,
    subtask_id: Uuid,
    provider_user_id: &str,
    results: &Value,
) -> Result<CompletionOutcome, EngineError> {
    let mut budget = RetryBudget::new(config.max_serialization_retries);
    loop {
        let mut tx = store::begin_serializable(pool).await?;
        match complete_in_tx(&mut tx, config, subtask_id, provider_user_id, results).await {
            Ok(outcome) => {
                if store::commit_serializable(tx).await? {
                    info!(
                        subtask_id = %subtask_id,
                        task_completed = outcome.task_completed,
                        "subtask completed"
                    );
                    return Ok(outcome);
                }
            }
            Err(err) => store::rollback_for_retry(tx, err).await?,
        }
        budget.step().await?;
    }
}

async fn complete_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    config: &EngineConfig,
    subtask_id: Uuid,
    provider_user_id: &str,
    results: &Value,
) -> Result<CompletionOutcome, EngineError> {
    let subtask = subtask_db::get_subtask_for_update(&mut **tx, subtask_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("subtask {subtask_id}")))?;
    verify_owner(&subtask, provider_user_id)?;
    verify_executable(&subtask)?;

    let metrics = parse_metrics(results);

    let mut state = ExecutionState::from_value(&subtask.execution_state);
    state.phase = ExecutionPhase::Completed;
    if let Some(device) = &metrics.device {
        state
            .extended_metadata
            .insert("executionDevice".to_owned(), json!(device));
    }

    subtask_db::record_completion(
        &mut **tx,
        subtask.id,
        results,
        metrics.duration_seconds,
        metrics.cost_usd,
        &state.to_value(),
    )
    .await?;

    let mut metadata = serde_json::Map::new();
    if let Some(duration) = metrics.duration_seconds {
        metadata.insert("durationSeconds".to_owned(), json!(duration));
    }
    if let Some(cost) = metrics.cost_usd {
        metadata.insert("costUsd".to_owned(), json!(cost.to_string()));
    }
    timeline::append(
        &mut **tx,
        subtask.id,
        TimelineEventType::Completion,
        "Subtask completed",
        &Value::Object(metadata),
    )
    .await?;

    let task = task_db::get_task_for_update(&mut **tx, subtask.task_id)
        .await?
        .ok_or_else(|| EngineError::invalid_state("parent task missing"))?;

    let task_completed = subtask_db::all_completed_for_task(&mut **tx, task.id).await?;
    if task_completed {
        task_db::mark_completed(&mut **tx, task.id).await?;
    } else {
        task_db::mark_in_progress(&mut **tx, task.id).await?;
    }

    // Settle against the row as persisted, so the metrics-supplied cost
    // is the one that moves money.
    let updated = subtask_db::get_subtask(&mut **tx, subtask.id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("subtask {subtask_id}")))?;
    let settlement = ledger::settle(&mut **tx, config, &updated, &task).await?;

    Ok(CompletionOutcome {
        task_completed,
        settlement,
    })
}

// ---------------------------------------------------------------------------
// Fail
// ---------------------------------------------------------------------------

/// Record terminal failure and decide reassignment.
///
/// When at least one alternative active peer exists the subtask returns
/// to the pending queue with `requires_reassignment` set; otherwise the
/// parent task fails too, unless it fills bindings via API and stays
/// alive for external retries.
pub async fn fail(
    pool: &PgPool,
    config: &EngineConfig,
    subtask_id: Uuid,
    provider_user_id: &str,
    reason: &str,
) -> Result<FailureOutcome, EngineError> {
    let mut budget = RetryBudget::new(config.max_serialization_retries);
    loop {
        let mut tx = store::begin_serializable(pool).await?;
        match fail_in_tx(&mut tx, subtask_id, provider_user_id, reason).await {
            Ok(outcome) => {
                if store::commit_serializable(tx).await? {
                    info!(
                        subtask_id = %subtask_id,
                        reassigned = outcome.reassigned,
                        task_failed = outcome.task_failed,
                        "subtask failed"
                    );
                    return Ok(outcome);
                }
            }
            Err(err) => store::rollback_for_retry(tx, err).await?,
        }
        budget.step().await?;
    }
}

async fn fail_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    subtask_id: Uuid,
    provider_user_id: &str,
    reason: &str,
) -> Result<FailureOutcome, EngineError> {
    let subtask = subtask_db::get_subtask_for_update(&mut **tx, subtask_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("subtask {subtask_id}")))?;
    verify_owner(&subtask, provider_user_id)?;
    verify_executable(&subtask)?;

    apply_failure(tx, &subtask, reason, TimelineEventType::Failure).await
}

/// Fail every subtask a disconnected device was holding.
///
/// Each subtask takes the normal failure path with a synthetic reason
/// and the `device-disconnection-failure` event type; reassignment is
/// evaluated per subtask. Returns the outcome per failed subtask id.
pub async fn fail_all_for_device(
    pool: &PgPool,
    config: &EngineConfig,
    device_id: &str,
    provider_user_id: &str,
) -> Result<Vec<(Uuid, FailureOutcome)>, EngineError> {
    let mut budget = RetryBudget::new(config.max_serialization_retries);
    loop {
        let mut tx = store::begin_serializable(pool).await?;
        match fail_device_in_tx(&mut tx, device_id, provider_user_id).await {
            Ok(outcomes) => {
                if store::commit_serializable(tx).await? {
                    if !outcomes.is_empty() {
                        info!(
                            device = device_id,
                            count = outcomes.len(),
                            "failed in-flight subtasks after device disconnect"
                        );
                    }
                    return Ok(outcomes);
                }
            }
            Err(err) => store::rollback_for_retry(tx, err).await?,
        }
        budget.step().await?;
    }
}

async fn fail_device_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    device_id: &str,
    provider_user_id: &str,
) -> Result<Vec<(Uuid, FailureOutcome)>, EngineError> {
    let active = subtask_db::list_active_for_device(&mut **tx, device_id).await?;
    let mut outcomes = Vec::with_capacity(active.len());

    for subtask in &active {
        if verify_owner(subtask, provider_user_id).is_err() {
            // Logged by verify_owner; the row belongs to someone else's
            // session and its own disconnect will sweep it.
            continue;
        }
        let outcome = apply_failure(
            tx,
            subtask,
            DISCONNECT_REASON,
            TimelineEventType::DeviceDisconnectionFailure,
        )
        .await?;
        outcomes.push((subtask.id, outcome));
    }

    Ok(outcomes)
}

/// The shared failure transition: mark failed, audit, then either queue
/// for reassignment or finalize the parent task.
async fn apply_failure(
    tx: &mut Transaction<'static, Postgres>,
    subtask: &Subtask,
    reason: &str,
    event_type: TimelineEventType,
) -> Result<FailureOutcome, EngineError> {
    let provider_id = subtask.assigned_provider_user_id.as_deref().unwrap_or("");
    let now = Utc::now();

    let mut state = ExecutionState::from_value(&subtask.execution_state);
    state.phase = ExecutionPhase::Failed;
    state
        .extended_metadata
        .insert("failureReason".to_owned(), json!(reason));
    state
        .extended_metadata
        .insert("failedAtUtc".to_owned(), json!(now.to_rfc3339()));

    subtask_db::record_failure(&mut **tx, subtask.id, reason, &state.to_value()).await?;

    timeline::append(
        &mut **tx,
        subtask.id,
        event_type,
        "Subtask failed",
        &json!({"failureReason": reason}),
    )
    .await?;

    // At least one alternative peer must exist for reassignment to make
    // sense; the count is global, not capability-matched.
    let peers = user_db::count_other_active_users(&mut **tx, provider_id).await?;
    let can_reassign = peers > 1;

    if can_reassign {
        subtask_db::clear_for_reassignment(&mut **tx, subtask.id).await?;
        timeline::append(
            &mut **tx,
            subtask.id,
            TimelineEventType::ReassignmentRequested,
            "Reassignment requested",
            &json!({"previousProviderUserId": provider_id}),
        )
        .await?;
        return Ok(FailureOutcome {
            reassigned: true,
            task_failed: false,
        });
    }

    let task = task_db::get_task_for_update(&mut **tx, subtask.task_id)
        .await?
        .ok_or_else(|| EngineError::invalid_state("parent task missing"))?;

    if task.fill_bindings_via_api {
        // API-filled tasks stay alive; the client may retry externally.
        return Ok(FailureOutcome {
            reassigned: false,
            task_failed: false,
        });
    }

    task_db::mark_failed(&mut **tx, task.id).await?;
    timeline::append(
        &mut **tx,
        subtask.id,
        TimelineEventType::TaskFailed,
        "Task failed: no providers available for reassignment",
        &json!({"taskId": task.id}),
    )
    .await?;

    Ok(FailureOutcome {
        reassigned: false,
        task_failed: true,
    })
}
