//! Assignment engine: converts pending subtasks into executing
//! assignments on a requesting provider device.
//!
//! Two entry points share one claim transition: [`try_offer_next`] picks
//! the best eligible subtask for a provider, [`accept`] claims a
//! caller-named subtask. Both run under serializable isolation; when two
//! providers race for the same row, exactly one commit wins and the
//! loser retries onto the next candidate (or None).

use chrono::Utc;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use infergrid_db::models::{Subtask, SubtaskStatus, Task, TimelineEventType, User};
use infergrid_db::queries::{subtasks as subtask_db, tasks as task_db, timeline, users as user_db};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execstate::ExecutionState;
use crate::store::{self, RetryBudget};

/// A successful claim: the subtask as persisted after the transition,
/// plus its parent task.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub subtask: Subtask,
    pub task: Task,
}

/// Offer the next eligible subtask to a provider device.
///
/// Returns `None` without opening a transaction when the provider is
/// unknown or inactive, and `None` when no eligible work exists.
/// Selection order is reassignments first, then oldest creation time,
/// then id.
pub async fn try_offer_next(
    pool: &PgPool,
    config: &EngineConfig,
    provider_user_id: &str,
    device_id: &str,
) -> Result<Option<Assignment>, EngineError> {
    let Some(provider) = user_db::get_user(pool, provider_user_id).await? else {
        debug!(provider = provider_user_id, "unknown provider requested work");
        return Ok(None);
    };
    if !provider.active {
        debug!(provider = provider_user_id, "inactive provider requested work");
        return Ok(None);
    }
    let web_gpu_preferred = prefers_web_gpu(&provider);

    let mut budget = RetryBudget::new(config.max_serialization_retries);
    loop {
        let mut tx = store::begin_serializable(pool).await?;
        match offer_in_tx(&mut tx, config, provider_user_id, device_id, web_gpu_preferred).await {
            Ok(assignment) => {
                if store::commit_serializable(tx).await? {
                    if let Some(a) = &assignment {
                        info!(
                            subtask_id = %a.subtask.id,
                            task_id = %a.task.id,
                            provider = provider_user_id,
                            device = device_id,
                            "subtask claimed"
                        );
                    }
                    return Ok(assignment);
                }
            }
            Err(err) => store::rollback_for_retry(tx, err).await?,
        }
        budget.step().await?;
    }
}

/// Claim a caller-named subtask for a provider device.
///
/// Fails with `NotFound` when the subtask is missing, `Forbidden` on a
/// self-assignment or inactive provider, and `InvalidState` when the
/// subtask is not in an offerable status.
pub async fn accept(
    pool: &PgPool,
    config: &EngineConfig,
    subtask_id: Uuid,
    provider_user_id: &str,
    device_id: &str,
) -> Result<Assignment, EngineError> {
    let provider = user_db::get_user(pool, provider_user_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("user {provider_user_id}")))?;
    if !provider.active {
        return Err(EngineError::forbidden("provider is inactive"));
    }
    let web_gpu_preferred = prefers_web_gpu(&provider);

    let mut budget = RetryBudget::new(config.max_serialization_retries);
    loop {
        let mut tx = store::begin_serializable(pool).await?;
        match accept_in_tx(
            &mut tx,
            config,
            subtask_id,
            provider_user_id,
            device_id,
            web_gpu_preferred,
        )
        .await
        {
            Ok(assignment) => {
                if store::commit_serializable(tx).await? {
                    info!(
                        subtask_id = %assignment.subtask.id,
                        provider = provider_user_id,
                        device = device_id,
                        "subtask accepted"
                    );
                    return Ok(assignment);
                }
            }
            Err(err) => store::rollback_for_retry(tx, err).await?,
        }
        budget.step().await?;
    }
}

fn prefers_web_gpu(provider: &User) -> bool {
    provider
        .resource_capabilities
        .as_deref()
        .is_some_and(|caps| caps.to_ascii_lowercase().contains("gpu"))
}

async fn offer_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    config: &EngineConfig,
    provider_user_id: &str,
    device_id: &str,
    web_gpu_preferred: bool,
) -> Result<Option<Assignment>, EngineError> {
    let Some(candidate) =
        subtask_db::next_claimable(&mut **tx, provider_user_id, config.allow_self_assignment)
            .await?
    else {
        return Ok(None);
    };

    let assignment = apply_claim(
        tx,
        config,
        &candidate,
        provider_user_id,
        device_id,
        web_gpu_preferred,
    )
    .await?;
    Ok(Some(assignment))
}

async fn accept_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    config: &EngineConfig,
    subtask_id: Uuid,
    provider_user_id: &str,
    device_id: &str,
    web_gpu_preferred: bool,
) -> Result<Assignment, EngineError> {
    let subtask = subtask_db::get_subtask_for_update(&mut **tx, subtask_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("subtask {subtask_id}")))?;

    let task = task_db::get_task_for_update(&mut **tx, subtask.task_id)
        .await?
        .ok_or_else(|| EngineError::invalid_state("parent task missing"))?;

    if task.owner_user_id.is_empty() {
        return Err(EngineError::invalid_state("parent task has no owner"));
    }
    if !config.allow_self_assignment && task.owner_user_id == provider_user_id {
        warn!(
            subtask_id = %subtask_id,
            provider = provider_user_id,
            "self-assignment rejected"
        );
        return Err(EngineError::forbidden(
            "providers cannot execute their own tasks",
        ));
    }

    let offerable = subtask.status == SubtaskStatus::Pending
        || (subtask.status == SubtaskStatus::Failed && subtask.requires_reassignment);
    if !offerable {
        return Err(EngineError::invalid_state(format!(
            "subtask is {} and not offerable",
            subtask.status
        )));
    }

    apply_claim(
        tx,
        config,
        &subtask,
        provider_user_id,
        device_id,
        web_gpu_preferred,
    )
    .await
}

/// The atomic claim transition shared by both entry points.
///
/// The candidate row is already locked by the caller's transaction.
async fn apply_claim(
    tx: &mut Transaction<'static, Postgres>,
    config: &EngineConfig,
    candidate: &Subtask,
    provider_user_id: &str,
    device_id: &str,
    web_gpu_preferred: bool,
) -> Result<Assignment, EngineError> {
    let next_heartbeat_due = Utc::now() + config.heartbeat_interval;
    let state = ExecutionState::claimed(provider_user_id, web_gpu_preferred);

    let rows = subtask_db::claim(
        &mut **tx,
        candidate.id,
        provider_user_id,
        device_id,
        next_heartbeat_due,
        &state.to_value(),
    )
    .await?;
    if rows == 0 {
        return Err(EngineError::invalid_state("subtask is no longer offerable"));
    }

    task_db::mark_in_progress(&mut **tx, candidate.task_id).await?;
    let task = task_db::get_task(&mut **tx, candidate.task_id)
        .await?
        .ok_or_else(|| EngineError::invalid_state("parent task missing"))?;

    timeline::append(
        &mut **tx,
        candidate.id,
        TimelineEventType::Assignment,
        "Subtask assigned to provider",
        &json!({
            "providerUserId": provider_user_id,
            "deviceId": device_id,
            "webGpuPreferred": web_gpu_preferred,
        }),
    )
    .await?;

    let subtask = subtask_db::get_subtask(&mut **tx, candidate.id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("subtask {}", candidate.id)))?;

    Ok(Assignment { subtask, task })
}
