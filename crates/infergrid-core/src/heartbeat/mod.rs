//! Heartbeat monitor: fails subtasks whose devices went quiet.
//!
//! A single periodic sweep finds every assigned/executing subtask whose
//! heartbeat deadline has passed and pushes it down the normal failure
//! path with a synthetic reason, so reassignment and task finalization
//! behave exactly as if the device had reported the failure itself.

use chrono::Utc;
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use infergrid_db::queries::subtasks as subtask_db;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lifecycle;

/// Run the monitor until the cancellation token fires.
pub async fn run(pool: PgPool, config: EngineConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.heartbeat_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        sweep_secs = config.heartbeat_sweep_interval.as_secs(),
        "heartbeat monitor started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("heartbeat monitor stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        match sweep_once(&pool, &config).await {
            Ok(0) => {}
            Ok(count) => info!(count, "heartbeat sweep failed stale subtasks"),
            Err(err) => warn!(error = %err, "heartbeat sweep errored"),
        }
    }
}

/// One sweep pass. Returns how many subtasks were failed.
pub async fn sweep_once(pool: &PgPool, config: &EngineConfig) -> Result<usize, EngineError> {
    let expired = subtask_db::list_heartbeat_expired(pool, Utc::now()).await?;
    let mut failed = 0;

    for subtask in expired {
        let Some(provider) = subtask.assigned_provider_user_id.clone() else {
            continue;
        };
        match lifecycle::fail(
            pool,
            config,
            subtask.id,
            &provider,
            lifecycle::HEARTBEAT_TIMEOUT_REASON,
        )
        .await
        {
            Ok(outcome) => {
                failed += 1;
                info!(
                    subtask_id = %subtask.id,
                    reassigned = outcome.reassigned,
                    "subtask failed on heartbeat timeout"
                );
            }
            // The subtask finished or moved between the sweep query and
            // the fail; nothing to do.
            Err(EngineError::InvalidState(_)) | Err(EngineError::Forbidden(_)) => {}
            Err(err) => {
                warn!(subtask_id = %subtask.id, error = %err, "failed to expire subtask");
            }
        }
    }

    Ok(failed)
}
