//! Monetary settlement of a completed subtask.
//!
//! Settlement is called inside the completion transaction so balance
//! movement, ledger rows, and the status flip commit or roll back as
//! one. Provider and requestor balances move by exact decimal amounts;
//! no floating point touches money.

use rust_decimal::Decimal;
use sqlx::PgConnection;
use tracing::info;

use infergrid_db::models::{
    Earning, EarningStatus, Subtask, Task, Withdrawal, WithdrawalStatus,
};
use infergrid_db::queries::{ledger as ledger_db, tasks as task_db, users as user_db};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// The pair of ledger rows a settlement produced.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub earning: Earning,
    pub withdrawal: Withdrawal,
}

/// Settle a completed subtask on the caller's open transaction.
///
/// Credits the provider by `cost`, debits the requestor by
/// `cost * margin`, and records one paid Earning plus one settled
/// Withdrawal. Fails with `InvalidState` when the subtask has no cost or
/// either party is missing.
pub async fn settle(
    conn: &mut PgConnection,
    config: &EngineConfig,
    subtask: &Subtask,
    task: &Task,
) -> Result<Settlement, EngineError> {
    let cost = subtask
        .cost
        .ok_or_else(|| EngineError::invalid_state("subtask has no cost to settle"))?;

    let provider_id = subtask
        .assigned_provider_user_id
        .as_deref()
        .ok_or_else(|| EngineError::invalid_state("subtask has no assigned provider"))?;

    let provider = user_db::get_user(&mut *conn, provider_id)
        .await?
        .ok_or_else(|| EngineError::invalid_state("provider user missing"))?;
    let requestor = user_db::get_user(&mut *conn, &task.owner_user_id)
        .await?
        .ok_or_else(|| EngineError::invalid_state("requestor user missing"))?;

    let gross: Decimal = cost * config.requestor_margin_ratio;

    user_db::adjust_balance(&mut *conn, &provider.id, cost).await?;
    user_db::adjust_balance(&mut *conn, &requestor.id, -gross).await?;

    let earning = ledger_db::insert_earning(
        &mut *conn,
        &provider.id,
        task.id,
        subtask.id,
        cost,
        EarningStatus::Paid,
    )
    .await?;
    let withdrawal = ledger_db::insert_withdrawal(
        &mut *conn,
        &requestor.id,
        task.id,
        subtask.id,
        gross,
        WithdrawalStatus::Settled,
    )
    .await?;

    task_db::add_cost(&mut *conn, task.id, cost).await?;

    info!(
        subtask_id = %subtask.id,
        provider = %provider.id,
        requestor = %requestor.id,
        amount = %cost,
        gross = %gross,
        "subtask settled"
    );

    Ok(Settlement {
        earning,
        withdrawal,
    })
}
