//! Database query functions for the `earnings` and `withdrawals` tables.
//!
//! Both are append-only mirrors of a settlement: one provider-side
//! earning and one requestor-side withdrawal per completed subtask.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{Earning, EarningStatus, Withdrawal, WithdrawalStatus};

/// Insert a provider earning.
pub async fn insert_earning(
    exec: impl PgExecutor<'_>,
    provider_user_id: &str,
    task_id: Uuid,
    subtask_id: Uuid,
    amount: Decimal,
    status: EarningStatus,
) -> Result<Earning> {
    let earning = sqlx::query_as::<_, Earning>(
        "INSERT INTO earnings (provider_user_id, task_id, subtask_id, amount, status) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(provider_user_id)
    .bind(task_id)
    .bind(subtask_id)
    .bind(amount)
    .bind(status)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to insert earning for subtask {subtask_id}"))?;

    Ok(earning)
}

/// Insert a requestor withdrawal.
pub async fn insert_withdrawal(
    exec: impl PgExecutor<'_>,
    requestor_user_id: &str,
    task_id: Uuid,
    subtask_id: Uuid,
    amount: Decimal,
    status: WithdrawalStatus,
) -> Result<Withdrawal> {
    let withdrawal = sqlx::query_as::<_, Withdrawal>(
        "INSERT INTO withdrawals (requestor_user_id, task_id, subtask_id, amount, status) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(requestor_user_id)
    .bind(task_id)
    .bind(subtask_id)
    .bind(amount)
    .bind(status)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to insert withdrawal for subtask {subtask_id}"))?;

    Ok(withdrawal)
}

/// List earnings recorded against a subtask.
pub async fn list_earnings_for_subtask(
    exec: impl PgExecutor<'_>,
    subtask_id: Uuid,
) -> Result<Vec<Earning>> {
    let earnings = sqlx::query_as::<_, Earning>(
        "SELECT * FROM earnings WHERE subtask_id = $1 ORDER BY created_at ASC",
    )
    .bind(subtask_id)
    .fetch_all(exec)
    .await
    .context("failed to list earnings for subtask")?;

    Ok(earnings)
}

/// List withdrawals recorded against a subtask.
pub async fn list_withdrawals_for_subtask(
    exec: impl PgExecutor<'_>,
    subtask_id: Uuid,
) -> Result<Vec<Withdrawal>> {
    let withdrawals = sqlx::query_as::<_, Withdrawal>(
        "SELECT * FROM withdrawals WHERE subtask_id = $1 ORDER BY created_at ASC",
    )
    .bind(subtask_id)
    .fetch_all(exec)
    .await
    .context("failed to list withdrawals for subtask")?;

    Ok(withdrawals)
}
