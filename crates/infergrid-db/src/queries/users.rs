//! Database query functions for the `users` table.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgExecutor;

use crate::models::User;

/// Insert a new user row.
pub async fn insert_user(
    exec: impl PgExecutor<'_>,
    id: &str,
    active: bool,
    balance: Decimal,
    resource_capabilities: Option<&str>,
) -> Result<User> {
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (id, active, balance, resource_capabilities) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(id)
    .bind(active)
    .bind(balance)
    .bind(resource_capabilities)
    .fetch_one(exec)
    .await
    .context("failed to insert user")?;

    Ok(user)
}

/// Fetch a single user by ID.
pub async fn get_user(exec: impl PgExecutor<'_>, id: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch user")?;

    Ok(user)
}

/// Count active users other than the given one.
///
/// Feeds the reassignment decision: a failed subtask goes back to the
/// queue only when alternative peers exist.
pub async fn count_other_active_users(exec: impl PgExecutor<'_>, user_id: &str) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM users WHERE active AND id <> $1")
            .bind(user_id)
            .fetch_one(exec)
            .await
            .context("failed to count other active users")?;

    Ok(row.0)
}

/// Add to a user's balance. Negative amounts debit.
pub async fn adjust_balance(
    exec: impl PgExecutor<'_>,
    id: &str,
    amount: Decimal,
) -> Result<u64> {
    let result = sqlx::query("UPDATE users SET balance = balance + $2 WHERE id = $1")
        .bind(id)
        .bind(amount)
        .execute(exec)
        .await
        .context("failed to adjust user balance")?;

    Ok(result.rows_affected())
}

/// Flip a user's active flag.
pub async fn set_active(exec: impl PgExecutor<'_>, id: &str, active: bool) -> Result<u64> {
    let result = sqlx::query("UPDATE users SET active = $2 WHERE id = $1")
        .bind(id)
        .bind(active)
        .execute(exec)
        .await
        .context("failed to set user active flag")?;

    Ok(result.rows_affected())
}
