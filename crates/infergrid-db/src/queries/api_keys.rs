//! Database query functions for the `api_keys` table.
//!
//! Keys are stored as SHA-256 hashes; lookup resolves straight to the
//! owning user so handlers never see key material.

use anyhow::{Context, Result};
use sqlx::PgExecutor;

use crate::models::{ApiKey, User};

/// Insert a new API key hash for a user.
pub async fn insert_api_key(
    exec: impl PgExecutor<'_>,
    user_id: &str,
    key_hash: &str,
    label: &str,
) -> Result<ApiKey> {
    let key = sqlx::query_as::<_, ApiKey>(
        "INSERT INTO api_keys (user_id, key_hash, label) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(user_id)
    .bind(key_hash)
    .bind(label)
    .fetch_one(exec)
    .await
    .context("failed to insert api key")?;

    Ok(key)
}

/// Resolve an unrevoked API key hash to its active owning user.
pub async fn find_user_by_key_hash(
    exec: impl PgExecutor<'_>,
    key_hash: &str,
) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT u.* FROM users u \
         JOIN api_keys k ON k.user_id = u.id \
         WHERE k.key_hash = $1 AND NOT k.revoked AND u.active",
    )
    .bind(key_hash)
    .fetch_optional(exec)
    .await
    .context("failed to resolve api key")?;

    Ok(user)
}

/// Revoke an API key by hash.
pub async fn revoke_api_key(exec: impl PgExecutor<'_>, key_hash: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE api_keys SET revoked = TRUE WHERE key_hash = $1")
        .bind(key_hash)
        .execute(exec)
        .await
        .context("failed to revoke api key")?;

    Ok(result.rows_affected())
}
