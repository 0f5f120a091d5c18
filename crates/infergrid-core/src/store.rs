//! Transactional store helpers.
//!
//! Work claims and ledger writes run under serializable isolation.
//! PostgreSQL aborts one of two conflicting serializable transactions
//! with SQLSTATE 40001; callers drive a retry loop over a
//! [`RetryBudget`], re-running the whole operation on a fresh
//! transaction with a short jittered backoff so racing claimants
//! de-synchronize.
//!
//! The shape every engine operation follows:
//!
//! ```ignore
//! let mut budget = RetryBudget::new(config.max_serialization_retries);
//! loop {
//!     let mut tx = store::begin_serializable(pool).await?;
//!     match operation_in_tx(&mut tx, ...).await {
//!         Ok(value) => {
//!             if store::commit_serializable(tx).await? {
//!                 return Ok(value);
//!             }
//!         }
//!         Err(err) => store::rollback_for_retry(tx, err).await?,
//!     }
//!     budget.step().await?;
//! }
//! ```

use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::error::{EngineError, sqlx_error_is_conflict};

/// Maximum jitter applied between serialization-conflict retries.
const MAX_BACKOFF_MS: u64 = 50;

/// Open a transaction and raise it to serializable isolation.
///
/// The transaction rolls back on drop unless committed, so every exit
/// path releases it.
pub async fn begin_serializable(
    pool: &PgPool,
) -> Result<Transaction<'static, Postgres>, EngineError> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await
        .context("failed to raise transaction isolation level")?;
    Ok(tx)
}

/// Commit a serializable transaction.
///
/// Returns `Ok(true)` on success and `Ok(false)` when the commit lost a
/// serialization race and the operation should be retried. Any other
/// commit failure propagates.
pub async fn commit_serializable(
    tx: Transaction<'static, Postgres>,
) -> Result<bool, EngineError> {
    match tx.commit().await {
        Ok(()) => Ok(true),
        Err(err) if sqlx_error_is_conflict(&err) => {
            debug!("serialization conflict at commit");
            Ok(false)
        }
        Err(err) => Err(EngineError::Other(
            anyhow::Error::new(err).context("failed to commit transaction"),
        )),
    }
}

/// Roll back after an in-transaction error.
///
/// Serialization conflicts return `Ok(())` so the caller's loop retries;
/// everything else propagates unchanged.
pub async fn rollback_for_retry(
    tx: Transaction<'static, Postgres>,
    err: EngineError,
) -> Result<(), EngineError> {
    let _ = tx.rollback().await;
    if err.is_serialization_conflict() {
        debug!("serialization conflict, retrying");
        Ok(())
    } else {
        Err(err)
    }
}

/// Bounded retry counter with jittered backoff.
#[derive(Debug)]
pub struct RetryBudget {
    attempt: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { attempt: 0, max }
    }

    /// Consume one retry, sleeping the jitter, or surface
    /// [`EngineError::Conflict`] once the budget is spent.
    pub async fn step(&mut self) -> Result<(), EngineError> {
        if self.attempt >= self.max {
            return Err(EngineError::Conflict);
        }
        self.attempt += 1;
        let millis = rand::rng().random_range(1..=MAX_BACKOFF_MS);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(())
    }
}
