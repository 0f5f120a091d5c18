//! Query functions, one module per table family.
//!
//! All functions are generic over [`sqlx::PgExecutor`] so they can run on
//! a pool, a single connection, or inside a caller-owned transaction.
//! Timeline and ledger writes in particular must join the transaction of
//! the lifecycle operation that produced them.

pub mod api_keys;
pub mod devices;
pub mod ledger;
pub mod subtasks;
pub mod tasks;
pub mod timeline;
pub mod users;
