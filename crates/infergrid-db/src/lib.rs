//! Persistence layer for the infergrid marketplace server.
//!
//! Owns the relational schema (tasks, subtasks, timeline events, ledger
//! entries, users, api keys, devices), the connection pool, runtime
//! migrations, and the query functions the engine crates build on.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
