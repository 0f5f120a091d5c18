//! Seed helpers shared by the engine integration tests.

#![allow(dead_code)]

use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use infergrid_db::models::TaskType;
use infergrid_db::queries::{subtasks as subtask_db, tasks as task_db, users as user_db};

/// Insert an active user with a zero balance.
pub async fn seed_user(pool: &PgPool, id: &str) {
    seed_user_with(pool, id, true, Decimal::ZERO, None).await;
}

pub async fn seed_user_with(
    pool: &PgPool,
    id: &str,
    active: bool,
    balance: Decimal,
    capabilities: Option<&str>,
) {
    user_db::insert_user(pool, id, active, balance, capabilities)
        .await
        .expect("failed to insert user");
}

/// Insert an inference task for an owner.
pub async fn seed_task(pool: &PgPool, owner: &str, fill_bindings_via_api: bool) -> Uuid {
    let task = task_db::insert_task(
        pool,
        None,
        owner,
        TaskType::Inference,
        "blob://models/resnet50.onnx",
        fill_bindings_via_api,
    )
    .await
    .expect("failed to insert task");
    task.id
}

/// Insert a pending subtask with an optional quoted cost.
pub async fn seed_subtask(pool: &PgPool, task_id: Uuid, cost: Option<Decimal>) -> Uuid {
    let subtask = subtask_db::insert_subtask(
        pool,
        None,
        task_id,
        &json!({"bindings": [{"tensorName": "input", "fileUrl": "blob://inputs/t0"}]}),
        cost,
    )
    .await
    .expect("failed to insert subtask");
    subtask.id
}
