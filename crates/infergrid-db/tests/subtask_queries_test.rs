//! Integration tests for the subtask and timeline query functions.
//!
//! Each test creates a unique temporary database, runs migrations, and
//! drops it on completion so tests are fully isolated and idempotent.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use infergrid_db::models::{SubtaskStatus, TaskType, TimelineEventType};
use infergrid_db::queries::{subtasks as subtask_db, tasks as task_db, timeline, users as user_db};
use infergrid_test_utils::{create_test_db, drop_test_db};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

async fn seed_user(pool: &PgPool, id: &str) {
    user_db::insert_user(pool, id, true, Decimal::ZERO, None)
        .await
        .expect("failed to insert user");
}

async fn seed_task(pool: &PgPool, owner: &str) -> Uuid {
    let task = task_db::insert_task(
        pool,
        None,
        owner,
        TaskType::Inference,
        "blob://models/resnet.onnx",
        false,
    )
    .await
    .expect("failed to insert task");
    task.id
}

async fn seed_subtask(pool: &PgPool, task_id: Uuid) -> Uuid {
    let subtask = subtask_db::insert_subtask(pool, None, task_id, &json!({}), None)
        .await
        .expect("failed to insert subtask");
    subtask.id
}

fn exec_state() -> serde_json::Value {
    json!({"phase": "executing"})
}

// ---------------------------------------------------------------------------
// Claim selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn next_claimable_prefers_reassignments_then_oldest() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "requestor").await;
    let task_id = seed_task(&pool, "requestor").await;

    let first = seed_subtask(&pool, task_id).await;
    let second = seed_subtask(&pool, task_id).await;

    // Initially the oldest pending row wins.
    let picked = subtask_db::next_claimable(&pool, "provider", false)
        .await
        .unwrap()
        .expect("should find a claimable subtask");
    assert_eq!(picked.id, first);

    // Push the second subtask through claim -> failure -> reassignment.
    let due = Utc::now() + Duration::minutes(5);
    subtask_db::claim(&pool, second, "provider", "dev-1", due, &exec_state())
        .await
        .unwrap();
    subtask_db::record_failure(&pool, second, "oom", &exec_state())
        .await
        .unwrap();
    subtask_db::clear_for_reassignment(&pool, second).await.unwrap();

    // Now the reassignment outranks the older pending row.
    let picked = subtask_db::next_claimable(&pool, "provider", false)
        .await
        .unwrap()
        .expect("should find a claimable subtask");
    assert_eq!(picked.id, second);
    assert!(picked.requires_reassignment);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn next_claimable_skips_own_tasks() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "alice").await;
    let task_id = seed_task(&pool, "alice").await;
    seed_subtask(&pool, task_id).await;

    let picked = subtask_db::next_claimable(&pool, "alice", false).await.unwrap();
    assert!(picked.is_none(), "owner must not see their own subtask");

    // The debug bypass makes it visible again.
    let picked = subtask_db::next_claimable(&pool, "alice", true).await.unwrap();
    assert!(picked.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Claim transition
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_stamps_assignment_fields() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "requestor").await;
    seed_user(&pool, "provider").await;
    let task_id = seed_task(&pool, "requestor").await;
    let subtask_id = seed_subtask(&pool, task_id).await;

    let due = Utc::now() + Duration::minutes(5);
    let rows = subtask_db::claim(&pool, subtask_id, "provider", "dev-1", due, &exec_state())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let s = subtask_db::get_subtask(&pool, subtask_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(s.status, SubtaskStatus::Executing);
    assert_eq!(s.assigned_provider_user_id.as_deref(), Some("provider"));
    assert_eq!(s.assigned_device_id.as_deref(), Some("dev-1"));
    assert!(s.assigned_at.is_some());
    assert!(s.started_at.is_some());
    assert!(s.last_heartbeat_at.is_some());
    assert!(s.next_heartbeat_due.is_some());
    assert_eq!(s.progress, 0);
    assert!(!s.requires_reassignment);

    // A second claim must not fire: the row is no longer offerable.
    let rows = subtask_db::claim(&pool, subtask_id, "other", "dev-2", due, &exec_state())
        .await
        .unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_after_reassignment_clears_failure_breadcrumb() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "requestor").await;
    seed_user(&pool, "p1").await;
    seed_user(&pool, "p2").await;
    let task_id = seed_task(&pool, "requestor").await;
    let subtask_id = seed_subtask(&pool, task_id).await;

    let due = Utc::now() + Duration::minutes(5);
    subtask_db::claim(&pool, subtask_id, "p1", "dev-1", due, &exec_state())
        .await
        .unwrap();
    subtask_db::record_failure(&pool, subtask_id, "oom", &exec_state())
        .await
        .unwrap();
    subtask_db::clear_for_reassignment(&pool, subtask_id).await.unwrap();

    // The breadcrumb survives reassignment...
    let s = subtask_db::get_subtask(&pool, subtask_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(s.status, SubtaskStatus::Pending);
    assert!(s.requires_reassignment);
    assert!(s.assigned_provider_user_id.is_none());
    assert_eq!(s.failure_reason.as_deref(), Some("oom"));

    // ...until the next claim wipes it.
    subtask_db::claim(&pool, subtask_id, "p2", "dev-2", due, &exec_state())
        .await
        .unwrap();
    let s = subtask_db::get_subtask(&pool, subtask_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(s.status, SubtaskStatus::Executing);
    assert!(s.failure_reason.is_none());
    assert!(s.failed_at.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Progress and completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_never_decreases() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "requestor").await;
    seed_user(&pool, "provider").await;
    let task_id = seed_task(&pool, "requestor").await;
    let subtask_id = seed_subtask(&pool, task_id).await;

    let due = Utc::now() + Duration::minutes(5);
    subtask_db::claim(&pool, subtask_id, "provider", "dev-1", due, &exec_state())
        .await
        .unwrap();

    subtask_db::record_progress(&pool, subtask_id, 60, due, &exec_state())
        .await
        .unwrap();
    subtask_db::record_progress(&pool, subtask_id, 40, due, &exec_state())
        .await
        .unwrap();

    let s = subtask_db::get_subtask(&pool, subtask_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(s.progress, 60, "stale lower report must not win");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn completion_applies_metrics_and_seals_row() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "requestor").await;
    seed_user(&pool, "provider").await;
    let task_id = seed_task(&pool, "requestor").await;
    let subtask_id = seed_subtask(&pool, task_id).await;

    let due = Utc::now() + Duration::minutes(5);
    subtask_db::claim(&pool, subtask_id, "provider", "dev-1", due, &exec_state())
        .await
        .unwrap();

    let results = json!({"outputs": []});
    let cost = Decimal::new(25, 2);
    let rows = subtask_db::record_completion(
        &pool,
        subtask_id,
        &results,
        Some(12.5),
        Some(cost),
        &exec_state(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let s = subtask_db::get_subtask(&pool, subtask_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(s.status, SubtaskStatus::Completed);
    assert_eq!(s.progress, 100);
    assert_eq!(s.duration_seconds, Some(12.5));
    assert_eq!(s.cost, Some(cost));
    assert!(s.completed_at.is_some());
    assert!(s.next_heartbeat_due.is_none());
    assert!(subtask_db::all_completed_for_task(&pool, task_id)
        .await
        .unwrap());

    // Terminal rows reject further completion.
    let rows = subtask_db::record_completion(&pool, subtask_id, &results, None, None, &exec_state())
        .await
        .unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Device sweep and heartbeat queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn device_sweep_sees_only_active_rows() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "requestor").await;
    seed_user(&pool, "provider").await;
    let task_id = seed_task(&pool, "requestor").await;
    let executing = seed_subtask(&pool, task_id).await;
    let completed = seed_subtask(&pool, task_id).await;

    let due = Utc::now() + Duration::minutes(5);
    subtask_db::claim(&pool, executing, "provider", "dev-1", due, &exec_state())
        .await
        .unwrap();
    subtask_db::claim(&pool, completed, "provider", "dev-1", due, &exec_state())
        .await
        .unwrap();
    subtask_db::record_completion(&pool, completed, &json!({}), None, None, &exec_state())
        .await
        .unwrap();

    let mut tx = pool.begin().await.unwrap();
    let active = subtask_db::list_active_for_device(&mut *tx, "dev-1")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, executing);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn heartbeat_expiry_query_honours_deadline() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "requestor").await;
    seed_user(&pool, "provider").await;
    let task_id = seed_task(&pool, "requestor").await;
    let fresh = seed_subtask(&pool, task_id).await;
    let stale = seed_subtask(&pool, task_id).await;

    subtask_db::claim(
        &pool,
        fresh,
        "provider",
        "dev-1",
        Utc::now() + Duration::minutes(5),
        &exec_state(),
    )
    .await
    .unwrap();
    subtask_db::claim(
        &pool,
        stale,
        "provider",
        "dev-1",
        Utc::now() - Duration::minutes(1),
        &exec_state(),
    )
    .await
    .unwrap();

    let expired = subtask_db::list_heartbeat_expired(&pool, Utc::now())
        .await
        .unwrap();
    let ids: Vec<Uuid> = expired.iter().map(|s| s.id).collect();
    assert!(ids.contains(&stale));
    assert!(!ids.contains(&fresh));

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeline_appends_in_order() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "requestor").await;
    let task_id = seed_task(&pool, "requestor").await;
    let subtask_id = seed_subtask(&pool, task_id).await;

    timeline::append(
        &pool,
        subtask_id,
        TimelineEventType::Assignment,
        "Assigned to provider",
        &json!({"providerUserId": "provider"}),
    )
    .await
    .unwrap();
    timeline::append(
        &pool,
        subtask_id,
        TimelineEventType::Progress,
        "Progress 50%",
        &json!({"progressPercentage": 50}),
    )
    .await
    .unwrap();

    let events = timeline::list_for_subtask(&pool, subtask_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, TimelineEventType::Assignment);
    assert_eq!(events[1].event_type, TimelineEventType::Progress);

    let count = timeline::count_for_subtask(&pool, subtask_id, TimelineEventType::Progress)
        .await
        .unwrap();
    assert_eq!(count, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}
