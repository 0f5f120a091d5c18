//! Integration tests for the heartbeat monitor sweep.

mod common;

use std::time::Duration;

use infergrid_core::assignment;
use infergrid_core::config::EngineConfig;
use infergrid_core::heartbeat;
use infergrid_core::lifecycle;
use infergrid_db::models::{SubtaskStatus, TimelineEventType};
use infergrid_db::queries::{subtasks as subtask_db, timeline};
use infergrid_test_utils::{create_test_db, drop_test_db};

use common::{seed_subtask, seed_task, seed_user};

#[tokio::test]
async fn sweep_fails_expired_and_spares_fresh() {
    let (pool, db_name) = create_test_db().await;

    seed_user(&pool, "u-req").await;
    seed_user(&pool, "p1").await;
    seed_user(&pool, "p2").await;
    seed_user(&pool, "p3").await;
    let task_id = seed_task(&pool, "u-req", false).await;
    let stale = seed_subtask(&pool, task_id, None).await;
    let fresh = seed_subtask(&pool, task_id, None).await;

    // Claim the first subtask with a zero heartbeat interval so its
    // deadline is already in the past, then the second with the normal
    // five-minute window.
    let expired_config = EngineConfig {
        heartbeat_interval: Duration::ZERO,
        ..EngineConfig::strict()
    };
    let a = assignment::try_offer_next(&pool, &expired_config, "p1", "dev-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.subtask.id, stale);

    let config = EngineConfig::strict();
    let b = assignment::try_offer_next(&pool, &config, "p1", "dev-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.subtask.id, fresh);

    let failed = heartbeat::sweep_once(&pool, &config).await.unwrap();
    assert_eq!(failed, 1);

    // The stale subtask went down the failure path with the synthetic
    // reason, and peers exist, so it is queued for reassignment.
    let subtask = subtask_db::get_subtask(&pool, stale).await.unwrap().unwrap();
    assert_eq!(subtask.status, SubtaskStatus::Pending);
    assert!(subtask.requires_reassignment);
    assert_eq!(
        subtask.failure_reason.as_deref(),
        Some(lifecycle::HEARTBEAT_TIMEOUT_REASON)
    );

    let failures = timeline::count_for_subtask(&pool, stale, TimelineEventType::Failure)
        .await
        .unwrap();
    assert_eq!(failures, 1, "heartbeat timeout uses the failure event");

    // The fresh subtask is untouched.
    let subtask = subtask_db::get_subtask(&pool, fresh).await.unwrap().unwrap();
    assert_eq!(subtask.status, SubtaskStatus::Executing);

    // A second sweep finds nothing.
    let failed = heartbeat::sweep_once(&pool, &config).await.unwrap();
    assert_eq!(failed, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn sweep_is_noop_on_empty_queue() {
    let (pool, db_name) = create_test_db().await;

    let config = EngineConfig::strict();
    let failed = heartbeat::sweep_once(&pool, &config).await.unwrap();
    assert_eq!(failed, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
