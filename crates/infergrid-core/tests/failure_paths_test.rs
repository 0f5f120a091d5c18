//! Integration tests for the failure, reassignment, and device
//! disconnect paths.

mod common;

use infergrid_core::assignment;
use infergrid_core::config::EngineConfig;
use infergrid_core::lifecycle;
use infergrid_db::models::{SubtaskStatus, TaskStatus, TimelineEventType};
use infergrid_db::queries::{subtasks as subtask_db, tasks as task_db, timeline};
use infergrid_test_utils::{create_test_db, drop_test_db};

use common::{seed_subtask, seed_task, seed_user};

#[tokio::test]
async fn failure_with_peers_requeues_for_reassignment() {
    let (pool, db_name) = create_test_db().await;
    let config = EngineConfig::strict();

    // S4: three active providers; p1 fails, at least two others remain.
    seed_user(&pool, "u-req").await;
    seed_user(&pool, "p1").await;
    seed_user(&pool, "p2").await;
    seed_user(&pool, "p3").await;
    let task_id = seed_task(&pool, "u-req", false).await;
    let subtask_id = seed_subtask(&pool, task_id, None).await;
    let other_pending = seed_subtask(&pool, task_id, None).await;

    assignment::try_offer_next(&pool, &config, "p1", "dev-1")
        .await
        .unwrap()
        .unwrap();

    let outcome = lifecycle::fail(&pool, &config, subtask_id, "p1", "oom")
        .await
        .unwrap();
    assert!(outcome.reassigned);
    assert!(!outcome.task_failed);

    let subtask = subtask_db::get_subtask(&pool, subtask_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subtask.status, SubtaskStatus::Pending);
    assert!(subtask.requires_reassignment);
    assert!(subtask.assigned_provider_user_id.is_none());
    assert!(subtask.assigned_device_id.is_none());
    assert_eq!(subtask.progress, 0);

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress, "task stays alive");

    // Audit order: assignment, failure, reassignment-requested.
    let events = timeline::list_for_subtask(&pool, subtask_id).await.unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            TimelineEventType::Assignment,
            TimelineEventType::Failure,
            TimelineEventType::ReassignmentRequested,
        ]
    );

    // The reassignment outranks the other (older) pending subtask.
    let next = assignment::try_offer_next(&pool, &config, "p2", "dev-2")
        .await
        .unwrap()
        .expect("p2 should get work");
    assert_eq!(next.subtask.id, subtask_id);
    assert_ne!(next.subtask.id, other_pending);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failure_without_peers_fails_the_task() {
    let (pool, db_name) = create_test_db().await;
    let config = EngineConfig::strict();

    // S5: besides the failing provider only the requestor is active, so
    // the other-active count is 1, not > 1.
    seed_user(&pool, "u-req").await;
    seed_user(&pool, "p1").await;
    let task_id = seed_task(&pool, "u-req", false).await;
    let subtask_id = seed_subtask(&pool, task_id, None).await;

    assignment::try_offer_next(&pool, &config, "p1", "dev-1")
        .await
        .unwrap()
        .unwrap();

    let outcome = lifecycle::fail(&pool, &config, subtask_id, "p1", "oom")
        .await
        .unwrap();
    assert!(!outcome.reassigned);
    assert!(outcome.task_failed);

    let subtask = subtask_db::get_subtask(&pool, subtask_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subtask.status, SubtaskStatus::Failed);
    assert!(!subtask.requires_reassignment);
    assert_eq!(subtask.failure_reason.as_deref(), Some("oom"));
    assert!(subtask.failed_at.is_some());
    assert!(subtask.next_heartbeat_due.is_none());

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let events = timeline::list_for_subtask(&pool, subtask_id).await.unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            TimelineEventType::Assignment,
            TimelineEventType::Failure,
            TimelineEventType::TaskFailed,
        ]
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn api_filled_task_survives_unreassignable_failure() {
    let (pool, db_name) = create_test_db().await;
    let config = EngineConfig::strict();

    // S6: same as S5 but the task fills bindings via API.
    seed_user(&pool, "u-req").await;
    seed_user(&pool, "p1").await;
    let task_id = seed_task(&pool, "u-req", true).await;
    let subtask_id = seed_subtask(&pool, task_id, None).await;

    assignment::try_offer_next(&pool, &config, "p1", "dev-1")
        .await
        .unwrap()
        .unwrap();

    let outcome = lifecycle::fail(&pool, &config, subtask_id, "p1", "oom")
        .await
        .unwrap();
    assert!(!outcome.reassigned);
    assert!(!outcome.task_failed);

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(
        task.status,
        TaskStatus::InProgress,
        "API-filled tasks stay alive for external retries"
    );

    let task_failed_events =
        timeline::count_for_subtask(&pool, subtask_id, TimelineEventType::TaskFailed)
            .await
            .unwrap();
    assert_eq!(task_failed_events, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn device_disconnect_fails_everything_it_held() {
    let (pool, db_name) = create_test_db().await;
    let config = EngineConfig::strict();

    // S7: p1/dev-1 holds two in-flight subtasks; peers exist for
    // reassignment.
    seed_user(&pool, "u-req").await;
    seed_user(&pool, "p1").await;
    seed_user(&pool, "p2").await;
    seed_user(&pool, "p3").await;
    let task_id = seed_task(&pool, "u-req", false).await;
    let sub_a = seed_subtask(&pool, task_id, None).await;
    let sub_b = seed_subtask(&pool, task_id, None).await;

    assignment::try_offer_next(&pool, &config, "p1", "dev-1")
        .await
        .unwrap()
        .unwrap();
    assignment::try_offer_next(&pool, &config, "p1", "dev-1")
        .await
        .unwrap()
        .unwrap();

    let outcomes = lifecycle::fail_all_for_device(&pool, &config, "dev-1", "p1")
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, o)| o.reassigned));

    for subtask_id in [sub_a, sub_b] {
        let subtask = subtask_db::get_subtask(&pool, subtask_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Pending);
        assert!(subtask.requires_reassignment);
        assert_eq!(
            subtask.failure_reason.as_deref(),
            Some(lifecycle::DISCONNECT_REASON)
        );

        let events = timeline::list_for_subtask(&pool, subtask_id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                TimelineEventType::Assignment,
                TimelineEventType::DeviceDisconnectionFailure,
                TimelineEventType::ReassignmentRequested,
            ]
        );
    }

    // An idle device disconnect sweeps nothing.
    let outcomes = lifecycle::fail_all_for_device(&pool, &config, "dev-1", "p1")
        .await
        .unwrap();
    assert!(outcomes.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}
