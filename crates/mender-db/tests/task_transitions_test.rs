//! Integration tests for task state queries: conditional transitions,
//! claims, retry requeue guards, and the stale sweep query.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use mender_db::models::{Task, TaskStatus};
use mender_db::queries::{tasks as db, workflows as wf_db};
use mender_test_utils::{create_test_db, drop_test_db};

async fn create_test_workflow(pool: &PgPool) -> Uuid {
    wf_db::insert_workflow(pool, "test-workflow")
        .await
        .expect("failed to insert test workflow")
        .id
}

async fn create_test_task(pool: &PgPool, workflow_id: Uuid, name: &str, max_retries: i32) -> Task {
    db::insert_task(
        pool,
        workflow_id,
        name,
        "noop",
        &serde_json::json!({}),
        None,
        max_retries,
    )
    .await
    .expect("failed to insert test task")
}

#[tokio::test]
async fn insert_sets_defaults() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let task = create_test_task(&pool, wf_id, "defaults", 3).await;

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.max_retries, 3);
    assert!(task.result.is_none());
    assert!(task.error.is_none());
    assert!(task.next_task.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn transition_cas_applies_once() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let task = create_test_task(&pool, wf_id, "cas", 3).await;

    let rows = db::transition_task_status(&pool, task.id, TaskStatus::Pending, TaskStatus::Queued)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Replay of the same transition conflicts.
    let rows = db::transition_task_status(&pool, task.id, TaskStatus::Pending, TaskStatus::Queued)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let t = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Queued);
    assert!(t.updated_at > task.updated_at, "updated_at should advance");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_accepts_queued_and_pending() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;

    // A pending task can be claimed directly.
    let pending = create_test_task(&pool, wf_id, "claim-pending", 3).await;
    assert_eq!(db::claim_task(&pool, pending.id).await.unwrap(), 1);

    // A queued task can be claimed.
    let queued = create_test_task(&pool, wf_id, "claim-queued", 3).await;
    db::transition_task_status(&pool, queued.id, TaskStatus::Pending, TaskStatus::Queued)
        .await
        .unwrap();
    assert_eq!(db::claim_task(&pool, queued.id).await.unwrap(), 1);

    // A running task cannot be claimed again.
    assert_eq!(db::claim_task(&pool, queued.id).await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_claims_resolve_to_one_winner() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let task = create_test_task(&pool, wf_id, "race", 3).await;
    db::transition_task_status(&pool, task.id, TaskStatus::Pending, TaskStatus::Queued)
        .await
        .unwrap();

    let pool2 = pool.clone();
    let pool3 = pool.clone();
    let id = task.id;
    let h1 = tokio::spawn(async move { db::claim_task(&pool2, id).await });
    let h2 = tokio::spawn(async move { db::claim_task(&pool3, id).await });

    let rows1 = h1.await.unwrap().unwrap();
    let rows2 = h2.await.unwrap().unwrap();
    assert_eq!(
        rows1 + rows2,
        1,
        "exactly one concurrent claim should win (got {rows1} and {rows2})"
    );

    let t = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Running);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn complete_records_result() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let task = create_test_task(&pool, wf_id, "complete", 3).await;
    db::claim_task(&pool, task.id).await.unwrap();

    let result_value = serde_json::json!({"status": "success", "processed": true});
    let rows = db::complete_task(&pool, task.id, &result_value).await.unwrap();
    assert_eq!(rows, 1);

    let t = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.result, Some(result_value));

    // Completing a completed task conflicts.
    let rows = db::complete_task(&pool, task.id, &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fail_records_error() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let task = create_test_task(&pool, wf_id, "fail", 3).await;
    db::claim_task(&pool, task.id).await.unwrap();

    let rows = db::fail_task(&pool, task.id, "boom").await.unwrap();
    assert_eq!(rows, 1);

    let t = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.error.as_deref(), Some("boom"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn requeue_increments_and_clears_error() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let task = create_test_task(&pool, wf_id, "requeue", 3).await;
    db::claim_task(&pool, task.id).await.unwrap();
    db::fail_task(&pool, task.id, "transient").await.unwrap();

    let rows = db::requeue_for_retry(&pool, task.id, 0).await.unwrap();
    assert_eq!(rows, 1);

    let t = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Queued);
    assert_eq!(t.retry_count, 1);
    assert!(t.error.is_none(), "error should be cleared on requeue");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn requeue_guards_on_observed_retry_count() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let task = create_test_task(&pool, wf_id, "requeue-guard", 3).await;
    db::claim_task(&pool, task.id).await.unwrap();
    db::fail_task(&pool, task.id, "transient").await.unwrap();

    // A requeue based on a stale observation conflicts.
    let rows = db::requeue_for_retry(&pool, task.id, 2).await.unwrap();
    assert_eq!(rows, 0);

    let t = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.retry_count, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn requeue_refuses_beyond_budget() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let task = create_test_task(&pool, wf_id, "budget", 1).await;

    // Attempt 1 fails, retry to attempt 2.
    db::claim_task(&pool, task.id).await.unwrap();
    db::fail_task(&pool, task.id, "e1").await.unwrap();
    assert_eq!(db::requeue_for_retry(&pool, task.id, 0).await.unwrap(), 1);

    // Attempt 2 fails; budget (max_retries = 1) is spent.
    db::claim_task(&pool, task.id).await.unwrap();
    db::fail_task(&pool, task.id, "e2").await.unwrap();
    assert_eq!(db::requeue_for_retry(&pool, task.id, 1).await.unwrap(), 0);

    let t = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.retry_count, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stale_sweep_sees_only_old_running_tasks() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let stale = create_test_task(&pool, wf_id, "stale", 3).await;
    let fresh = create_test_task(&pool, wf_id, "fresh", 3).await;
    let idle = create_test_task(&pool, wf_id, "idle", 3).await;

    db::claim_task(&pool, stale.id).await.unwrap();
    db::claim_task(&pool, fresh.id).await.unwrap();
    let _ = idle; // stays pending

    // Backdate the stale task's updated_at past the cutoff.
    sqlx::query("UPDATE tasks SET updated_at = NOW() - INTERVAL '120 seconds' WHERE id = $1")
        .bind(stale.id)
        .execute(&pool)
        .await
        .unwrap();

    let cutoff = Utc::now() - ChronoDuration::seconds(30);
    let found = db::list_stale_running(&pool, cutoff).await.unwrap();
    let ids: Vec<Uuid> = found.iter().map(|t| t.id).collect();
    assert!(ids.contains(&stale.id), "backdated running task is stale");
    assert!(!ids.contains(&fresh.id), "recently-claimed task is not stale");
    assert!(!ids.contains(&idle.id), "pending task is never stale");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn find_task_by_name_scopes_to_workflow() {
    let (pool, db_name) = create_test_db().await;

    let wf_a = create_test_workflow(&pool).await;
    let wf_b = wf_db::insert_workflow(&pool, "other").await.unwrap().id;
    let task = create_test_task(&pool, wf_a, "shared-name", 3).await;
    create_test_task(&pool, wf_b, "shared-name", 3).await;

    let found = db::find_task_by_name(&pool, wf_a, "shared-name")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, task.id);

    let missing = db::find_task_by_name(&pool, wf_a, "absent").await.unwrap();
    assert!(missing.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn workflow_progress_counts_by_status() {
    let (pool, db_name) = create_test_db().await;

    let wf_id = create_test_workflow(&pool).await;
    let a = create_test_task(&pool, wf_id, "a", 3).await;
    let b = create_test_task(&pool, wf_id, "b", 3).await;
    create_test_task(&pool, wf_id, "c", 3).await;

    db::claim_task(&pool, a.id).await.unwrap();
    db::complete_task(&pool, a.id, &serde_json::json!({})).await.unwrap();
    db::claim_task(&pool, b.id).await.unwrap();

    let progress = db::get_workflow_progress(&pool, wf_id).await.unwrap();
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.running, 1);
    assert_eq!(progress.pending, 1);
    assert_eq!(progress.total, 3);

    pool.close().await;
    drop_test_db(&db_name).await;
}
