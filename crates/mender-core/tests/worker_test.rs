//! Integration tests for the worker: claims, execution, chain advance,
//! and the concurrent-claim race.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::PgPool;

use mender_core::bus::{EventBus, MemoryBus};
use mender_core::events::{Channel, TaskQueued};
use mender_core::handler::{HandlerRegistry, SimulatedWork, TaskHandler, TaskOutcome};
use mender_core::submit::{create_workflow_with_tasks, TaskSpec, WorkflowSpec};
use mender_core::worker::process_task;
use mender_core::{orchestrator::Orchestrator, state};
use mender_db::models::{Task, TaskStatus, WorkflowStatus};
use mender_db::queries::{tasks as task_db, workflows as wf_db};
use mender_test_utils::{create_test_db, drop_test_db};

/// Handler that counts invocations, for the claim-race test.
struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    fn task_type(&self) -> &str {
        "counted"
    }

    async fn execute(&self, _task: &Task) -> TaskOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        TaskOutcome::Success(serde_json::json!({"status": "success", "processed": true}))
    }
}

fn fast_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(SimulatedWork::new("noop").with_work_duration(Duration::from_millis(1)));
    Arc::new(registry)
}

fn queued_event(task: &Task) -> TaskQueued {
    TaskQueued {
        workflow_id: task.workflow_id,
        task_id: task.id,
        task_name: task.name.clone(),
        task_type: task.task_type.clone(),
        payload: task.payload.clone(),
    }
}

fn task_spec(name: &str, payload: serde_json::Value, next_task: Option<&str>) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        task_type: "noop".to_string(),
        payload,
        next_task: next_task.map(str::to_string),
        max_retries: 3,
    }
}

/// Create a workflow, run the orchestrator step, and return the queued
/// entry task.
async fn queue_workflow(pool: &PgPool, bus: &MemoryBus, spec: WorkflowSpec) -> Vec<Task> {
    let (workflow, _) = create_workflow_with_tasks(pool, &spec).await.unwrap();
    let orchestrator = Orchestrator::new(pool.clone(), Arc::new(bus.clone()));
    orchestrator
        .handle_workflow_created(workflow.id)
        .await
        .unwrap();
    task_db::list_tasks_for_workflow(pool, workflow.id).await.unwrap()
}

#[tokio::test]
async fn happy_path_completes_task_and_workflow() {
    let (pool, db_name) = create_test_db().await;
    let bus = MemoryBus::new();

    let tasks = queue_workflow(
        &pool,
        &bus,
        WorkflowSpec {
            name: "single".to_string(),
            tasks: vec![task_spec("only", serde_json::json!({}), None)],
        },
    )
    .await;

    let mut completed = bus.subscribe(&[Channel::TaskCompleted]).await.unwrap();

    process_task(&pool, &bus, &fast_registry(), &queued_event(&tasks[0]))
        .await
        .unwrap();

    let t = task_db::get_task(&pool, tasks[0].id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(
        t.result,
        Some(serde_json::json!({"status": "success", "processed": true}))
    );
    assert_eq!(t.retry_count, 0);

    let wf = wf_db::get_workflow(&pool, t.workflow_id).await.unwrap().unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);

    let message = completed.next().await.expect("task.completed published");
    assert_eq!(message.payload["task_name"], "only");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn chain_advances_to_successor() {
    let (pool, db_name) = create_test_db().await;
    let bus = MemoryBus::new();

    let tasks = queue_workflow(
        &pool,
        &bus,
        WorkflowSpec {
            name: "chain".to_string(),
            tasks: vec![
                task_spec("first", serde_json::json!({}), Some("second")),
                task_spec("second", serde_json::json!({}), None),
            ],
        },
    )
    .await;

    let mut queued = bus.subscribe(&[Channel::TaskQueued]).await.unwrap();
    let registry = fast_registry();

    process_task(&pool, &bus, &registry, &queued_event(&tasks[0]))
        .await
        .unwrap();

    let second = task_db::get_task(&pool, tasks[1].id).await.unwrap().unwrap();
    assert_eq!(second.status, TaskStatus::Queued);

    let wf = wf_db::get_workflow(&pool, tasks[0].workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wf.status, WorkflowStatus::Running, "chain not finished yet");

    // The successor's descriptor goes out on task.queued.
    let message = queued.next().await.expect("successor task.queued");
    assert_eq!(message.payload["task_name"], "second");

    // Finishing the successor completes the workflow.
    process_task(&pool, &bus, &registry, &queued_event(&tasks[1]))
        .await
        .unwrap();

    let wf = wf_db::get_workflow(&pool, tasks[0].workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_workers_execute_exactly_once() {
    let (pool, db_name) = create_test_db().await;
    let bus = MemoryBus::new();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(CountingHandler {
        calls: Arc::clone(&calls),
    });
    let registry = Arc::new(registry);

    let (workflow, tasks) = create_workflow_with_tasks(
        &pool,
        &WorkflowSpec {
            name: "race".to_string(),
            tasks: vec![TaskSpec {
                name: "contested".to_string(),
                task_type: "counted".to_string(),
                payload: serde_json::json!({}),
                next_task: None,
                max_retries: 3,
            }],
        },
    )
    .await
    .unwrap();
    wf_db::transition_workflow_status(
        &pool,
        workflow.id,
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
    )
    .await
    .unwrap();
    state::queue_task(&pool, tasks[0].id).await.unwrap();

    let event = queued_event(&task_db::get_task(&pool, tasks[0].id).await.unwrap().unwrap());

    // Two interchangeable workers race on the same message.
    let h1 = {
        let (pool, bus, registry, event) =
            (pool.clone(), bus.clone(), Arc::clone(&registry), event.clone());
        tokio::spawn(async move { process_task(&pool, &bus, &registry, &event).await })
    };
    let h2 = {
        let (pool, bus, registry, event) =
            (pool.clone(), bus.clone(), Arc::clone(&registry), event.clone());
        tokio::spawn(async move { process_task(&pool, &bus, &registry, &event).await })
    };

    h1.await.unwrap().unwrap();
    h2.await.unwrap().unwrap();

    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "exactly one worker should win the claim and execute"
    );

    let t = task_db::get_task(&pool, tasks[0].id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.retry_count, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_task_message_is_dropped() {
    let (pool, db_name) = create_test_db().await;
    let bus = MemoryBus::new();

    let tasks = queue_workflow(
        &pool,
        &bus,
        WorkflowSpec {
            name: "done-already".to_string(),
            tasks: vec![task_spec("only", serde_json::json!({}), None)],
        },
    )
    .await;
    let registry = fast_registry();
    let event = queued_event(&tasks[0]);

    process_task(&pool, &bus, &registry, &event).await.unwrap();
    let first = task_db::get_task(&pool, tasks[0].id).await.unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::Completed);

    // A duplicate delivery after completion is a no-op.
    process_task(&pool, &bus, &registry, &event).await.unwrap();
    let second = task_db::get_task(&pool, tasks[0].id).await.unwrap().unwrap();
    assert_eq!(second.updated_at, first.updated_at, "no mutation on redelivery");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn handler_failure_records_error_and_publishes() {
    let (pool, db_name) = create_test_db().await;
    let bus = MemoryBus::new();

    let tasks = queue_workflow(
        &pool,
        &bus,
        WorkflowSpec {
            name: "failing".to_string(),
            tasks: vec![task_spec(
                "bad",
                serde_json::json!({"simulate_failure": true}),
                None,
            )],
        },
    )
    .await;

    let mut failed = bus.subscribe(&[Channel::TaskFailed]).await.unwrap();

    process_task(&pool, &bus, &fast_registry(), &queued_event(&tasks[0]))
        .await
        .unwrap();

    let t = task_db::get_task(&pool, tasks[0].id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.error.as_deref(), Some("Simulated Failure"));
    assert!(t.result.is_none());

    // The worker does not decide about retries; the workflow stays running.
    let wf = wf_db::get_workflow(&pool, t.workflow_id).await.unwrap().unwrap();
    assert_eq!(wf.status, WorkflowStatus::Running);

    let message = failed.next().await.expect("task.failed published");
    assert_eq!(message.payload["error"], "Simulated Failure");
    assert_eq!(message.payload["task_id"], t.id.to_string());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unknown_task_type_fails_the_attempt() {
    let (pool, db_name) = create_test_db().await;
    let bus = MemoryBus::new();

    let (workflow, tasks) = create_workflow_with_tasks(
        &pool,
        &WorkflowSpec {
            name: "unhandled".to_string(),
            tasks: vec![TaskSpec {
                name: "alien".to_string(),
                task_type: "quantum_compute".to_string(),
                payload: serde_json::json!({}),
                next_task: None,
                max_retries: 3,
            }],
        },
    )
    .await
    .unwrap();
    let _ = workflow;
    state::queue_task(&pool, tasks[0].id).await.unwrap();

    process_task(&pool, &bus, &fast_registry(), &queued_event(&tasks[0]))
        .await
        .unwrap();

    let t = task_db::get_task(&pool, tasks[0].id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(
        t.error.as_deref().unwrap_or("").contains("quantum_compute"),
        "error should name the unhandled type: {:?}",
        t.error
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn missing_successor_ends_chain_without_failing_workflow() {
    let (pool, db_name) = create_test_db().await;
    let bus = MemoryBus::new();

    // The submission surface rejects dangling references, so build the row
    // directly: a task whose next_task names nothing.
    let workflow = wf_db::insert_workflow(&pool, "dangling").await.unwrap();
    let task = task_db::insert_task(
        &pool,
        workflow.id,
        "head",
        "noop",
        &serde_json::json!({}),
        Some("ghost"),
        3,
    )
    .await
    .unwrap();
    wf_db::transition_workflow_status(
        &pool,
        workflow.id,
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
    )
    .await
    .unwrap();
    state::queue_task(&pool, task.id).await.unwrap();

    process_task(&pool, &bus, &fast_registry(), &queued_event(&task))
        .await
        .unwrap();

    let t = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Completed);

    let wf = wf_db::get_workflow(&pool, workflow.id).await.unwrap().unwrap();
    assert_eq!(
        wf.status,
        WorkflowStatus::Running,
        "workflow is left running when the chain dangles"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
