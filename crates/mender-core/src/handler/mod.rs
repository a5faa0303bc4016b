//! The `TaskHandler` trait -- the adapter interface for task execution
//! semantics -- and the registry workers dispatch through.
//!
//! Each concrete handler implements one `task_type`. The trait is
//! object-safe so handlers can be stored as `Box<dyn TaskHandler>` in the
//! [`HandlerRegistry`]. Failure is an explicit outcome variant, not a
//! panic or an error: infrastructure errors belong to the worker, task
//! failures belong to the retry pipeline.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use mender_db::models::Task;

/// Outcome of a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task succeeded; the value is written to the task's `result`.
    Success(serde_json::Value),
    /// The task failed; the reason is written to the task's `error` and
    /// the retry engine decides what happens next.
    Failure(String),
}

/// Adapter interface for executing tasks of a given type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The `task_type` tag this handler serves (e.g. "http_request").
    fn task_type(&self) -> &str;

    /// Execute the task. The handler sees the full row, so it can read the
    /// payload and the attempt number (`retry_count`).
    async fn execute(&self, task: &Task) -> TaskOutcome;
}

// Compile-time assertion: TaskHandler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};

/// A collection of registered [`TaskHandler`] implementations, keyed by
/// task type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// The handler is stored under [`TaskHandler::task_type`]. If a handler
    /// with the same type is already registered, it is replaced and the old
    /// one is returned.
    pub fn register(&mut self, handler: impl TaskHandler + 'static) -> Option<Box<dyn TaskHandler>> {
        let task_type = handler.task_type().to_string();
        self.handlers.insert(task_type, Box::new(handler))
    }

    /// Look up a handler by task type.
    pub fn get(&self, task_type: &str) -> Option<&dyn TaskHandler> {
        self.handlers.get(task_type).map(|b| b.as_ref())
    }

    /// List the registered task types.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// Return the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Return `true` if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reference handler
// ---------------------------------------------------------------------------

/// Reference handler: succeeds after a bounded simulated work duration,
/// unless the payload asks for failure.
///
/// Two payload knobs drive the failure modes:
/// - `simulate_failure: true` -- every attempt fails.
/// - `fail_times: N` -- attempts fail while `retry_count < N`, then
///   succeed, which exercises the retry engine end to end.
pub struct SimulatedWork {
    task_type: String,
    work_duration: Duration,
}

impl SimulatedWork {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            work_duration: Duration::from_secs(1),
        }
    }

    /// Override the simulated work duration (tests use a short one).
    pub fn with_work_duration(mut self, duration: Duration) -> Self {
        self.work_duration = duration;
        self
    }
}

#[async_trait]
impl TaskHandler for SimulatedWork {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, task: &Task) -> TaskOutcome {
        tokio::time::sleep(self.work_duration).await;

        if task.payload["simulate_failure"].as_bool() == Some(true) {
            return TaskOutcome::Failure("Simulated Failure".to_string());
        }

        if let Some(fail_times) = task.payload["fail_times"].as_i64() {
            if i64::from(task.retry_count) < fail_times {
                return TaskOutcome::Failure(format!(
                    "Simulated Failure (attempt {} of {} failing)",
                    task.retry_count + 1,
                    fail_times
                ));
            }
        }

        TaskOutcome::Success(serde_json::json!({"status": "success", "processed": true}))
    }
}
