//! Shared fixtures for flowpilot-core integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flowpilot_core::models::configuration::Configuration;
use flowpilot_core::models::workflow::{
    ExecutionRecord, ExecutionState, ExecutionStatus, MessageRole, RetryPolicy, StepDefinition,
    StepUpdate, WorkflowDefinition,
};
use flowpilot_core::runtime::FlowRuntime;
use flowpilot_core::workflow::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use flowpilot_core::workflow::handler::{
    HandlerError, HandlerErrorKind, HandlerRegistry, StepHandler, StepOutcome,
};
use flowpilot_core::FlowError;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Configuration tuned for fast tests: no poll loop, tiny delays
pub fn test_config() -> Configuration {
    let mut config = Configuration::default();
    config.scheduler.enabled = false;
    config.scheduler.monitor_interval_ms = 10;
    config.scheduler.max_wait_seconds = 5;
    config.engine.checkpoint_retries = 2;
    config.engine.checkpoint_retry_delay_ms = 1;
    config.engine.retry_policy = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        exponential_backoff: false,
        backoff_multiplier: 1.0,
        max_delay_ms: 10,
    };
    config
}

pub fn runtime_with(handlers: HandlerRegistry, config: Configuration) -> Arc<FlowRuntime> {
    FlowRuntime::with_store(config, handlers, Arc::new(MemoryCheckpointStore::new()))
        .expect("runtime")
}

pub fn runtime() -> Arc<FlowRuntime> {
    runtime_with(HandlerRegistry::with_builtins(), test_config())
}

pub fn workflow(id: &str, entry: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        version: 0,
        description: None,
        entry_step: entry.to_string(),
        steps,
        escalation_step: None,
        category_routes: BTreeMap::new(),
        input_schema: None,
    }
}

/// `draft -> review (approval) -> publish`, escalating to `manager`
pub fn approval_workflow(id: &str) -> WorkflowDefinition {
    let mut wf = workflow(
        id,
        "draft",
        vec![
            StepDefinition::new("draft", "echo").then("review"),
            StepDefinition::new("review", "approval")
                .with_params(json!({"title": "Publish draft?", "timeout_minutes": 30}))
                .then("publish"),
            StepDefinition::new("publish", "echo").with_params(json!({"message": "published"})),
            StepDefinition::new("manager", "echo").with_params(json!({"message": "escalated"})),
        ],
    );
    wf.escalation_step = Some("manager".to_string());
    wf
}

/// Two echo steps
pub fn linear_workflow(id: &str) -> WorkflowDefinition {
    workflow(
        id,
        "first",
        vec![
            StepDefinition::new("first", "echo").then("second"),
            StepDefinition::new("second", "echo").with_params(json!({"message": "done"})),
        ],
    )
}

/// Poll until the record reaches `status`
pub async fn wait_for_status(
    runtime: &FlowRuntime,
    execution_id: Uuid,
    status: ExecutionStatus,
) -> ExecutionRecord {
    for _ in 0..500 {
        if let Some(record) = runtime.registry().get_execution(execution_id) {
            if record.status == status {
                return record;
            }
            if record.status.is_terminal() {
                panic!("execution ended as {:?}, expected {:?}", record.status, status);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never reached {:?}", execution_id, status);
}

pub async fn wait_terminal(runtime: &FlowRuntime, execution_id: Uuid) -> ExecutionRecord {
    runtime
        .registry()
        .wait_until_terminal(
            execution_id,
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .expect("record")
}

/// Fails with a retryable error until it has been called `failures + 1` times
pub struct FlakyHandler {
    pub failures: u32,
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl StepHandler for FlakyHandler {
    async fn execute(
        &self,
        _state: &ExecutionState,
        _params: &Value,
    ) -> Result<StepOutcome, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(HandlerError::retryable(
                HandlerErrorKind::External,
                format!("upstream unavailable (call {})", call),
            ));
        }
        Ok(StepOutcome::Completed(
            StepUpdate::new()
                .with_result(json!({"calls": call}))
                .with_message(MessageRole::Assistant, "synced"),
        ))
    }
}

/// Always fails without retry
pub struct BrokenHandler;

#[async_trait]
impl StepHandler for BrokenHandler {
    async fn execute(
        &self,
        _state: &ExecutionState,
        _params: &Value,
    ) -> Result<StepOutcome, HandlerError> {
        Err(HandlerError::fatal(
            HandlerErrorKind::InvalidInput,
            "record is missing an email",
        ))
    }
}

/// Routes back to its own step forever
pub struct LoopHandler;

#[async_trait]
impl StepHandler for LoopHandler {
    async fn execute(
        &self,
        state: &ExecutionState,
        _params: &Value,
    ) -> Result<StepOutcome, HandlerError> {
        Ok(StepOutcome::Completed(
            StepUpdate::new().route_to(state.current_step.clone()),
        ))
    }
}

/// Sleeps for `params.millis` before completing
pub struct SlowHandler;

#[async_trait]
impl StepHandler for SlowHandler {
    async fn execute(
        &self,
        _state: &ExecutionState,
        params: &Value,
    ) -> Result<StepOutcome, HandlerError> {
        let millis = params.get("millis").and_then(Value::as_u64).unwrap_or(50);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(StepOutcome::Completed(
            StepUpdate::new().with_result(json!({"slept_ms": millis})),
        ))
    }
}

/// Accepts the first `successes` saves, then fails `failures` writes
pub struct FailingStore {
    inner: MemoryCheckpointStore,
    successes: u32,
    failures: u32,
    saves: AtomicU32,
}

impl FailingStore {
    /// Every write after the first `successes` fails
    pub fn new(successes: u32) -> Self {
        Self::with_outage(successes, u32::MAX)
    }

    /// Writes fail for a while, then the store recovers
    pub fn with_outage(successes: u32, failures: u32) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            successes,
            failures,
            saves: AtomicU32::new(0),
        }
    }
}

impl CheckpointStore for FailingStore {
    fn save(&self, state: &ExecutionState) -> Result<(), FlowError> {
        let save = self.saves.fetch_add(1, Ordering::SeqCst);
        if save >= self.successes && save - self.successes < self.failures {
            return Err(FlowError::Storage("disk full".to_string()));
        }
        self.inner.save(state)
    }

    fn load(&self, thread_id: Uuid) -> Result<Option<ExecutionState>, FlowError> {
        self.inner.load(thread_id)
    }

    fn list(&self) -> Result<Vec<ExecutionState>, FlowError> {
        self.inner.list()
    }

    fn delete(&self, thread_id: Uuid) -> Result<(), FlowError> {
        self.inner.delete(thread_id)
    }
}
