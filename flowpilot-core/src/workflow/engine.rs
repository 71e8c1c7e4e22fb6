//! Step-by-step workflow execution engine

use crate::error::{FlowError, FlowResult};
use crate::models::configuration::EngineConfig;
use crate::models::hil::{HilRequest, HilResolution, HilResponse, HilStatus, InputRequest};
use crate::models::workflow::{
    ExecutionError, ExecutionRecord, ExecutionState, ExecutionStatus, Message, MessageRole, StepDefinition,
    SuspendReason, Suspension,
};
use crate::workflow::builtin::HIL_RESPONSE_KEY;
use crate::workflow::checkpoint::{CheckpointStore, ThreadLocks};
use crate::workflow::handler::{HandlerError, HandlerErrorKind, StepOutcome};
use crate::workflow::hil::{HilCoordinator, ResumeSignal};
use crate::workflow::registry::{CompiledWorkflow, ExecutionRegistry};
use crate::workflow::router::{Route, Router};
use chrono::Utc;
use dashmap::DashSet;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

/// Drives executions: route, invoke, checkpoint, repeat
pub struct ExecutionEngine {
    config: EngineConfig,
    registry: Arc<ExecutionRegistry>,
    store: Arc<dyn CheckpointStore>,
    hil: Arc<HilCoordinator>,
    router: Router,
    locks: ThreadLocks,
    /// Executions asked to pause at the next step boundary
    pause_requests: DashSet<Uuid>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<ExecutionRegistry>,
        store: Arc<dyn CheckpointStore>,
        hil: Arc<HilCoordinator>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            hil,
            router: Router::default(),
            locks: ThreadLocks::new(),
            pause_requests: DashSet::new(),
        }
    }

    /// Replace the default keyword router
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn hil(&self) -> &Arc<HilCoordinator> {
        &self.hil
    }

    /// Start a new execution of the latest version of `workflow_id`.
    /// The run continues on its own task; the id is returned once the
    /// initial state is checkpointed.
    pub async fn start(
        self: &Arc<Self>,
        workflow_id: &str,
        input: Value,
        context: Map<String, Value>,
    ) -> FlowResult<Uuid> {
        let compiled = self.registry.workflow(workflow_id)?;
        validate_input(&compiled, &input)?;

        let execution_id = Uuid::new_v4();
        let state = ExecutionState::new(execution_id, &compiled.definition, &input, context);
        self.checkpoint(&state).await?;
        self.registry.record_state(&state);

        tracing::info!(
            "Started execution {} of workflow '{}' v{}",
            execution_id,
            workflow_id,
            compiled.definition.version
        );

        self.spawn_drive(execution_id);
        Ok(execution_id)
    }

    fn spawn_drive(self: &Arc<Self>, execution_id: Uuid) {
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(execution_id).await });
    }

    /// Run an execution from its checkpoint until it is terminal or suspended
    async fn drive(self: Arc<Self>, execution_id: Uuid) {
        let guard = self.locks.acquire(execution_id).await;

        let mut state = match self.store.load(execution_id) {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::warn!("No checkpoint for execution {}", execution_id);
                return;
            }
            Err(err) => {
                tracing::error!("Failed to load execution {}: {}", execution_id, err);
                self.registry.record_failure(execution_id, &err);
                return;
            }
        };
        if state.status.is_terminal() || state.status == ExecutionStatus::AwaitingInput {
            return;
        }

        let outcome = match self
            .registry
            .workflow_version(&state.workflow_id, state.workflow_version)
        {
            Ok(compiled) => self.run_loop(&compiled, &mut state).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            self.fail(&mut state, err).await;
        }

        drop(guard);
        if state.status.is_terminal() {
            self.pause_requests.remove(&execution_id);
            self.locks.forget(execution_id);
        }
    }

    async fn run_loop(
        &self,
        compiled: &CompiledWorkflow,
        state: &mut ExecutionState,
    ) -> FlowResult<()> {
        let execution_id = state.execution_id;
        loop {
            if self.registry.is_cancelled(execution_id) {
                return self.mark_cancelled(state).await;
            }
            if self.pause_requests.remove(&execution_id).is_some() {
                let request = InputRequest::new(
                    "Execution paused",
                    format!("Paused before step '{}'", state.current_step),
                );
                return self.suspend(state, request, SuspendReason::Pause).await;
            }
            if state.iterations >= self.config.max_iterations {
                return Err(FlowError::IterationLimitExceeded(self.config.max_iterations));
            }

            let step = compiled
                .definition
                .step(&state.current_step)
                .ok_or_else(|| {
                    FlowError::Validation(format!(
                        "Step '{}' not found in workflow '{}'",
                        state.current_step, state.workflow_id
                    ))
                })?;

            state.status = ExecutionStatus::Running;
            self.registry.record_state(state);

            let outcome = self.invoke(compiled, step, state).await?;

            // Cancelled while the handler ran: drop its effects
            if self.registry.is_cancelled(execution_id) {
                return self.mark_cancelled(state).await;
            }

            match outcome {
                StepOutcome::Completed(update) => {
                    state.apply_update(&step.id, update);
                    match self.router.route(state, &compiled.definition) {
                        Route::Step(next) => {
                            tracing::debug!(
                                "Execution {}: '{}' -> '{}'",
                                execution_id,
                                step.id,
                                next
                            );
                            state.advance_to(&next);
                            self.checkpoint(state).await?;
                            self.registry.record_state(state);
                        }
                        Route::Terminal => {
                            state.next_step = None;
                            state.escalate = false;
                            state.status = ExecutionStatus::Completed;
                            state.updated_at = Utc::now();
                            self.checkpoint(state).await?;
                            self.registry.record_state(state);
                            tracing::info!(
                                "Execution {} completed after {} step(s)",
                                execution_id,
                                state.iterations
                            );
                            return Ok(());
                        }
                    }
                }
                StepOutcome::Suspended(request) => {
                    return self.suspend(state, request, SuspendReason::Input).await;
                }
            }
        }
    }

    /// Invoke a step handler under its timeout, retrying retryable failures
    async fn invoke(
        &self,
        compiled: &CompiledWorkflow,
        step: &StepDefinition,
        state: &ExecutionState,
    ) -> FlowResult<StepOutcome> {
        let handler = compiled.handler(&step.id).ok_or_else(|| {
            FlowError::Validation(format!("No handler bound to step '{}'", step.id))
        })?;
        let policy = step
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.retry_policy.clone());
        let step_timeout = step
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.step_timeout());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout(step_timeout, handler.execute(state, &step.params)).await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::retryable(
                    HandlerErrorKind::Timeout,
                    format!("Step timed out after {}s", step_timeout.as_secs()),
                )),
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err)
                    if err.retryable
                        && attempt < policy.max_attempts
                        && !self.registry.is_cancelled(state.execution_id) =>
                {
                    let delay = policy.delay_for(attempt - 1);
                    tracing::warn!(
                        "Step '{}' attempt {}/{} failed: {}; retrying in {:?}",
                        step.id,
                        attempt,
                        policy.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(FlowError::Handler {
                        step_id: step.id.clone(),
                        kind: err.kind.to_string(),
                        message: err.message,
                        retryable: err.retryable,
                    })
                }
            }
        }
    }

    /// Persist the suspension, then open the HIL request that will resume it
    async fn suspend(
        &self,
        state: &mut ExecutionState,
        request: InputRequest,
        reason: SuspendReason,
    ) -> FlowResult<()> {
        let hil_request = HilRequest::new(
            Uuid::new_v4(),
            state.execution_id,
            state.workflow_id.clone(),
            state.current_step.clone(),
            request.clone(),
        );
        state.suspension = Some(Suspension {
            request_id: hil_request.id,
            step_id: state.current_step.clone(),
            reason,
            request,
            suspended_at: hil_request.created_at,
        });
        state.status = ExecutionStatus::AwaitingInput;
        state.updated_at = Utc::now();

        self.checkpoint(state).await?;
        self.hil.open(hil_request)?;
        if self.registry.is_cancelled(state.execution_id) {
            // Cancelled before the request was open
            return self.mark_cancelled(state).await;
        }
        self.registry.record_state(state);

        tracing::info!(
            "Execution {} suspended at step '{}' ({:?})",
            state.execution_id,
            state.current_step,
            reason
        );
        Ok(())
    }

    /// Re-enter a suspended execution with the response to its pending request
    pub async fn resume(
        self: &Arc<Self>,
        execution_id: Uuid,
        response: HilResponse,
    ) -> FlowResult<()> {
        {
            let _guard = self.locks.acquire(execution_id).await;
            let mut state = self
                .store
                .load(execution_id)?
                .ok_or_else(|| FlowError::not_found("Execution", execution_id))?;

            if self.registry.is_cancelled(execution_id) || state.status.is_terminal() {
                tracing::debug!("Ignoring response for finished execution {}", execution_id);
                return Ok(());
            }
            if state.status != ExecutionStatus::AwaitingInput {
                return Err(FlowError::Conflict(format!(
                    "Execution {} is not awaiting input",
                    execution_id
                )));
            }
            let suspension = match &state.suspension {
                Some(s) if s.request_id == response.request_id => s.clone(),
                _ => {
                    return Err(FlowError::Conflict(format!(
                        "Response {} does not match the pending request of execution {}",
                        response.request_id, execution_id
                    )))
                }
            };

            if suspension.reason == SuspendReason::Input {
                let value = serde_json::to_value(&response)
                    .map_err(|e| FlowError::Storage(e.to_string()))?;
                state.context.insert(HIL_RESPONSE_KEY.to_string(), value);
            }
            let mut message = Message::new(resume_role(&response), describe_response(&response));
            message.step_id = Some(suspension.step_id.clone());
            state.append_message(message);

            state.suspension = None;
            state.current_step = suspension.step_id;
            state.status = ExecutionStatus::Running;
            self.checkpoint(&state).await?;
            self.registry.record_state(&state);

            tracing::info!(
                "Execution {} resumed at step '{}' ({:?} by {})",
                execution_id,
                state.current_step,
                response.status,
                response.responded_by
            );
        }

        self.spawn_drive(execution_id);
        Ok(())
    }

    /// Consume resume signals from the HIL coordinator
    pub async fn run_resume_dispatcher(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<ResumeSignal>,
    ) {
        while let Some(signal) = signals.recv().await {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.resume(signal.execution_id, signal.response).await {
                    tracing::warn!(
                        "Failed to resume execution {}: {}",
                        signal.execution_id,
                        err
                    );
                }
            });
        }
        tracing::debug!("Resume dispatcher stopped");
    }

    /// Ask a running execution to suspend before its next step
    pub fn pause(&self, execution_id: Uuid) -> FlowResult<ExecutionRecord> {
        let record = self
            .registry
            .get_execution(execution_id)
            .ok_or_else(|| FlowError::not_found("Execution", execution_id))?;
        match record.status {
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                self.pause_requests.insert(execution_id);
                tracing::info!("Pause requested for execution {}", execution_id);
                Ok(record)
            }
            ExecutionStatus::AwaitingInput => Err(FlowError::Conflict(format!(
                "Execution {} is already awaiting input",
                execution_id
            ))),
            status => Err(FlowError::Conflict(format!(
                "Execution {} is {:?}",
                execution_id, status
            ))),
        }
    }

    /// Answer the pending request of an execution on behalf of the API caller.
    /// Input turns the answer into `modified`, otherwise it is `approved`.
    /// A pause that has not taken effect yet is simply withdrawn.
    pub fn resume_with_input(
        &self,
        execution_id: Uuid,
        human_input: Option<Value>,
    ) -> FlowResult<Option<HilResponse>> {
        if self.registry.get_execution(execution_id).is_none() {
            return Err(FlowError::not_found("Execution", execution_id));
        }
        let Some(pending) = self.hil.pending_for_execution(execution_id) else {
            if self.pause_requests.remove(&execution_id).is_some() {
                return Ok(None);
            }
            return Err(FlowError::Conflict(format!(
                "Execution {} is not awaiting input",
                execution_id
            )));
        };

        let resolution = match human_input {
            Some(input) => HilResolution::new(HilStatus::Modified).with_data(input),
            None => HilResolution::new(HilStatus::Approved),
        };
        self.hil
            .respond(pending.id, resolution.by("api"))
            .map(Some)
    }

    /// Mark an execution cancelled. A handler already in flight finishes,
    /// but no further step is dispatched.
    pub fn cancel(self: &Arc<Self>, execution_id: Uuid) -> FlowResult<ExecutionRecord> {
        let changed = self.registry.update_execution(execution_id, |record| {
            record.status = ExecutionStatus::Cancelled;
        });
        if !changed {
            return match self.registry.get_execution(execution_id) {
                Some(record) => Err(FlowError::Conflict(format!(
                    "Execution {} already finished as {:?}",
                    execution_id, record.status
                ))),
                None => Err(FlowError::not_found("Execution", execution_id)),
            };
        }

        self.pause_requests.remove(&execution_id);
        self.hil.cancel_for_execution(execution_id);

        // Persist the cancellation once the thread is free
        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = engine.locks.acquire(execution_id).await;
            match engine.store.load(execution_id) {
                Ok(Some(mut state)) if !state.status.is_terminal() => {
                    if let Err(err) = engine.mark_cancelled(&mut state).await {
                        tracing::warn!("Failed to checkpoint cancellation: {}", err);
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("Failed to load cancelled execution: {}", err),
            }
        });

        tracing::info!("Cancelled execution {}", execution_id);
        self.registry
            .get_execution(execution_id)
            .ok_or_else(|| FlowError::not_found("Execution", execution_id))
    }

    /// Checkpointed state of a thread, or the most recently updated thread
    /// of the workflow when no thread is given
    pub fn get_workflow_state(
        &self,
        workflow_id: &str,
        thread_id: Option<Uuid>,
    ) -> FlowResult<ExecutionState> {
        let state = match thread_id {
            Some(thread_id) => self.store.load_for(workflow_id, thread_id)?,
            None => self
                .store
                .list()?
                .into_iter()
                .filter(|s| s.workflow_id == workflow_id)
                .max_by_key(|s| s.updated_at),
        };
        state.ok_or_else(|| {
            let id = match thread_id {
                Some(thread_id) => format!("{}/{}", workflow_id, thread_id),
                None => workflow_id.to_string(),
            };
            FlowError::not_found("Workflow state", id)
        })
    }

    /// Rebuild records from checkpoints and restart interrupted executions.
    /// Suspended executions get their HIL request back under the same id.
    pub fn recover(self: &Arc<Self>) -> FlowResult<usize> {
        let mut recovered = 0;
        for state in self.store.list()? {
            self.registry.record_state(&state);
            match state.status {
                ExecutionStatus::Pending | ExecutionStatus::Running => {
                    if self
                        .registry
                        .workflow_version(&state.workflow_id, state.workflow_version)
                        .is_err()
                    {
                        tracing::warn!(
                            "Cannot recover execution {}: workflow '{}' v{} is not registered",
                            state.execution_id,
                            state.workflow_id,
                            state.workflow_version
                        );
                        continue;
                    }
                    self.spawn_drive(state.execution_id);
                    recovered += 1;
                }
                ExecutionStatus::AwaitingInput => {
                    let Some(suspension) = &state.suspension else {
                        continue;
                    };
                    let mut request = HilRequest::new(
                        suspension.request_id,
                        state.execution_id,
                        state.workflow_id.clone(),
                        suspension.step_id.clone(),
                        suspension.request.clone(),
                    );
                    request.created_at = suspension.suspended_at;
                    match self.hil.open(request) {
                        Ok(_) => recovered += 1,
                        Err(err) => tracing::warn!(
                            "Cannot reopen request for execution {}: {}",
                            state.execution_id,
                            err
                        ),
                    }
                }
                _ => {}
            }
        }
        if recovered > 0 {
            tracing::info!("Recovered {} execution(s) from checkpoints", recovered);
        }
        Ok(recovered)
    }

    /// Write the state, retrying a bounded number of times
    async fn checkpoint(&self, state: &ExecutionState) -> FlowResult<()> {
        let mut attempt = 0;
        loop {
            match self.store.save(state) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.checkpoint_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Checkpoint of execution {} failed (attempt {}): {}",
                        state.execution_id,
                        attempt,
                        err
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.config.checkpoint_retry_delay_ms,
                    ))
                    .await;
                }
                Err(FlowError::CheckpointWrite(message)) => {
                    return Err(FlowError::CheckpointWrite(message))
                }
                Err(err) => return Err(FlowError::CheckpointWrite(err.to_string())),
            }
        }
    }

    async fn mark_cancelled(&self, state: &mut ExecutionState) -> FlowResult<()> {
        self.hil.cancel_for_execution(state.execution_id);
        state.status = ExecutionStatus::Cancelled;
        state.suspension = None;
        state.updated_at = Utc::now();
        self.checkpoint(state).await
    }

    async fn fail(&self, state: &mut ExecutionState, err: FlowError) {
        tracing::error!("Execution {} failed: {}", state.execution_id, err);
        self.registry.record_failure(state.execution_id, &err);
        if self.registry.is_cancelled(state.execution_id) {
            return;
        }

        // Uncommitted step effects are dropped: the failure is written on
        // top of the last committed snapshot
        if matches!(err, FlowError::CheckpointWrite(_)) {
            match self.store.load(state.execution_id) {
                Ok(Some(committed)) => *state = committed,
                Ok(None) => {}
                Err(load_err) => {
                    tracing::warn!(
                        "Failed to reload execution {} after checkpoint failure: {}",
                        state.execution_id,
                        load_err
                    );
                    state.status = ExecutionStatus::Failed;
                    return;
                }
            }
        }
        state.status = ExecutionStatus::Failed;
        state.suspension = None;
        state.error = Some(ExecutionError::from(&err));
        state.updated_at = Utc::now();
        if let Err(save_err) = self.checkpoint(state).await {
            tracing::warn!(
                "Failed to checkpoint failure of execution {}: {}",
                state.execution_id,
                save_err
            );
        }
    }
}

fn validate_input(compiled: &CompiledWorkflow, input: &Value) -> FlowResult<()> {
    let Some(schema) = &compiled.definition.input_schema else {
        return Ok(());
    };
    let schema = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| FlowError::Validation(format!("Invalid input schema: {}", e)))?;
    if let Err(errors) = schema.validate(input) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(FlowError::Validation(format!(
            "Input rejected: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

fn resume_role(response: &HilResponse) -> MessageRole {
    if response.status == HilStatus::Timeout {
        MessageRole::System
    } else {
        MessageRole::Human
    }
}

fn describe_response(response: &HilResponse) -> String {
    let mut text = match response.response_data.as_ref() {
        Some(Value::String(data)) => data.clone(),
        Some(data) => format!("{:?} by {}: {}", response.status, response.responded_by, data),
        None => format!("{:?} by {}", response.status, response.responded_by),
    };
    if let Some(comments) = &response.comments {
        text.push_str(" (");
        text.push_str(comments);
        text.push(')');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::configuration::HilConfig;
    use crate::models::workflow::{StepDefinition, WorkflowDefinition};
    use crate::workflow::checkpoint::MemoryCheckpointStore;
    use crate::workflow::handler::HandlerRegistry;
    use std::collections::BTreeMap;

    fn engine() -> Arc<ExecutionEngine> {
        let registry = Arc::new(ExecutionRegistry::new(HandlerRegistry::with_builtins()));
        let definition = WorkflowDefinition {
            id: "review".to_string(),
            version: 0,
            description: None,
            entry_step: "review".to_string(),
            steps: vec![StepDefinition::new("review", "approval")],
            escalation_step: None,
            category_routes: BTreeMap::new(),
            input_schema: None,
        };
        registry.register_workflow(definition).unwrap();
        let (hil, _rx) = HilCoordinator::new(HilConfig::default());
        Arc::new(ExecutionEngine::new(
            EngineConfig::default(),
            registry,
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(hil),
        ))
    }

    #[tokio::test]
    async fn test_cancel_closes_request_opened_after_cancellation() {
        let engine = engine();
        let compiled = engine.registry.workflow("review").unwrap();
        let mut state = ExecutionState::new(
            Uuid::new_v4(),
            &compiled.definition,
            &Value::Null,
            Map::new(),
        );
        let id = state.execution_id;
        engine.store.save(&state).unwrap();
        engine.registry.record_state(&state);

        engine.cancel(id).unwrap();
        assert!(engine.hil.pending_for_execution(id).is_none());

        // A suspension racing the cancel opens its request afterwards
        let request = HilRequest::new(
            Uuid::new_v4(),
            id,
            "review".to_string(),
            "review".to_string(),
            InputRequest::new("Publish?", ""),
        );
        state.status = ExecutionStatus::AwaitingInput;
        engine.store.save(&state).unwrap();
        engine.hil.open(request.clone()).unwrap();

        for _ in 0..100 {
            if engine.store.load(id).unwrap().unwrap().status == ExecutionStatus::Cancelled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            engine.store.load(id).unwrap().unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert!(engine.hil.pending_for_execution(id).is_none());
        assert_eq!(engine.hil.get(request.id).unwrap().status, HilStatus::Rejected);
    }
}
