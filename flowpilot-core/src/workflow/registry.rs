//! Workflow definitions and execution bookkeeping shared by the engine,
//! the scheduler and the HTTP layer

use crate::error::{FlowError, FlowResult};
use crate::models::schedule::{ScheduleExecution, ScheduleExecutionStatus};
use crate::models::workflow::{
    ExecutionError, ExecutionRecord, ExecutionState, ExecutionStatus, WorkflowDefinition,
};
use crate::workflow::handler::{HandlerRegistry, StepHandler};
use crate::workflow::validator::WorkflowValidator;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A registered workflow version with its handlers resolved
pub struct CompiledWorkflow {
    pub definition: WorkflowDefinition,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl CompiledWorkflow {
    /// Handler bound to `step_id` at registration time
    pub fn handler(&self, step_id: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_id).cloned()
    }
}

/// Index of workflow versions, execution records and schedule executions
pub struct ExecutionRegistry {
    handlers: HandlerRegistry,
    workflows: DashMap<String, Vec<Arc<CompiledWorkflow>>>,
    executions: DashMap<Uuid, ExecutionRecord>,
    schedule_executions: DashMap<Uuid, ScheduleExecution>,
}

impl ExecutionRegistry {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            handlers,
            workflows: DashMap::new(),
            executions: DashMap::new(),
            schedule_executions: DashMap::new(),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Validate and register a definition as the next version of its id.
    /// Earlier versions stay available to the executions that use them.
    pub fn register_workflow(
        &self,
        mut definition: WorkflowDefinition,
    ) -> FlowResult<Arc<CompiledWorkflow>> {
        let warnings = WorkflowValidator::validate_workflow(&definition, &self.handlers)
            .into_result()?;
        for warning in warnings {
            tracing::warn!("Workflow '{}': {}", definition.id, warning);
        }

        let mut handlers = HashMap::new();
        for step in &definition.steps {
            let handler = self.handlers.get(&step.handler).ok_or_else(|| {
                FlowError::Validation(format!("Handler '{}' is not registered", step.handler))
            })?;
            handlers.insert(step.id.clone(), handler);
        }

        let mut versions = self.workflows.entry(definition.id.clone()).or_default();
        definition.version = versions.last().map_or(1, |w| w.definition.version + 1);
        let compiled = Arc::new(CompiledWorkflow {
            definition,
            handlers,
        });
        versions.push(compiled.clone());

        tracing::info!(
            "Registered workflow '{}' version {}",
            compiled.definition.id,
            compiled.definition.version
        );
        Ok(compiled)
    }

    /// Latest version of a workflow
    pub fn workflow(&self, workflow_id: &str) -> FlowResult<Arc<CompiledWorkflow>> {
        self.workflows
            .get(workflow_id)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| FlowError::not_found("Workflow", workflow_id))
    }

    pub fn workflow_version(
        &self,
        workflow_id: &str,
        version: u32,
    ) -> FlowResult<Arc<CompiledWorkflow>> {
        self.workflows
            .get(workflow_id)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|w| w.definition.version == version)
                    .cloned()
            })
            .ok_or_else(|| {
                FlowError::not_found("Workflow", format!("{}@v{}", workflow_id, version))
            })
    }

    pub fn has_workflow(&self, workflow_id: &str) -> bool {
        self.workflows.contains_key(workflow_id)
    }

    /// Latest definition of every workflow, sorted by id
    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut workflows: Vec<WorkflowDefinition> = self
            .workflows
            .iter()
            .filter_map(|entry| entry.value().last().map(|w| w.definition.clone()))
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    pub fn insert_execution(&self, record: ExecutionRecord) {
        self.executions.insert(record.execution_id, record);
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.executions.get(&execution_id).map(|r| r.clone())
    }

    /// Mutate a record unless it is already terminal. Returns whether it changed.
    pub fn update_execution<F>(&self, execution_id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        let Some(mut record) = self.executions.get_mut(&execution_id) else {
            return false;
        };
        if record.status.is_terminal() {
            return false;
        }
        f(&mut record);
        record.updated_at = Utc::now();
        if record.status.is_terminal() && record.ended_at.is_none() {
            record.ended_at = Some(record.updated_at);
        }
        true
    }

    /// Mirror a checkpointed state into its record, creating it if needed
    pub fn record_state(&self, state: &ExecutionState) {
        if !self.executions.contains_key(&state.execution_id) {
            self.executions
                .entry(state.execution_id)
                .or_insert_with(|| ExecutionRecord::from_state(state));
            return;
        }
        self.update_execution(state.execution_id, |record| {
            record.status = state.status;
            record.current_step = state.current_step.clone();
            if state.last_result.is_some() {
                record.result = state.last_result.clone();
            }
        });
    }

    /// Move a record to `failed` with the error attached
    pub fn record_failure(&self, execution_id: Uuid, error: &FlowError) -> bool {
        self.update_execution(execution_id, |record| {
            record.status = ExecutionStatus::Failed;
            record.error = Some(ExecutionError::from(error));
        })
    }

    pub fn is_cancelled(&self, execution_id: Uuid) -> bool {
        self.executions
            .get(&execution_id)
            .is_some_and(|r| r.status == ExecutionStatus::Cancelled)
    }

    /// Records, optionally filtered by workflow, newest first
    pub fn list_executions(&self, workflow_id: Option<&str>) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .iter()
            .filter(|r| workflow_id.map_or(true, |id| r.workflow_id == id))
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    /// Poll a record until it is terminal or `max_wait` elapses.
    /// Returns the latest record either way.
    pub async fn wait_until_terminal(
        &self,
        execution_id: Uuid,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> FlowResult<ExecutionRecord> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let record = self
                .get_execution(execution_id)
                .ok_or_else(|| FlowError::not_found("Execution", execution_id))?;
            if record.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(record);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub fn insert_schedule_execution(&self, execution: ScheduleExecution) {
        self.schedule_executions.insert(execution.id, execution);
    }

    pub fn get_schedule_execution(&self, id: Uuid) -> Option<ScheduleExecution> {
        self.schedule_executions.get(&id).map(|e| e.clone())
    }

    /// Finalize a schedule execution. Terminal records are never rewritten.
    pub fn finish_schedule_execution(
        &self,
        id: Uuid,
        status: ScheduleExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let Some(mut execution) = self.schedule_executions.get_mut(&id) else {
            return false;
        };
        if execution.status.is_terminal() {
            return false;
        }
        execution.status = status;
        execution.result = result;
        execution.error = error;
        execution.completed_at = Some(Utc::now());
        true
    }

    /// Schedule execution history, newest first
    pub fn schedule_history(
        &self,
        schedule_id: Option<Uuid>,
        limit: usize,
    ) -> Vec<ScheduleExecution> {
        let mut history: Vec<ScheduleExecution> = self
            .schedule_executions
            .iter()
            .filter(|e| schedule_id.map_or(true, |id| e.schedule_id == id))
            .map(|e| e.clone())
            .collect();
        history.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        history.truncate(limit);
        history
    }
}
