//! Workflow orchestration data models

use crate::error::FlowError;
use crate::models::hil::InputRequest;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Execution status shared by execution records and checkpointed state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, first step not dispatched yet
    Pending,
    /// A step handler is (or is about to be) in flight
    Running,
    /// Suspended on a pending HIL request
    AwaitingInput,
    /// Router returned terminal
    Completed,
    /// Fatal handler, iteration or system error
    Failed,
    /// Cancelled by an operator
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Workflow definition - an immutable, versioned graph of steps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Workflow identifier, stable across versions
    pub id: String,
    /// Assigned by the registry when the definition is registered
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Step executed first
    pub entry_step: String,
    /// Ordered step definitions
    pub steps: Vec<StepDefinition>,
    /// Step that receives every escalated execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_step: Option<String>,
    /// Classifier category to step id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub category_routes: BTreeMap<String, String>,
    /// JSON schema the run input must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl WorkflowDefinition {
    /// Parse a definition from YAML
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow definition YAML")
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn has_step(&self, step_id: &str) -> bool {
        self.step(step_id).is_some()
    }
}

/// A single step of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    /// Unique within the workflow
    pub id: String,
    /// Name of the registered handler implementation
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Admissible outgoing steps. Structural metadata, checked by the validator only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,
    /// Run the content classifier after this step
    #[serde(default)]
    pub classify: bool,
    /// Fallback step when no override or category applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next: Option<String>,
    /// Static parameters passed to the handler
    #[serde(default)]
    pub params: Value,
    /// Handler timeout; the engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler: handler.into(),
            description: None,
            routes: Vec::new(),
            classify: false,
            default_next: None,
            params: Value::Null,
            timeout_seconds: None,
            retry_policy: None,
        }
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        let next = next.into();
        if !self.routes.contains(&next) {
            self.routes.push(next.clone());
        }
        self.default_next = Some(next);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Retry policy for retryable handler errors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (1-10)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub exponential_backoff: bool,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            exponential_backoff: true,
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = if self.exponential_backoff {
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32)
        } else {
            self.initial_delay_ms as f64
        };
        Duration::from_millis((delay_ms as u64).min(self.max_delay_ms))
    }
}

/// Author of a history message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Human,
}

/// Entry of the append-only execution history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    /// Step that produced the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            step_id: None,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What put an execution to sleep
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    /// A handler returned `Suspended`; the step is re-run with the response
    #[default]
    Input,
    /// An operator paused the execution before the step was dispatched
    Pause,
}

/// Checkpointed record of why an execution is suspended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suspension {
    /// Id of the HIL request opened for this suspension
    pub request_id: Uuid,
    pub step_id: String,
    #[serde(default)]
    pub reason: SuspendReason,
    pub request: InputRequest,
    pub suspended_at: DateTime<Utc>,
}

/// Context key a step may set to pick the category route of its own
/// classification. Consumed when the execution advances.
pub const CATEGORY_KEY: &str = "category";

/// Full execution state, owned by the engine while a step runs and
/// checkpointed between steps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionState {
    /// Execution id, doubling as the thread id
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub current_step: String,
    /// Append-only history
    pub messages: Vec<Message>,
    /// Free-form context shared between steps
    pub context: Map<String, Value>,
    /// One-shot routing override set by the last step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default)]
    pub escalate: bool,
    pub status: ExecutionStatus,
    /// Number of completed step invocations
    #[serde(default)]
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    /// Set when the execution failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Fresh state positioned at the workflow entry step
    pub fn new(
        execution_id: Uuid,
        workflow: &WorkflowDefinition,
        input: &Value,
        mut context: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        let mut messages = Vec::new();
        if let Some(text) = input_text(input) {
            messages.push(Message::new(MessageRole::User, text));
        }
        context.insert("input".to_string(), input.clone());

        Self {
            execution_id,
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            current_step: workflow.entry_step.clone(),
            messages,
            context,
            next_step: None,
            escalate: false,
            status: ExecutionStatus::Pending,
            iterations: 0,
            last_result: None,
            suspension: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn thread_id(&self) -> String {
        self.execution_id.to_string()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Merge a step's update. History only grows; a `null` context value removes the key.
    pub fn apply_update(&mut self, step_id: &str, update: StepUpdate) {
        for mut message in update.messages {
            if message.step_id.is_none() {
                message.step_id = Some(step_id.to_string());
            }
            self.messages.push(message);
        }
        for (key, value) in update.context {
            if value.is_null() {
                self.context.remove(&key);
            } else {
                self.context.insert(key, value);
            }
        }
        if update.result.is_some() {
            self.last_result = update.result;
        }
        self.next_step = update.next_step;
        self.escalate |= update.escalate;
        self.iterations += 1;
        self.updated_at = Utc::now();
    }

    /// Move to the routed step, consuming the one-shot overrides
    pub fn advance_to(&mut self, step_id: &str) {
        self.current_step = step_id.to_string();
        self.next_step = None;
        self.escalate = false;
        self.context.remove(CATEGORY_KEY);
        self.updated_at = Utc::now();
    }

    pub fn append_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }
}

fn input_text(input: &Value) -> Option<String> {
    match input {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => Some(
            ["message", "query", "text"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| input.to_string()),
        ),
        other => Some(other.to_string()),
    }
}

/// Delta a handler returns for a completed step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    pub result: Option<Value>,
    pub messages: Vec<Message>,
    pub context: Map<String, Value>,
    pub next_step: Option<String>,
    pub escalate: bool,
}

impl StepUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_message(mut self, role: MessageRole, content: impl Into<String>) -> Self {
        self.messages.push(Message::new(role, content));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn route_to(mut self, step_id: impl Into<String>) -> Self {
        self.next_step = Some(step_id.into());
        self
    }

    pub fn escalate(mut self) -> Self {
        self.escalate = true;
        self
    }
}

/// Error attached to an execution record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

impl From<&FlowError> for ExecutionError {
    fn from(err: &FlowError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            occurred_at: Utc::now(),
        }
    }
}

/// Registry entry for one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub current_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn from_state(state: &ExecutionState) -> Self {
        Self {
            execution_id: state.execution_id,
            workflow_id: state.workflow_id.clone(),
            workflow_version: state.workflow_version,
            status: state.status,
            current_step: state.current_step.clone(),
            result: state.last_result.clone(),
            error: state.error.clone(),
            started_at: state.created_at,
            ended_at: state.status.is_terminal().then_some(state.updated_at),
            updated_at: state.updated_at,
        }
    }
}
