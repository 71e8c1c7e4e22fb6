//! Schedule and schedule execution models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// What causes a schedule to fire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Cron,
    Interval,
    Webhook,
    Event,
    Manual,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Cron => write!(f, "cron"),
            TriggerType::Interval => write!(f, "interval"),
            TriggerType::Webhook => write!(f, "webhook"),
            TriggerType::Event => write!(f, "event"),
            TriggerType::Manual => write!(f, "manual"),
        }
    }
}

/// Validated trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron { expression: String },
    Interval { seconds: u64 },
    Webhook { webhook_id: String },
    Event { event_type: String },
    Manual,
}

impl Trigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Trigger::Cron { .. } => TriggerType::Cron,
            Trigger::Interval { .. } => TriggerType::Interval,
            Trigger::Webhook { .. } => TriggerType::Webhook,
            Trigger::Event { .. } => TriggerType::Event,
            Trigger::Manual => TriggerType::Manual,
        }
    }

    /// Whether the poll loop drives this trigger
    pub fn is_polled(&self) -> bool {
        matches!(self, Trigger::Cron { .. } | Trigger::Interval { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    /// Reached max_executions, never fired again
    Disabled,
    /// Declared with an invalid trigger configuration
    Error,
}

/// A recurring or event-bound workflow trigger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub trigger: Trigger,
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_input: Value,
    pub status: ScheduleStatus,
    pub execution_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u32>,
    /// Allow a new firing while a previous run is still in progress
    pub allow_overlap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type()
    }

    pub fn max_reached(&self) -> bool {
        self.max_executions
            .is_some_and(|max| self.execution_count >= max)
    }
}

fn default_allow_overlap() -> bool {
    true
}

/// Body of a create-schedule call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Value,
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u32>,
    #[serde(default = "default_allow_overlap")]
    pub allow_overlap: bool,
}

/// Partial update of a schedule; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateScheduleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub trigger_config: Option<Value>,
    #[serde(default)]
    pub workflow_input: Option<Value>,
    #[serde(default)]
    pub max_executions: Option<u32>,
    #[serde(default)]
    pub allow_overlap: Option<bool>,
    /// Only `active` and `paused` may be set by callers
    #[serde(default)]
    pub status: Option<ScheduleStatus>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScheduleExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScheduleExecutionStatus::Running)
    }
}

/// One firing of a schedule and the execution it started
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleExecution {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub trigger_type: TriggerType,
    pub triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    pub status: ScheduleExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}
