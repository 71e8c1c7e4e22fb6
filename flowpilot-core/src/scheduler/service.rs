//! Schedule management, the poll loop and event-bound triggers

use crate::error::{FlowError, FlowResult};
use crate::models::configuration::SchedulerConfig;
use crate::models::schedule::{
    CreateScheduleRequest, Schedule, ScheduleExecution, ScheduleExecutionStatus, ScheduleStatus,
    Trigger, TriggerType, UpdateScheduleRequest,
};
use crate::models::workflow::ExecutionStatus;
use crate::scheduler::trigger::{next_execution, parse_trigger, trigger_config};
use crate::workflow::engine::ExecutionEngine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where the input of a firing comes from
#[derive(Debug, Clone)]
enum FireInput {
    /// The schedule's configured input
    Configured,
    /// Payload merged over the configured input
    Merge(Value),
    /// Replaces the configured input
    Replace(Value),
}

/// Owns schedules and turns triggers into executions
pub struct Scheduler {
    config: SchedulerConfig,
    engine: Arc<ExecutionEngine>,
    schedules: DashMap<Uuid, Schedule>,
    /// Schedule id -> number of started executions not yet terminal
    running: DashMap<Uuid, u32>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        engine: Arc<ExecutionEngine>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            engine,
            schedules: DashMap::new(),
            running: DashMap::new(),
            shutdown,
        }
    }

    pub fn create_schedule(&self, request: CreateScheduleRequest) -> FlowResult<Schedule> {
        self.create_schedule_at(request, Utc::now())
    }

    /// Validate and register a schedule, computing its first fire time from `now`
    pub fn create_schedule_at(
        &self,
        request: CreateScheduleRequest,
        now: DateTime<Utc>,
    ) -> FlowResult<Schedule> {
        if request.name.trim().is_empty() {
            return Err(FlowError::Validation(
                "Schedule name cannot be empty".to_string(),
            ));
        }
        if request.max_executions == Some(0) {
            return Err(FlowError::Validation(
                "max_executions must be at least 1".to_string(),
            ));
        }
        if !self.engine.registry().has_workflow(&request.workflow_id) {
            return Err(FlowError::Validation(format!(
                "Workflow '{}' is not registered",
                request.workflow_id
            )));
        }
        let trigger = parse_trigger(request.trigger_type, &request.trigger_config)?;

        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: request.name,
            next_execution: next_execution(&trigger, now),
            trigger,
            workflow_id: request.workflow_id,
            workflow_input: request.workflow_input,
            status: ScheduleStatus::Active,
            execution_count: 0,
            max_executions: request.max_executions,
            allow_overlap: request.allow_overlap,
            last_execution: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.schedules.insert(schedule.id, schedule.clone());

        tracing::info!(
            "Created {} schedule '{}' ({}) for workflow '{}'",
            schedule.trigger_type(),
            schedule.name,
            schedule.id,
            schedule.workflow_id
        );
        Ok(schedule)
    }

    /// Register configured schedules. Invalid ones are kept with status `error`.
    pub fn load_declared(&self, requests: Vec<CreateScheduleRequest>) -> Vec<Schedule> {
        requests
            .into_iter()
            .map(|request| match self.create_schedule(request.clone()) {
                Ok(schedule) => schedule,
                Err(err) => {
                    tracing::warn!("Declared schedule '{}' is invalid: {}", request.name, err);
                    let now = Utc::now();
                    let schedule = Schedule {
                        id: Uuid::new_v4(),
                        name: request.name,
                        trigger: Trigger::Manual,
                        workflow_id: request.workflow_id,
                        workflow_input: request.workflow_input,
                        status: ScheduleStatus::Error,
                        execution_count: 0,
                        max_executions: request.max_executions,
                        allow_overlap: request.allow_overlap,
                        last_execution: None,
                        next_execution: None,
                        last_error: Some(err.to_string()),
                        created_at: now,
                        updated_at: now,
                    };
                    self.schedules.insert(schedule.id, schedule.clone());
                    schedule
                }
            })
            .collect()
    }

    pub fn get_schedule(&self, schedule_id: Uuid) -> FlowResult<Schedule> {
        self.schedules
            .get(&schedule_id)
            .map(|s| s.clone())
            .ok_or_else(|| FlowError::not_found("Schedule", schedule_id))
    }

    /// All schedules, oldest first
    pub fn list_schedules(&self) -> Vec<Schedule> {
        let mut schedules: Vec<Schedule> = self.schedules.iter().map(|s| s.clone()).collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        schedules
    }

    pub fn update_schedule(
        &self,
        schedule_id: Uuid,
        update: UpdateScheduleRequest,
    ) -> FlowResult<Schedule> {
        let mut schedule = self
            .schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| FlowError::not_found("Schedule", schedule_id))?;
        let now = Utc::now();

        // Validate everything before touching the entry
        let trigger = if update.trigger_type.is_some() || update.trigger_config.is_some() {
            let trigger_type = update.trigger_type.unwrap_or(schedule.trigger_type());
            let config = update
                .trigger_config
                .clone()
                .unwrap_or_else(|| trigger_config(&schedule.trigger));
            Some(parse_trigger(trigger_type, &config)?)
        } else {
            None
        };
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(FlowError::Validation(
                    "Schedule name cannot be empty".to_string(),
                ));
            }
        }
        if update.max_executions == Some(0) {
            return Err(FlowError::Validation(
                "max_executions must be at least 1".to_string(),
            ));
        }
        match update.status {
            None | Some(ScheduleStatus::Paused) => {}
            Some(ScheduleStatus::Active) => {
                if schedule.status == ScheduleStatus::Error && trigger.is_none() {
                    return Err(FlowError::Validation(
                        "Schedule has an invalid trigger; supply a new trigger to activate it"
                            .to_string(),
                    ));
                }
                let max = update.max_executions.or(schedule.max_executions);
                if max.is_some_and(|max| schedule.execution_count >= max) {
                    return Err(FlowError::Conflict(format!(
                        "Schedule {} already reached its max executions",
                        schedule_id
                    )));
                }
            }
            Some(status) => {
                return Err(FlowError::Validation(format!(
                    "Status {:?} cannot be set directly",
                    status
                )))
            }
        }

        if let Some(name) = update.name {
            schedule.name = name;
        }
        if let Some(input) = update.workflow_input {
            schedule.workflow_input = input;
        }
        if let Some(max) = update.max_executions {
            schedule.max_executions = Some(max);
        }
        if let Some(allow_overlap) = update.allow_overlap {
            schedule.allow_overlap = allow_overlap;
        }
        let retimed = trigger.is_some() || update.status == Some(ScheduleStatus::Active);
        if let Some(trigger) = trigger {
            schedule.trigger = trigger;
            schedule.last_error = None;
        }
        if let Some(status) = update.status {
            schedule.status = status;
        }
        if retimed {
            schedule.next_execution = next_execution(&schedule.trigger, now);
        }
        if schedule.max_reached() && schedule.status == ScheduleStatus::Active {
            schedule.status = ScheduleStatus::Disabled;
        }
        schedule.updated_at = now;

        tracing::info!("Updated schedule {} ({:?})", schedule_id, schedule.status);
        Ok(schedule.clone())
    }

    pub fn delete_schedule(&self, schedule_id: Uuid) -> FlowResult<Schedule> {
        let (_, schedule) = self
            .schedules
            .remove(&schedule_id)
            .ok_or_else(|| FlowError::not_found("Schedule", schedule_id))?;
        tracing::info!("Deleted schedule '{}' ({})", schedule.name, schedule_id);
        Ok(schedule)
    }

    /// Fire one schedule: claim the firing under the schedule's entry lock,
    /// start the execution and record it
    async fn fire(
        self: &Arc<Self>,
        schedule_id: Uuid,
        origin: TriggerType,
        input: FireInput,
        now: DateTime<Utc>,
    ) -> FlowResult<ScheduleExecution> {
        let (workflow_id, workflow_input) = {
            let mut schedule = self
                .schedules
                .get_mut(&schedule_id)
                .ok_or_else(|| FlowError::not_found("Schedule", schedule_id))?;

            if schedule.status != ScheduleStatus::Active {
                return Err(FlowError::Conflict(format!(
                    "Schedule {} is {:?}",
                    schedule_id, schedule.status
                )));
            }
            if schedule.max_reached() {
                schedule.status = ScheduleStatus::Disabled;
                return Err(FlowError::Conflict(format!(
                    "Schedule {} reached its max executions",
                    schedule_id
                )));
            }
            if !schedule.allow_overlap && self.running_count(schedule_id) > 0 {
                return Err(FlowError::Conflict(format!(
                    "Schedule {} still has a run in progress",
                    schedule_id
                )));
            }

            schedule.execution_count += 1;
            schedule.last_execution = Some(now);
            if origin == schedule.trigger_type() && schedule.trigger.is_polled() {
                schedule.next_execution = next_execution(&schedule.trigger, now);
            }
            if schedule.max_reached() {
                schedule.status = ScheduleStatus::Disabled;
                schedule.next_execution = None;
                tracing::info!(
                    "Schedule '{}' disabled after {} execution(s)",
                    schedule.name,
                    schedule.execution_count
                );
            }
            schedule.updated_at = now;
            *self.running.entry(schedule_id).or_insert(0) += 1;

            let workflow_input = match input {
                FireInput::Configured => schedule.workflow_input.clone(),
                FireInput::Merge(payload) => merge_input(&schedule.workflow_input, payload),
                FireInput::Replace(input) => input,
            };
            (schedule.workflow_id.clone(), workflow_input)
        };

        let mut context = Map::new();
        context.insert("schedule_id".to_string(), json!(schedule_id));
        context.insert("trigger_type".to_string(), json!(origin));

        let mut record = ScheduleExecution {
            id: Uuid::new_v4(),
            schedule_id,
            trigger_type: origin,
            triggered_at: now,
            execution_id: None,
            status: ScheduleExecutionStatus::Running,
            result: None,
            error: None,
            completed_at: None,
        };

        match self.engine.start(&workflow_id, workflow_input, context).await {
            Ok(execution_id) => {
                record.execution_id = Some(execution_id);
                self.engine.registry().insert_schedule_execution(record.clone());
                tracing::info!(
                    "Schedule {} fired ({}), execution {}",
                    schedule_id,
                    origin,
                    execution_id
                );
                self.spawn_monitor(schedule_id, record.id, execution_id);
            }
            Err(err) => {
                tracing::warn!("Schedule {} failed to start its workflow: {}", schedule_id, err);
                record.status = ScheduleExecutionStatus::Failed;
                record.error = Some(err.to_string());
                record.completed_at = Some(Utc::now());
                self.engine.registry().insert_schedule_execution(record.clone());
                self.release(schedule_id);
                if let Some(mut schedule) = self.schedules.get_mut(&schedule_id) {
                    schedule.last_error = Some(err.to_string());
                }
            }
        }
        Ok(record)
    }

    /// Track an execution until it is terminal and finalize its schedule execution
    fn spawn_monitor(self: &Arc<Self>, schedule_id: Uuid, record_id: Uuid, execution_id: Uuid) {
        let scheduler = self.clone();
        let interval = Duration::from_millis(self.config.monitor_interval_ms.max(1));
        tokio::spawn(async move {
            let registry = scheduler.engine.registry().clone();
            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(execution) = registry.get_execution(execution_id) else {
                    registry.finish_schedule_execution(
                        record_id,
                        ScheduleExecutionStatus::Failed,
                        None,
                        Some("Execution record disappeared".to_string()),
                    );
                    break;
                };
                let status = match execution.status {
                    ExecutionStatus::Completed => ScheduleExecutionStatus::Completed,
                    ExecutionStatus::Failed => ScheduleExecutionStatus::Failed,
                    ExecutionStatus::Cancelled => ScheduleExecutionStatus::Cancelled,
                    _ => continue,
                };
                registry.finish_schedule_execution(
                    record_id,
                    status,
                    execution.result.clone(),
                    execution.error.map(|e| e.message),
                );
                tracing::debug!(
                    "Schedule execution {} finished as {:?}",
                    record_id,
                    status
                );
                break;
            }
            scheduler.release(schedule_id);
        });
    }

    fn running_count(&self, schedule_id: Uuid) -> u32 {
        self.running.get(&schedule_id).map_or(0, |count| *count)
    }

    fn release(&self, schedule_id: Uuid) {
        if let Some(mut count) = self.running.get_mut(&schedule_id) {
            *count = count.saturating_sub(1);
        }
        self.running.remove_if(&schedule_id, |_, count| *count == 0);
    }

    /// Fire every active polled schedule due at `now`
    pub async fn run_due_at(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Vec<FlowResult<ScheduleExecution>> {
        let due: Vec<(Uuid, TriggerType)> = self
            .schedules
            .iter()
            .filter(|s| {
                s.status == ScheduleStatus::Active
                    && s.trigger.is_polled()
                    && s.next_execution.is_some_and(|next| next <= now)
            })
            .map(|s| (s.id, s.trigger_type()))
            .collect();

        join_all(
            due.into_iter()
                .map(|(id, origin)| self.fire(id, origin, FireInput::Configured, now)),
        )
        .await
    }

    /// Poll loop: wake on a fixed tick and fire due schedules
    pub async fn run(self: Arc<Self>) {
        let tick = Duration::from_secs(self.config.tick_seconds.max(1));
        tracing::info!("Scheduler poll loop started (tick {:?})", tick);
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    for result in self.run_due_at(Utc::now()).await {
                        if let Err(err) = result {
                            tracing::debug!("Skipped due schedule: {}", err);
                        }
                    }
                }
            }
        }
        tracing::info!("Scheduler poll loop stopped");
    }

    /// Fire every active schedule bound to `webhook_id`
    pub async fn trigger_webhook(
        self: &Arc<Self>,
        webhook_id: &str,
        payload: Value,
    ) -> FlowResult<Vec<ScheduleExecution>> {
        let bound = self.bound_schedules(|trigger| {
            matches!(trigger, Trigger::Webhook { webhook_id: id } if id == webhook_id)
        });
        self.fire_bound(bound, TriggerType::Webhook, payload, "webhook", webhook_id)
            .await
    }

    /// Fire every active schedule bound to `event_type`
    pub async fn trigger_event(
        self: &Arc<Self>,
        event_type: &str,
        payload: Value,
    ) -> FlowResult<Vec<ScheduleExecution>> {
        let bound = self.bound_schedules(|trigger| {
            matches!(trigger, Trigger::Event { event_type: ty } if ty == event_type)
        });
        self.fire_bound(bound, TriggerType::Event, payload, "event", event_type)
            .await
    }

    /// Fire one schedule now, regardless of its trigger type
    pub async fn manual_trigger(
        self: &Arc<Self>,
        schedule_id: Uuid,
        input_override: Option<Value>,
    ) -> FlowResult<ScheduleExecution> {
        let input = match input_override {
            Some(input) => FireInput::Replace(input),
            None => FireInput::Configured,
        };
        self.fire(schedule_id, TriggerType::Manual, input, Utc::now())
            .await
    }

    /// Wait for a schedule execution to finish, at most `max_wait`
    /// (capped by the configured maximum). Returns the latest record either way.
    pub async fn wait_for(
        &self,
        schedule_execution_id: Uuid,
        max_wait: Duration,
    ) -> FlowResult<ScheduleExecution> {
        let max_wait = max_wait.min(Duration::from_secs(self.config.max_wait_seconds));
        let interval = Duration::from_millis(self.config.monitor_interval_ms.max(1));
        let deadline = tokio::time::Instant::now() + max_wait;
        let registry = self.engine.registry();
        loop {
            let record = registry
                .get_schedule_execution(schedule_execution_id)
                .ok_or_else(|| FlowError::not_found("Schedule execution", schedule_execution_id))?;
            if record.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(record);
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub fn history(&self, schedule_id: Option<Uuid>, limit: usize) -> Vec<ScheduleExecution> {
        self.engine.registry().schedule_history(schedule_id, limit)
    }

    fn bound_schedules<F>(&self, matches: F) -> Vec<(Uuid, ScheduleStatus)>
    where
        F: Fn(&Trigger) -> bool,
    {
        self.schedules
            .iter()
            .filter(|s| matches(&s.trigger))
            .map(|s| (s.id, s.status))
            .collect()
    }

    async fn fire_bound(
        self: &Arc<Self>,
        bound: Vec<(Uuid, ScheduleStatus)>,
        origin: TriggerType,
        payload: Value,
        kind: &str,
        key: &str,
    ) -> FlowResult<Vec<ScheduleExecution>> {
        if bound.is_empty() {
            return Err(FlowError::not_found("Schedule", format!("{} {}", kind, key)));
        }
        let active: Vec<Uuid> = bound
            .into_iter()
            .filter(|(_, status)| *status == ScheduleStatus::Active)
            .map(|(id, _)| id)
            .collect();
        if active.is_empty() {
            return Err(FlowError::Conflict(format!(
                "No active schedule is bound to {} '{}'",
                kind, key
            )));
        }

        let now = Utc::now();
        let results = join_all(active.into_iter().map(|id| {
            self.fire(id, origin, FireInput::Merge(payload.clone()), now)
        }))
        .await;

        let mut fired = Vec::new();
        let mut last_error = None;
        for result in results {
            match result {
                Ok(record) => fired.push(record),
                Err(err) => {
                    tracing::debug!("{} '{}' skipped a schedule: {}", kind, key, err);
                    last_error = Some(err);
                }
            }
        }
        match (fired.is_empty(), last_error) {
            (true, Some(err)) => Err(err),
            _ => Ok(fired),
        }
    }
}

/// Merge a trigger payload into the configured input. Objects merge key by
/// key with the payload winning; other payloads are attached under `payload`.
fn merge_input(configured: &Value, payload: Value) -> Value {
    match (configured, payload) {
        (_, Value::Null) => configured.clone(),
        (Value::Null, payload) => payload,
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            merged.extend(extra);
            Value::Object(merged)
        }
        (Value::Object(base), payload) => {
            let mut merged = base.clone();
            merged.insert("payload".to_string(), payload);
            Value::Object(merged)
        }
        (configured, payload) => json!({ "input": configured, "payload": payload }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_input() {
        assert_eq!(
            merge_input(&json!({"a": 1, "b": 1}), json!({"b": 2})),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(merge_input(&Value::Null, json!("x")), json!("x"));
        assert_eq!(merge_input(&json!({"a": 1}), Value::Null), json!({"a": 1}));
        assert_eq!(
            merge_input(&json!({"a": 1}), json!([1])),
            json!({"a": 1, "payload": [1]})
        );
        assert_eq!(
            merge_input(&json!("report"), json!({"k": 1})),
            json!({"input": "report", "payload": {"k": 1}})
        );
    }
}
