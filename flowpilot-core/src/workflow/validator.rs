//! Workflow validation logic

use crate::error::FlowError;
use crate::models::workflow::{RetryPolicy, WorkflowDefinition};
use crate::workflow::handler::HandlerRegistry;
use std::collections::{HashSet, VecDeque};

/// Validation error type
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: String, message: String) {
        self.errors.push(ValidationError { field, message });
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Collapse errors into a single `FlowError::Validation`
    pub fn into_result(self) -> Result<Vec<String>, FlowError> {
        if self.is_valid() {
            return Ok(self.warnings);
        }
        let message = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(FlowError::Validation(message))
    }
}

/// Workflow validator
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Validate retry policy
    /// - max_attempts: 1-10
    /// - backoff_multiplier >= 1.0
    /// - initial delay not above the cap
    pub fn validate_retry_policy(policy: &RetryPolicy) -> ValidationResult {
        let mut result = ValidationResult::new();

        if policy.max_attempts < 1 {
            result.add_error(
                "max_attempts".to_string(),
                "max_attempts must be at least 1".to_string(),
            );
        }
        if policy.max_attempts > 10 {
            result.add_error(
                "max_attempts".to_string(),
                "max_attempts cannot exceed 10".to_string(),
            );
        }

        if policy.backoff_multiplier < 1.0 {
            result.add_error(
                "backoff_multiplier".to_string(),
                "backoff_multiplier must be at least 1.0".to_string(),
            );
        }

        if policy.initial_delay_ms > policy.max_delay_ms {
            result.add_error(
                "initial_delay_ms".to_string(),
                "initial_delay_ms cannot exceed max_delay_ms".to_string(),
            );
        }

        if policy.exponential_backoff && policy.backoff_multiplier > 3.0 {
            result.add_warning(format!(
                "High backoff_multiplier ({}) with exponential backoff may reach max delay quickly",
                policy.backoff_multiplier
            ));
        }

        result
    }

    /// Validate a workflow definition against the registered handlers
    pub fn validate_workflow(
        workflow: &WorkflowDefinition,
        handlers: &HandlerRegistry,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();

        if workflow.id.trim().is_empty() {
            result.add_error("id".to_string(), "Workflow id cannot be empty".to_string());
        }

        if workflow.steps.is_empty() {
            result.add_error(
                "steps".to_string(),
                "Workflow must define at least one step".to_string(),
            );
        }

        let mut seen = HashSet::new();
        for step in &workflow.steps {
            if !seen.insert(step.id.as_str()) {
                result.add_error(
                    format!("steps.{}", step.id),
                    format!("Duplicate step id '{}'", step.id),
                );
            }
        }

        if !workflow.has_step(&workflow.entry_step) {
            result.add_error(
                "entry_step".to_string(),
                format!("Entry step '{}' not found in steps", workflow.entry_step),
            );
        }

        if let Some(escalation) = &workflow.escalation_step {
            if !workflow.has_step(escalation) {
                result.add_error(
                    "escalation_step".to_string(),
                    format!("Escalation step '{}' not found in steps", escalation),
                );
            }
        }

        for (category, target) in &workflow.category_routes {
            if !workflow.has_step(target) {
                result.add_error(
                    format!("category_routes.{}", category),
                    format!("Category target step '{}' not found", target),
                );
            }
        }

        for step in &workflow.steps {
            if !handlers.contains(&step.handler) {
                result.add_error(
                    format!("steps.{}.handler", step.id),
                    format!("Handler '{}' is not registered", step.handler),
                );
            }

            for target in &step.routes {
                if !workflow.has_step(target) {
                    result.add_error(
                        format!("steps.{}.routes", step.id),
                        format!("Route target step '{}' not found", target),
                    );
                }
            }

            if let Some(next) = &step.default_next {
                if !workflow.has_step(next) {
                    result.add_error(
                        format!("steps.{}.default_next", step.id),
                        format!("Default step '{}' not found", next),
                    );
                } else if !step.routes.is_empty() && !step.routes.contains(next) {
                    result.add_warning(format!(
                        "Step '{}' defaults to '{}' which is not among its declared routes",
                        step.id, next
                    ));
                }
            }

            if step.classify && workflow.category_routes.is_empty() {
                result.add_warning(format!(
                    "Step '{}' classifies output but the workflow has no category routes",
                    step.id
                ));
            }

            if step.timeout_seconds == Some(0) {
                result.add_error(
                    format!("steps.{}.timeout_seconds", step.id),
                    "timeout_seconds must be at least 1".to_string(),
                );
            }

            if let Some(policy) = &step.retry_policy {
                let policy_validation = Self::validate_retry_policy(policy);
                for error in policy_validation.errors {
                    result.add_error(
                        format!("steps.{}.retry_policy.{}", step.id, error.field),
                        error.message,
                    );
                }
                for warning in policy_validation.warnings {
                    result.add_warning(format!("Step '{}': {}", step.id, warning));
                }
            }
        }

        if let Some(schema) = &workflow.input_schema {
            if let Err(e) = jsonschema::JSONSchema::compile(schema) {
                result.add_error("input_schema".to_string(), format!("Invalid schema: {}", e));
            }
        }

        for step_id in Self::find_unreachable_steps(workflow) {
            result.add_warning(format!(
                "Step '{}' is unreachable from entry step '{}'",
                step_id, workflow.entry_step
            ));
        }

        result
    }

    /// Steps not reachable from the entry step through any declared edge
    fn find_unreachable_steps(workflow: &WorkflowDefinition) -> Vec<String> {
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(workflow.entry_step.as_str());
        if let Some(escalation) = &workflow.escalation_step {
            queue.push_back(escalation.as_str());
        }

        while let Some(step_id) = queue.pop_front() {
            if !reachable.insert(step_id) {
                continue;
            }
            let Some(step) = workflow.step(step_id) else {
                continue;
            };
            let mut targets: Vec<&str> = step.routes.iter().map(String::as_str).collect();
            targets.extend(step.default_next.as_deref());
            if step.classify {
                targets.extend(workflow.category_routes.values().map(String::as_str));
            }
            queue.extend(targets.into_iter().filter(|t| !reachable.contains(t)));
        }

        workflow
            .steps
            .iter()
            .filter(|s| !reachable.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::StepDefinition;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            version: 0,
            description: None,
            entry_step: "start".into(),
            steps,
            escalation_step: None,
            category_routes: BTreeMap::new(),
            input_schema: None,
        }
    }

    #[test]
    fn test_valid_linear_workflow() {
        let wf = workflow(vec![
            StepDefinition::new("start", "echo").then("review"),
            StepDefinition::new("review", "approval"),
        ]);
        let result = WorkflowValidator::validate_workflow(&wf, &HandlerRegistry::with_builtins());
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_unknown_step_and_handler() {
        let mut wf = workflow(vec![StepDefinition::new("start", "crm_agent").then("missing")]);
        wf.escalation_step = Some("nowhere".into());

        let result = WorkflowValidator::validate_workflow(&wf, &HandlerRegistry::with_builtins());
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"steps.start.handler"));
        assert!(fields.contains(&"steps.start.routes"));
        assert!(fields.contains(&"steps.start.default_next"));
        assert!(fields.contains(&"escalation_step"));

        let err = result.into_result().unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }

    #[test]
    fn test_duplicate_steps_rejected() {
        let wf = workflow(vec![
            StepDefinition::new("start", "echo"),
            StepDefinition::new("start", "echo"),
        ]);
        let result = WorkflowValidator::validate_workflow(&wf, &HandlerRegistry::with_builtins());
        assert!(!result.is_valid());
    }

    #[test]
    fn test_unreachable_step_warning() {
        let wf = workflow(vec![
            StepDefinition::new("start", "echo"),
            StepDefinition::new("orphan", "echo"),
        ]);
        let result = WorkflowValidator::validate_workflow(&wf, &HandlerRegistry::with_builtins());
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("orphan")));
    }

    #[test]
    fn test_invalid_input_schema() {
        let mut wf = workflow(vec![StepDefinition::new("start", "echo")]);
        wf.input_schema = Some(json!({"type": 12}));
        let result = WorkflowValidator::validate_workflow(&wf, &HandlerRegistry::with_builtins());
        assert!(result.errors.iter().any(|e| e.field == "input_schema"));
    }

    #[test]
    fn test_retry_policy_bounds() {
        let policy = RetryPolicy {
            max_attempts: 11,
            initial_delay_ms: 100,
            exponential_backoff: true,
            backoff_multiplier: 0.5,
            max_delay_ms: 1000,
        };
        let result = WorkflowValidator::validate_retry_policy(&policy);
        assert_eq!(result.errors.len(), 2);
    }
}
